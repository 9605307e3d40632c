//! Pointers, rows and the conflict order shared by every index.
//!
//! Two pointers for the same key are ordered by `(timestamp, version)`. An
//! incoming pointer replaces an existing one only when its pair is strictly
//! greater. Equal pairs keep the existing pointer, which makes re-merging the
//! same input a no-op reported as [`MergeMode::Ignored`].

use crate::key::CompositeKey;
use serde::{Deserialize, Serialize};

/// File pointer value meaning "not stored in any log".
pub const NO_FP: i64 = -1;

/// Indexed metadata describing the latest known version of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pointer {
    pub fp: i64,
    pub timestamp: i64,
    pub tombstoned: bool,
    pub version: i64,
    pub value: Option<Vec<u8>>,
}

impl Pointer {
    /// The absence sentinel, never a real row.
    pub fn absent() -> Self {
        Self {
            fp: NO_FP,
            timestamp: -1,
            tombstoned: false,
            version: -1,
            value: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.fp == NO_FP && self.value.is_none()
    }

    /// Whether a row backs this pointer, either in a log or inline.
    pub fn has_value(&self) -> bool {
        !self.is_absent()
    }

    pub fn is_live(&self) -> bool {
        !self.tombstoned && self.has_value()
    }

    pub fn order(&self) -> (i64, i64) {
        (self.timestamp, self.version)
    }

    /// Strictly newer under the `(timestamp, version)` order.
    pub fn supersedes(&self, existing: &Pointer) -> bool {
        self.order() > existing.order()
    }
}

/// Outcome of merging one pointer into an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MergeMode {
    Added,
    Clobbered,
    Ignored,
}

/// Decides how `incoming` lands against what the index currently holds.
pub fn resolve(existing: Option<&Pointer>, incoming: &Pointer) -> MergeMode {
    match existing {
        None => MergeMode::Added,
        Some(existing) if existing.is_absent() => MergeMode::Added,
        Some(existing) if incoming.supersedes(existing) => MergeMode::Clobbered,
        Some(existing) => {
            if existing.order() == incoming.order()
                && (existing.tombstoned != incoming.tombstoned || existing.value != incoming.value)
            {
                tracing::warn!(
                    timestamp = incoming.timestamp,
                    version = incoming.version,
                    "Distinct writes share a (timestamp, version); keeping the first"
                );
            }
            MergeMode::Ignored
        }
    }
}

/// Net change in live rows if `incoming` were merged over `existing`.
pub fn live_delta(existing: Option<&Pointer>, incoming: &Pointer) -> i64 {
    match existing.filter(|p| p.has_value()) {
        None => {
            if incoming.tombstoned {
                0
            } else {
                1
            }
        }
        Some(existing) => {
            if !incoming.supersedes(existing) {
                return 0;
            }
            match (existing.tombstoned, incoming.tombstoned) {
                (false, false) | (true, true) => 0,
                (false, true) => -1,
                (true, false) => 1,
            }
        }
    }
}

/// One pointer update fed to [`crate::index::PointerIndex::merge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub tx_id: i64,
    pub key: CompositeKey,
    pub pointer: Pointer,
}

/// Result of merging one [`IndexEntry`]; `pointer` is what the index holds afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Merged {
    pub mode: MergeMode,
    pub tx_id: i64,
    pub key: CompositeKey,
    pub pointer: Pointer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPresence {
    pub contained: bool,
    pub timestamp: i64,
    pub version: i64,
}

impl KeyPresence {
    pub fn of(pointer: Option<&Pointer>) -> Self {
        match pointer.filter(|p| p.has_value()) {
            Some(p) => Self {
                contained: !p.tombstoned,
                timestamp: p.timestamp,
                version: p.version,
            },
            None => Self {
                contained: false,
                timestamp: -1,
                version: -1,
            },
        }
    }
}

/// A row version as stored in an append log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub tx_id: i64,
    pub prefix: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: i64,
    pub tombstoned: bool,
    pub version: i64,
}

impl Row {
    pub fn composite_key(&self) -> CompositeKey {
        CompositeKey::new(&self.prefix, &self.key)
    }

    /// Pointer to this row at `fp`, inlining the value when it is small enough.
    pub fn pointer(&self, fp: i64, inline_threshold: usize) -> Pointer {
        let value = match &self.value {
            Some(v) if !self.tombstoned && v.len() <= inline_threshold => Some(v.clone()),
            _ => None,
        };
        Pointer {
            fp,
            timestamp: self.timestamp,
            tombstoned: self.tombstoned,
            version: self.version,
            value,
        }
    }

    pub fn index_entry(&self, fp: i64, inline_threshold: usize) -> IndexEntry {
        IndexEntry {
            tx_id: self.tx_id,
            key: self.composite_key(),
            pointer: self.pointer(fp, inline_threshold),
        }
    }
}

/// A client write within one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub timestamp: i64,
    pub version: i64,
    pub tombstoned: bool,
}

impl Update {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>, timestamp: i64, version: i64) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp,
            version,
            tombstoned: false,
        }
    }

    pub fn remove(key: impl Into<Vec<u8>>, timestamp: i64, version: i64) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp,
            version,
            tombstoned: true,
        }
    }

    pub(crate) fn into_row(self, tx_id: i64, prefix: &[u8]) -> Row {
        Row {
            tx_id,
            prefix: prefix.to_vec(),
            key: self.key,
            value: if self.tombstoned { None } else { self.value },
            timestamp: self.timestamp,
            tombstoned: self.tombstoned,
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampedValue {
    pub value: Vec<u8>,
    pub timestamp: i64,
    pub version: i64,
}

/// One entry streamed by `take_prefix_updates_since`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixUpdate {
    pub tx_id: i64,
    pub fp: i64,
    pub has_value: bool,
    pub value: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(timestamp: i64, version: i64, tombstoned: bool) -> Pointer {
        Pointer {
            fp: 1,
            timestamp,
            tombstoned,
            version,
            value: None,
        }
    }

    #[test]
    fn test_absent_sentinel() {
        let absent = Pointer::absent();
        assert!(absent.is_absent());
        assert!(!absent.has_value());

        let inline = Pointer {
            fp: NO_FP,
            value: Some(b"v".to_vec()),
            ..ptr(1, 1, false)
        };
        assert!(!inline.is_absent());
        assert!(inline.is_live());
    }

    #[test]
    fn test_resolve_order() {
        let existing = ptr(10, 1, false);
        assert_eq!(resolve(None, &existing), MergeMode::Added);
        assert_eq!(resolve(Some(&existing), &ptr(10, 2, false)), MergeMode::Clobbered);
        assert_eq!(resolve(Some(&existing), &ptr(11, 0, false)), MergeMode::Clobbered);
        assert_eq!(resolve(Some(&existing), &ptr(9, 99, false)), MergeMode::Ignored);
        assert_eq!(resolve(Some(&existing), &existing.clone()), MergeMode::Ignored);
    }

    #[test]
    fn test_equal_order_keeps_existing() {
        let existing = ptr(5, 5, false);
        let rival = ptr(5, 5, true);
        assert_eq!(resolve(Some(&existing), &rival), MergeMode::Ignored);
    }

    #[test]
    fn test_live_delta_truth_table() {
        let none: Option<&Pointer> = None;
        assert_eq!(live_delta(none, &ptr(1, 1, false)), 1);
        assert_eq!(live_delta(none, &ptr(1, 1, true)), 0);
        assert_eq!(live_delta(Some(&ptr(1, 1, false)), &ptr(2, 1, false)), 0);
        assert_eq!(live_delta(Some(&ptr(1, 1, false)), &ptr(2, 1, true)), -1);
        assert_eq!(live_delta(Some(&ptr(1, 1, true)), &ptr(2, 1, false)), 1);
        assert_eq!(live_delta(Some(&ptr(1, 1, true)), &ptr(2, 1, true)), 0);
        // A losing update changes nothing
        assert_eq!(live_delta(Some(&ptr(3, 1, false)), &ptr(2, 1, true)), 0);
    }

    #[test]
    fn test_row_pointer_inlines_small_values() {
        let row = Row {
            tx_id: 1,
            prefix: b"p".to_vec(),
            key: b"k".to_vec(),
            value: Some(b"small".to_vec()),
            timestamp: 1,
            tombstoned: false,
            version: 1,
        };
        assert_eq!(row.pointer(40, 8).value, Some(b"small".to_vec()));
        assert_eq!(row.pointer(40, 2).value, None);
        assert_eq!(row.pointer(40, 2).fp, 40);
    }
}
