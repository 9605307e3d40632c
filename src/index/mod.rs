//! Pointer indexes: key → latest [`Pointer`], with one conflict-merge contract.
//!
//! Every backend resolves merges with [`crate::pointer::resolve`] under a
//! per-key stripe lock, so concurrent merges of distinct keys proceed in
//! parallel while merges of the same key serialize through the comparison.
//! A merge is atomic per key, not per batch: an error mid-batch leaves the
//! earlier keys applied, and re-merging the batch is safe.
//!
//! Alongside pointers each index keeps a transaction log (per prefix and
//! global) of the updates that won, keyed by `(txId, fp)`. It answers "what
//! changed after txId X" without scanning the pointers.

pub mod lsm;
pub mod memory;

pub use lsm::LsmPointerIndex;
pub use memory::MemoryPointerIndex;

use crate::error::Result;
use crate::key::CompositeKey;
use crate::pointer::{
    live_delta, IndexEntry, KeyPresence, MergeMode, Merged, Pointer, PrefixUpdate,
};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

pub type SideEffect<'a> = Box<dyn FnOnce() -> Result<()> + 'a>;

/// Visitor over `(key, pointer)` pairs; return `false` to stop.
pub type PointerVisitor<'a> = dyn FnMut(&CompositeKey, &Pointer) -> Result<bool> + 'a;

pub trait PointerIndex: Send + Sync {
    fn name(&self) -> &'static str;

    /// Number of completed compactions; names the base log this index points into.
    fn generation(&self) -> u64;

    /// Stripe the active index lives in.
    fn stripe(&self) -> u32;

    fn merge(&self, entries: &[IndexEntry]) -> Result<Vec<Merged>>;

    fn get_pointer(&self, key: &CompositeKey) -> Result<Option<Pointer>>;

    fn get_pointers(&self, keys: &[CompositeKey]) -> Result<Vec<Option<Pointer>>> {
        keys.iter().map(|key| self.get_pointer(key)).collect()
    }

    fn contains_keys(&self, keys: &[CompositeKey]) -> Result<Vec<KeyPresence>> {
        Ok(self
            .get_pointers(keys)?
            .iter()
            .map(|pointer| KeyPresence::of(pointer.as_ref()))
            .collect())
    }

    /// Net change in live rows if `candidates` were merged, without merging them.
    fn delta_count(&self, candidates: &[IndexEntry]) -> Result<i64> {
        let mut pending: HashMap<&CompositeKey, Pointer> = HashMap::new();
        let mut delta = 0;
        for entry in candidates {
            let existing = match pending.get(&entry.key) {
                Some(pointer) => Some(pointer.clone()),
                None => self.get_pointer(&entry.key)?,
            };
            delta += live_delta(existing.as_ref(), &entry.pointer);
            let wins = existing
                .as_ref()
                .map_or(true, |e| !e.has_value() || entry.pointer.supersedes(e));
            if wins {
                pending.insert(&entry.key, entry.pointer.clone());
            }
        }
        Ok(delta)
    }

    /// Visits pointers from `from` toward `to`; descending when `from > to`.
    fn range_scan(
        &self,
        from: Option<&CompositeKey>,
        to: Option<&CompositeKey>,
        visitor: &mut PointerVisitor<'_>,
    ) -> Result<()>;

    fn row_scan(&self, visitor: &mut PointerVisitor<'_>) -> Result<()> {
        self.range_scan(None, None, visitor)
    }

    /// Winning updates under `prefix` with `txId > since_tx_id`, in txId order.
    fn take_prefix_updates_since(
        &self,
        prefix: &[u8],
        since_tx_id: i64,
        visitor: &mut dyn FnMut(PrefixUpdate) -> Result<bool>,
    ) -> Result<()>;

    /// Winning updates of every prefix with `txId > since_tx_id`, in txId order.
    fn take_updates_since(
        &self,
        since_tx_id: i64,
        visitor: &mut dyn FnMut(&[u8], PrefixUpdate) -> Result<bool>,
    ) -> Result<()>;

    /// Live (non-tombstoned) keys.
    fn count(&self) -> Result<u64>;

    fn stats(&self) -> IndexStats;

    /// Whether `(clobbered + 1) / (added + 1)` exceeds `factor`.
    fn needs_compaction(&self, factor: f64) -> bool {
        let stats = self.stats();
        (stats.clobbered as f64 + 1.0) / (stats.added as f64 + 1.0) > factor
    }

    /// Starts building a replacement index at `target_stripe`. Only one
    /// compaction may be in flight.
    fn start_compaction(
        &self,
        has_active: bool,
        target_stripe: u32,
    ) -> Result<Box<dyn CompactionHandle + '_>>;

    fn flush(&self, fsync: bool) -> Result<()>;

    /// Drops all storage. Waits for in-flight operations through the gate.
    fn expunge(&self) -> Result<()>;
}

/// A replacement index under construction.
pub trait CompactionHandle {
    /// Merges rows with the same comparator as [`PointerIndex::merge`].
    fn merge(&mut self, entries: &[IndexEntry]) -> Result<Vec<Merged>>;

    /// Swaps the replacement in under exclusive access, runs `side_effect`
    /// inside the same window, and releases access afterwards. If the side
    /// effect fails the previous index is restored.
    fn commit(self: Box<Self>, fsync: bool, side_effect: Option<SideEffect<'_>>) -> Result<()>;

    /// Discards the replacement; the active index is untouched.
    fn abort(self: Box<Self>) -> Result<()>;
}

/// Counters driving the compaction trigger, reset when a compaction commits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub added: u64,
    pub clobbered: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    added: AtomicU64,
    clobbered: AtomicU64,
}

impl Counters {
    pub(crate) fn record(&self, mode: MergeMode) {
        match mode {
            MergeMode::Added => self.added.fetch_add(1, Ordering::Relaxed),
            MergeMode::Clobbered => self.clobbered.fetch_add(1, Ordering::Relaxed),
            MergeMode::Ignored => 0,
        };
    }

    pub(crate) fn reset(&self) {
        self.added.store(0, Ordering::Relaxed);
        self.clobbered.store(0, Ordering::Relaxed);
    }

    pub(crate) fn stats(&self) -> IndexStats {
        IndexStats {
            added: self.added.load(Ordering::Relaxed),
            clobbered: self.clobbered.load(Ordering::Relaxed),
        }
    }
}

/// Striped mutexes serializing read-compare-write per key.
#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    pub fn lock(&self, key: &CompositeKey) -> Result<MutexGuard<'_, ()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() % self.stripes.len() as u64) as usize;
        Ok(self.stripes[stripe].lock()?)
    }
}

/// Key bounds and direction of a range scan.
#[derive(Debug, Clone)]
pub struct ScanRange {
    pub lower: Bound<Vec<u8>>,
    pub upper: Bound<Vec<u8>>,
    pub reverse: bool,
}

impl ScanRange {
    /// `from` is inclusive and `to` exclusive in both directions.
    pub fn new(from: Option<&CompositeKey>, to: Option<&CompositeKey>) -> Self {
        let bytes = |k: &CompositeKey| k.as_bytes().to_vec();
        match (from, to) {
            (Some(from), Some(to)) if from > to => Self {
                lower: Bound::Excluded(bytes(to)),
                upper: Bound::Included(bytes(from)),
                reverse: true,
            },
            _ => Self {
                lower: from.map_or(Bound::Unbounded, |k| Bound::Included(bytes(k))),
                upper: to.map_or(Bound::Unbounded, |k| Bound::Excluded(bytes(k))),
                reverse: false,
            },
        }
    }

    pub fn as_refs(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        fn borrow(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
            match bound {
                Bound::Included(b) => Bound::Included(b.as_slice()),
                Bound::Excluded(b) => Bound::Excluded(b.as_slice()),
                Bound::Unbounded => Bound::Unbounded,
            }
        }
        (borrow(&self.lower), borrow(&self.upper))
    }

    /// The same bounds with `tag` prepended to every key.
    pub(crate) fn tagged(&self, tag: u8) -> (Bound<Vec<u8>>, Bound<Vec<u8>>) {
        let with_tag = |bytes: &Vec<u8>| {
            let mut tagged = Vec::with_capacity(bytes.len() + 1);
            tagged.push(tag);
            tagged.extend_from_slice(bytes);
            tagged
        };
        let lower = match &self.lower {
            Bound::Included(b) => Bound::Included(with_tag(b)),
            Bound::Excluded(b) => Bound::Excluded(with_tag(b)),
            Bound::Unbounded => Bound::Included(vec![tag]),
        };
        let upper = match &self.upper {
            Bound::Included(b) => Bound::Included(with_tag(b)),
            Bound::Excluded(b) => Bound::Excluded(with_tag(b)),
            Bound::Unbounded => Bound::Excluded(vec![tag + 1]),
        };
        (lower, upper)
    }
}

/// Order-preserving encoding of a signed id: flip the sign bit, big-endian.
pub(crate) fn encode_id(id: i64) -> [u8; 8] {
    ((id as u64) ^ (1u64 << 63)).to_be_bytes()
}

/// `len(prefix) ‖ prefix ‖ txId ‖ fp` key of the per-prefix transaction log.
pub(crate) fn prefix_tx_key(prefix: &[u8], tx_id: i64, fp: i64) -> Vec<u8> {
    let mut key = CompositeKey::new(prefix, &[]).into_bytes();
    key.extend_from_slice(&encode_id(tx_id));
    key.extend_from_slice(&encode_id(fp));
    key
}

/// `txId ‖ fp` key of the global transaction log.
pub(crate) fn global_tx_key(tx_id: i64, fp: i64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&encode_id(tx_id));
    key.extend_from_slice(&encode_id(fp));
    key
}

/// Transaction-log update recorded for a merge that won.
pub(crate) fn prefix_update(tx_id: i64, pointer: &Pointer) -> PrefixUpdate {
    PrefixUpdate {
        tx_id,
        fp: pointer.fp,
        has_value: !pointer.tombstoned,
        value: pointer.value.clone(),
    }
}

#[cfg(test)]
pub(crate) mod contract {
    //! Behaviour every backend must share; each backend's tests call these.

    use super::*;
    use crate::pointer::MergeMode;

    pub fn entry(
        tx_id: i64,
        prefix: &str,
        key: &str,
        ts: i64,
        version: i64,
        tombstoned: bool,
        value: &str,
    ) -> IndexEntry {
        IndexEntry {
            tx_id,
            key: CompositeKey::new(prefix.as_bytes(), key.as_bytes()),
            pointer: Pointer {
                fp: tx_id * 100,
                timestamp: ts,
                tombstoned,
                version,
                value: if tombstoned { None } else { Some(value.as_bytes().to_vec()) },
            },
        }
    }

    pub fn clobber_and_ignore(index: &dyn PointerIndex) -> Result<()> {
        let key = CompositeKey::new(b"p", b"K");

        let first = index.merge(&[entry(1, "p", "K", 10, 1, false, "a")])?;
        assert_eq!(first[0].mode, MergeMode::Added);

        let second = index.merge(&[entry(2, "p", "K", 10, 2, false, "b")])?;
        assert_eq!(second[0].mode, MergeMode::Clobbered);

        let third = index.merge(&[entry(3, "p", "K", 9, 99, false, "c")])?;
        assert_eq!(third[0].mode, MergeMode::Ignored);
        assert_eq!(third[0].pointer.value, Some(b"b".to_vec()));

        let pointer = index.get_pointer(&key)?.expect("pointer present");
        assert_eq!(pointer.value, Some(b"b".to_vec()));
        assert_eq!(pointer.order(), (10, 2));
        Ok(())
    }

    pub fn idempotent_merge(index: &dyn PointerIndex) -> Result<()> {
        let e = entry(1, "p", "k", 5, 5, false, "v");
        assert_eq!(index.merge(&[e.clone()])?[0].mode, MergeMode::Added);
        let before = index.get_pointer(&e.key)?;
        assert_eq!(index.merge(&[e.clone()])?[0].mode, MergeMode::Ignored);
        assert_eq!(index.get_pointer(&e.key)?, before);
        Ok(())
    }

    pub fn last_writer_wins_any_order(make: &dyn Fn() -> Box<dyn PointerIndex>) -> Result<()> {
        let versions = [(3, 1), (1, 7), (3, 2), (2, 9), (0, 0)];
        let orders: [[usize; 5]; 4] = [[0, 1, 2, 3, 4], [4, 3, 2, 1, 0], [2, 0, 4, 1, 3], [1, 2, 3, 4, 0]];
        for order in orders {
            let index = make();
            for (i, pick) in order.iter().enumerate() {
                let (ts, v) = versions[*pick];
                index.merge(&[entry(i as i64 + 1, "p", "k", ts, v, false, &format!("{}-{}", ts, v))])?;
            }
            let pointer = index.get_pointer(&CompositeKey::new(b"p", b"k"))?.unwrap();
            assert_eq!(pointer.order(), (3, 2));
            assert_eq!(pointer.value, Some(b"3-2".to_vec()));
        }
        Ok(())
    }

    pub fn scans_in_both_directions(index: &dyn PointerIndex) -> Result<()> {
        for (i, k) in ["a", "b", "c", "d"].iter().enumerate() {
            index.merge(&[entry(i as i64 + 1, "p", k, 1, 1, false, k)])?;
        }
        index.merge(&[entry(9, "q", "a", 1, 1, false, "other")])?;

        let collect = |from: Option<CompositeKey>, to: Option<CompositeKey>| -> Result<Vec<Vec<u8>>> {
            let mut keys = Vec::new();
            index.range_scan(from.as_ref(), to.as_ref(), &mut |k, _| {
                keys.push(k.key().to_vec());
                Ok(true)
            })?;
            Ok(keys)
        };
        let k = |s: &str| Some(CompositeKey::new(b"p", s.as_bytes()));

        assert_eq!(collect(k("b"), k("d"))?, vec![b"b".to_vec(), b"c".to_vec()]);
        assert_eq!(collect(k("d"), k("a"))?, vec![b"d".to_vec(), b"c".to_vec(), b"b".to_vec()]);
        assert_eq!(collect(None, None)?.len(), 5);
        assert_eq!(collect(k("c"), None)?.len(), 3);
        Ok(())
    }

    pub fn contains_and_counts(index: &dyn PointerIndex) -> Result<()> {
        index.merge(&[
            entry(1, "p", "live", 1, 1, false, "v"),
            entry(1, "p", "dead", 1, 1, true, ""),
        ])?;
        let keys = [
            CompositeKey::new(b"p", b"live"),
            CompositeKey::new(b"p", b"dead"),
            CompositeKey::new(b"p", b"missing"),
        ];
        let presence = index.contains_keys(&keys)?;
        assert!(presence[0].contained);
        assert!(!presence[1].contained);
        assert_eq!(presence[1].timestamp, 1);
        assert!(!presence[2].contained);
        assert_eq!(index.count()?, 1);
        Ok(())
    }

    pub fn prefix_scoped_take(index: &dyn PointerIndex) -> Result<()> {
        for tx in 1..=6 {
            let prefix = if tx % 2 == 0 { "P2" } else { "P1" };
            index.merge(&[entry(tx, prefix, &format!("k{}", tx), tx, 1, false, "v")])?;
        }

        let mut taken = Vec::new();
        index.take_prefix_updates_since(b"P1", 1, &mut |update| {
            taken.push(update.tx_id);
            Ok(true)
        })?;
        assert_eq!(taken, vec![3, 5]);

        let mut global = Vec::new();
        index.take_updates_since(3, &mut |prefix, update| {
            global.push((prefix.to_vec(), update.tx_id));
            Ok(true)
        })?;
        assert_eq!(
            global,
            vec![(b"P2".to_vec(), 4), (b"P1".to_vec(), 5), (b"P2".to_vec(), 6)]
        );
        Ok(())
    }

    pub fn single_compaction_in_flight(index: &dyn PointerIndex) -> Result<()> {
        let handle = index.start_compaction(true, index.stripe())?;
        assert!(matches!(
            index.start_compaction(true, index.stripe()),
            Err(crate::Error::CompactionInProgress)
        ));
        handle.abort()?;
        let again = index.start_compaction(true, index.stripe())?;
        again.abort()?;
        Ok(())
    }

    pub fn compaction_swaps_contents(index: &dyn PointerIndex) -> Result<()> {
        index.merge(&[
            entry(1, "p", "keep", 1, 1, false, "old"),
            entry(2, "p", "drop", 1, 1, true, ""),
        ])?;
        index.merge(&[entry(3, "p", "keep", 2, 1, false, "new")])?;
        assert_eq!(index.stats().clobbered, 1);

        let generation = index.generation();
        let mut live = Vec::new();
        index.row_scan(&mut |key, pointer| {
            if !pointer.tombstoned {
                live.push(IndexEntry {
                    tx_id: 3,
                    key: key.clone(),
                    pointer: pointer.clone(),
                });
            }
            Ok(true)
        })?;

        let mut handle = index.start_compaction(true, index.stripe())?;
        let merged = handle.merge(&live)?;
        assert!(merged.iter().all(|m| m.mode == MergeMode::Added));

        let mut side_effect_ran = false;
        handle.commit(true, Some(Box::new(|| -> Result<()> {
            side_effect_ran = true;
            Ok(())
        })))?;
        assert!(side_effect_ran);

        assert_eq!(index.generation(), generation + 1);
        assert_eq!(index.stats(), IndexStats::default());
        assert!(index.get_pointer(&CompositeKey::new(b"p", b"drop"))?.is_none());
        let keep = index.get_pointer(&CompositeKey::new(b"p", b"keep"))?.unwrap();
        assert_eq!(keep.value, Some(b"new".to_vec()));
        Ok(())
    }

    pub fn failed_side_effect_keeps_active(index: &dyn PointerIndex) -> Result<()> {
        index.merge(&[entry(1, "p", "k", 1, 1, false, "v")])?;
        let generation = index.generation();

        let handle = index.start_compaction(true, index.stripe())?;
        let result = handle.commit(
            true,
            Some(Box::new(|| -> Result<()> {
                Err(crate::Error::InvalidState("refused".into()))
            })),
        );
        assert!(result.is_err());
        assert_eq!(index.generation(), generation);
        assert!(index.get_pointer(&CompositeKey::new(b"p", b"k"))?.is_some());

        // The failed attempt released the compaction slot.
        index.start_compaction(true, index.stripe())?.abort()?;
        Ok(())
    }
}
