//! One generation of buffered writes.
//!
//! Rows land in the generation's own log first; only then are they made
//! visible through the hash index (point reads) and the ordered index (range
//! scans). Both indexes hold the same `Arc<Pointer>` and change together under
//! one write lock. Every append also extends the transaction log, which must
//! grow in strictly increasing `txId` order per prefix; a violation poisons
//! the generation.

use crate::error::Result;
use crate::key::CompositeKey;
use crate::log::{FileRowLog, LogEntry, RowLog};
use crate::pointer::{Pointer, Row};
use crate::Error;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Fps written by one transaction under one prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub tx_id: i64,
    pub prefix: Vec<u8>,
    pub fps: Vec<i64>,
}

#[derive(Default)]
struct DeltaState {
    by_key: HashMap<CompositeKey, Arc<Pointer>>,
    ordered: BTreeMap<CompositeKey, Arc<Pointer>>,
    by_prefix: HashMap<Vec<u8>, Vec<TxEntry>>,
    global: Vec<TxEntry>,
    rows: usize,
}

impl DeltaState {
    fn check_order(&self, prefix: &[u8], tx_id: i64) -> Result<()> {
        match self.by_prefix.get(prefix).and_then(|entries| entries.last()) {
            Some(last) if last.tx_id > tx_id => Err(Error::TxOrderViolation {
                prefix: prefix.to_vec(),
                last: last.tx_id,
                incoming: tx_id,
            }),
            _ => Ok(()),
        }
    }

    /// Checks that every row of `rows` continues its prefix's `txId` order.
    fn check_batch(&self, rows: &[Row]) -> Result<()> {
        let mut last: HashMap<&[u8], i64> = HashMap::new();
        for row in rows {
            match last.get(row.prefix.as_slice()) {
                Some(previous) if *previous > row.tx_id => {
                    return Err(Error::TxOrderViolation {
                        prefix: row.prefix.clone(),
                        last: *previous,
                        incoming: row.tx_id,
                    })
                }
                Some(_) => {}
                None => self.check_order(&row.prefix, row.tx_id)?,
            }
            last.insert(row.prefix.as_slice(), row.tx_id);
        }
        Ok(())
    }

    fn record_tx(&mut self, prefix: &[u8], tx_id: i64, fp: i64) {
        let entries = self.by_prefix.entry(prefix.to_vec()).or_default();
        match entries.last_mut() {
            Some(last) if last.tx_id == tx_id => last.fps.push(fp),
            _ => entries.push(TxEntry {
                tx_id,
                prefix: prefix.to_vec(),
                fps: vec![fp],
            }),
        }

        match self.global.last_mut() {
            Some(last) if last.tx_id == tx_id && last.prefix == prefix => last.fps.push(fp),
            _ => self.global.push(TxEntry {
                tx_id,
                prefix: prefix.to_vec(),
                fps: vec![fp],
            }),
        }
    }

    fn install(&mut self, key: CompositeKey, pointer: Pointer) {
        // A row that loses to what this generation already holds stays in
        // the log but not in the indexes.
        if let Some(existing) = self.by_key.get(&key) {
            if !pointer.supersedes(existing) {
                return;
            }
        }
        let pointer = Arc::new(pointer);
        self.by_key.insert(key.clone(), pointer.clone());
        self.ordered.insert(key, pointer);
    }
}

/// Progress recorded by merge markers in this generation's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeProgress {
    pub highest_tx_id: i64,
    pub complete: bool,
}

pub struct PartitionDelta {
    generation: u64,
    log: FileRowLog,
    inline_threshold: usize,
    state: RwLock<DeltaState>,
    append_lock: Mutex<()>,
    merging: RwLock<Option<Arc<PartitionDelta>>>,
    poisoned: AtomicBool,
    merged_through: AtomicI64,
    merge_complete: AtomicBool,
}

pub(crate) fn log_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("{:08}.log", generation))
}

impl PartitionDelta {
    /// Opens generation `generation` under `dir`, replaying its log.
    pub fn open(
        dir: &Path,
        generation: u64,
        inline_threshold: usize,
        merging: Option<Arc<PartitionDelta>>,
    ) -> Result<Self> {
        let log = FileRowLog::open(log_path(dir, generation))?;
        let delta = Self {
            generation,
            log,
            inline_threshold,
            state: RwLock::new(DeltaState::default()),
            append_lock: Mutex::new(()),
            merging: RwLock::new(merging),
            poisoned: AtomicBool::new(false),
            merged_through: AtomicI64::new(i64::MIN),
            merge_complete: AtomicBool::new(false),
        };
        delta.replay()?;
        Ok(delta)
    }

    fn replay(&self) -> Result<()> {
        let mut state = self.state.write()?;
        let mut rows = 0usize;
        self.log.scan(None, false, &mut |fp, entry| {
            match entry {
                LogEntry::Row(row) => {
                    state.check_order(&row.prefix, row.tx_id)?;
                    state.record_tx(&row.prefix, row.tx_id, fp);
                    state.install(row.composite_key(), row.pointer(fp, self.inline_threshold));
                    state.rows += 1;
                    rows += 1;
                }
                LogEntry::MergeMarker {
                    highest_tx_id,
                    complete,
                } => {
                    self.merged_through.store(highest_tx_id, Ordering::SeqCst);
                    self.merge_complete.store(complete, Ordering::SeqCst);
                }
            }
            Ok(true)
        })?;
        if rows > 0 {
            tracing::debug!(generation = self.generation, rows, "Replayed delta log");
        }
        Ok(())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn log(&self) -> &FileRowLog {
        &self.log
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Rows appended to this generation.
    pub fn len(&self) -> Result<usize> {
        Ok(self.state.read()?.rows)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn merging(&self) -> Result<Option<Arc<PartitionDelta>>> {
        Ok(self.merging.read()?.clone())
    }

    /// Drops the back-reference once `merged` has fully reached the base.
    pub(crate) fn clear_merging(&self, merged: &Arc<PartitionDelta>) -> Result<bool> {
        let mut slot = self.merging.write()?;
        match slot.as_ref() {
            Some(current) if Arc::ptr_eq(current, merged) => {
                *slot = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn merge_progress(&self) -> MergeProgress {
        MergeProgress {
            highest_tx_id: self.merged_through.load(Ordering::SeqCst),
            complete: self.merge_complete.load(Ordering::SeqCst),
        }
    }

    /// Appends rows of transactions at or after the last one seen per prefix.
    /// Returns the pointers installed, one per row.
    pub fn append(&self, rows: &[Row]) -> Result<Vec<(CompositeKey, Pointer)>> {
        if self.is_poisoned() {
            return Err(Error::DeltaPoisoned);
        }
        let _append = self.append_lock.lock()?;

        if let Err(e) = self.state.read()?.check_batch(rows) {
            self.poisoned.store(true, Ordering::SeqCst);
            tracing::error!(generation = self.generation, error = %e, "Poisoned delta");
            return Err(e);
        }

        let fps = self.log.append_rows(rows)?;

        let mut state = self.state.write()?;
        let mut installed = Vec::with_capacity(rows.len());
        for (row, fp) in rows.iter().zip(fps) {
            state.record_tx(&row.prefix, row.tx_id, fp);
            let key = row.composite_key();
            let pointer = row.pointer(fp, self.inline_threshold);
            state.install(key.clone(), pointer.clone());
            state.rows += 1;
            installed.push((key, pointer));
        }
        Ok(installed)
    }

    pub fn append_marker(&self, highest_tx_id: i64, complete: bool, fsync: bool) -> Result<()> {
        self.log.append(&[LogEntry::MergeMarker {
            highest_tx_id,
            complete,
        }])?;
        self.log.flush(fsync)?;
        self.merged_through.store(highest_tx_id, Ordering::SeqCst);
        self.merge_complete.store(complete, Ordering::SeqCst);
        Ok(())
    }

    /// The pointer this generation holds for `key`, ignoring older generations.
    pub fn own_pointer(&self, key: &CompositeKey) -> Result<Option<Arc<Pointer>>> {
        Ok(self.state.read()?.by_key.get(key).cloned())
    }

    /// Looks `key` up here, then in the generation being merged. Returns the
    /// generation that answered so values can be read from its log.
    pub fn lookup(self: &Arc<Self>, key: &CompositeKey) -> Result<Option<(Arc<PartitionDelta>, Arc<Pointer>)>> {
        if let Some(pointer) = self.own_pointer(key)? {
            return Ok(Some((self.clone(), pointer)));
        }
        match self.merging()? {
            Some(merging) => merging.lookup(key),
            None => Ok(None),
        }
    }

    /// Snapshot of this generation's pointers between the bounds, ascending.
    pub fn own_range(
        &self,
        lower: Bound<&CompositeKey>,
        upper: Bound<&CompositeKey>,
    ) -> Result<Vec<(CompositeKey, Arc<Pointer>)>> {
        Ok(self
            .state
            .read()?
            .ordered
            .range::<CompositeKey, _>((lower, upper))
            .map(|(k, p)| (k.clone(), p.clone()))
            .collect())
    }

    pub fn own_highest_tx_id(&self) -> Result<Option<i64>> {
        Ok(self.state.read()?.global.iter().map(|e| e.tx_id).max())
    }

    pub fn own_lowest_tx_id(&self, prefix: Option<&[u8]>) -> Result<Option<i64>> {
        let state = self.state.read()?;
        Ok(match prefix {
            Some(prefix) => state
                .by_prefix
                .get(prefix)
                .and_then(|entries| entries.first())
                .map(|e| e.tx_id),
            None => state.global.iter().map(|e| e.tx_id).min(),
        })
    }

    /// Transaction entries after `since_tx_id`, in `txId` order.
    pub fn own_transactions_since(&self, since_tx_id: i64, prefix: Option<&[u8]>) -> Result<Vec<TxEntry>> {
        let state = self.state.read()?;
        let entries: &[TxEntry] = match prefix {
            Some(prefix) => match state.by_prefix.get(prefix) {
                Some(entries) => entries,
                None => return Ok(Vec::new()),
            },
            None => &state.global,
        };
        let start = entries.partition_point(|e| e.tx_id <= since_tx_id);
        Ok(entries[start..].to_vec())
    }

    pub fn read_row(&self, fp: i64) -> Result<Row> {
        self.log.read_row(fp)
    }

    /// The value behind a pointer held by this generation.
    pub fn hydrate(&self, pointer: &Pointer) -> Result<Option<Vec<u8>>> {
        if pointer.tombstoned {
            return Ok(None);
        }
        if let Some(value) = &pointer.value {
            return Ok(Some(value.clone()));
        }
        Ok(self.read_row(pointer.fp)?.value)
    }

    pub fn flush(&self, fsync: bool) -> Result<()> {
        self.log.flush(fsync)
    }

    /// Deletes the log once every row reached the base.
    pub fn remove_log(&self) -> Result<()> {
        self.log.remove()
    }
}

impl std::fmt::Debug for PartitionDelta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionDelta")
            .field("generation", &self.generation)
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer::Update;
    use tempfile::tempdir;

    fn row(tx_id: i64, prefix: &str, key: &str, ts: i64, value: &str) -> Row {
        Update::put(key, value, ts, 1).into_row(tx_id, prefix.as_bytes())
    }

    #[test]
    fn test_append_installs_in_both_indexes() -> Result<()> {
        let dir = tempdir()?;
        let delta = Arc::new(PartitionDelta::open(dir.path(), 1, 64, None)?);
        delta.append(&[row(1, "p", "b", 1, "vb"), row(1, "p", "a", 1, "va")])?;

        let key = CompositeKey::new(b"p", b"a");
        let (_, pointer) = delta.lookup(&key)?.unwrap();
        assert_eq!(pointer.value, Some(b"va".to_vec()));

        let range = delta.own_range(Bound::Unbounded, Bound::Unbounded)?;
        let keys: Vec<_> = range.iter().map(|(k, _)| k.key().to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec()]);
        assert!(Arc::ptr_eq(&range[0].1, &pointer));
        assert_eq!(delta.len()?, 2);
        Ok(())
    }

    #[test]
    fn test_transaction_log_groups_fps() -> Result<()> {
        let dir = tempdir()?;
        let delta = PartitionDelta::open(dir.path(), 1, 64, None)?;
        delta.append(&[row(1, "p1", "a", 1, "v"), row(1, "p1", "b", 1, "v")])?;
        delta.append(&[row(2, "p2", "a", 1, "v")])?;
        delta.append(&[row(3, "p1", "c", 1, "v")])?;

        let p1 = delta.own_transactions_since(0, Some(b"p1"))?;
        assert_eq!(p1.len(), 2);
        assert_eq!(p1[0].fps.len(), 2);
        assert_eq!(p1[1].tx_id, 3);

        let global: Vec<_> = delta
            .own_transactions_since(1, None)?
            .into_iter()
            .map(|e| e.tx_id)
            .collect();
        assert_eq!(global, vec![2, 3]);

        assert_eq!(delta.own_highest_tx_id()?, Some(3));
        assert_eq!(delta.own_lowest_tx_id(Some(b"p2"))?, Some(2));
        Ok(())
    }

    #[test]
    fn test_out_of_order_tx_is_rejected() -> Result<()> {
        let dir = tempdir()?;
        let delta = PartitionDelta::open(dir.path(), 1, 64, None)?;
        delta.append(&[row(5, "p", "a", 1, "v")])?;

        let result = delta.append(&[row(4, "p", "b", 1, "v")]);
        assert!(matches!(result, Err(Error::TxOrderViolation { last: 5, incoming: 4, .. })));
        // Nothing reached the log or the indexes
        assert!(delta.own_pointer(&CompositeKey::new(b"p", b"b"))?.is_none());
        assert_eq!(delta.len()?, 1);

        // The generation refuses every later append, in order or not
        assert!(delta.is_poisoned());
        assert!(matches!(delta.append(&[row(6, "p", "c", 1, "v")]), Err(Error::DeltaPoisoned)));
        assert!(matches!(delta.append(&[row(7, "q", "c", 1, "v")]), Err(Error::DeltaPoisoned)));
        assert_eq!(delta.len()?, 1);
        Ok(())
    }

    #[test]
    fn test_prefixes_keep_their_own_tx_order() -> Result<()> {
        let dir = tempdir()?;
        let delta = PartitionDelta::open(dir.path(), 1, 64, None)?;
        delta.append(&[row(5, "p", "a", 1, "v")])?;
        delta.append(&[row(4, "q", "b", 1, "v")])?;
        delta.append(&[row(5, "p", "c", 1, "v")])?;

        assert!(!delta.is_poisoned());
        assert_eq!(delta.len()?, 3);
        Ok(())
    }

    #[test]
    fn test_replay_restores_state_and_markers() -> Result<()> {
        let dir = tempdir()?;
        {
            let delta = PartitionDelta::open(dir.path(), 3, 2, None)?;
            delta.append(&[row(1, "p", "a", 1, "large value")])?;
            delta.append(&[row(2, "p", "b", 1, "v")])?;
            delta.append_marker(1, false, true)?;
        }

        let delta = Arc::new(PartitionDelta::open(dir.path(), 3, 2, None)?);
        assert_eq!(delta.len()?, 2);
        assert_eq!(
            delta.merge_progress(),
            MergeProgress {
                highest_tx_id: 1,
                complete: false
            }
        );

        let (owner, pointer) = delta.lookup(&CompositeKey::new(b"p", b"a"))?.unwrap();
        assert!(pointer.value.is_none(), "Value above the inline threshold");
        assert_eq!(owner.hydrate(&pointer)?, Some(b"large value".to_vec()));
        Ok(())
    }

    #[test]
    fn test_lookup_chains_to_merging() -> Result<()> {
        let dir = tempdir()?;
        let older = Arc::new(PartitionDelta::open(dir.path(), 1, 64, None)?);
        older.append(&[row(1, "p", "a", 1, "old"), row(1, "p", "b", 1, "old")])?;

        let live = Arc::new(PartitionDelta::open(dir.path(), 2, 64, Some(older.clone()))?);
        live.append(&[row(2, "p", "a", 2, "new")])?;

        let (owner, a) = live.lookup(&CompositeKey::new(b"p", b"a"))?.unwrap();
        assert_eq!(a.value, Some(b"new".to_vec()));
        assert_eq!(owner.generation(), 2);

        let (owner, b) = live.lookup(&CompositeKey::new(b"p", b"b"))?.unwrap();
        assert_eq!(b.value, Some(b"old".to_vec()));
        assert_eq!(owner.generation(), 1);

        assert!(live.clear_merging(&older)?);
        assert!(live.lookup(&CompositeKey::new(b"p", b"b"))?.is_none());
        Ok(())
    }
}
