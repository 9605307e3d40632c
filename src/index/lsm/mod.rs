//! Persistent pointer index on an [`LsmTree`].
//!
//! Three keyspaces share one tree, told apart by a leading tag byte:
//!
//! | tag  | key                               | value                 |
//! |------|-----------------------------------|-----------------------|
//! | 0x00 | composite key                     | `Pointer`             |
//! | 0x01 | len(prefix) ‖ prefix ‖ txId ‖ fp  | `PrefixUpdate`        |
//! | 0x02 | txId ‖ fp                         | `(prefix, PrefixUpdate)` |
//!
//! A merge writes all three entries for a key as one WAL batch.

pub mod iterator;
pub mod layout;
pub mod run;
pub mod tree;

use self::layout::{IndexMeta, IndexState, Layout};
use self::tree::LsmTree;
use super::{
    global_tx_key, prefix_tx_key, prefix_update, CompactionHandle, Counters, IndexStats,
    KeyLocks, PointerIndex, PointerVisitor, ScanRange, SideEffect,
};
use crate::encoding::bincode;
use crate::error::Result;
use crate::gate::ConcurrencyGate;
use crate::key::CompositeKey;
use crate::pointer::{resolve, IndexEntry, MergeMode, Merged, Pointer, PrefixUpdate};
use crate::Error;
use std::fs;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

const POINTER_TAG: u8 = 0x00;
const PREFIX_LOG_TAG: u8 = 0x01;
const GLOBAL_LOG_TAG: u8 = 0x02;

fn tagged(tag: u8, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 1);
    out.push(tag);
    out.extend_from_slice(key);
    out
}

struct Instance {
    tree: LsmTree,
    stripe: u32,
    generation: u64,
}

impl Instance {
    fn open(dir: &Path, stripe: u32, generation: u64, memtable_size: usize) -> Result<Self> {
        Ok(Self {
            tree: LsmTree::open(dir, memtable_size)?,
            stripe,
            generation,
        })
    }

    fn pointer(&self, key: &CompositeKey) -> Result<Option<Pointer>> {
        match self.tree.get(&tagged(POINTER_TAG, key.as_bytes()))? {
            Some(bytes) => Ok(Some(bincode::deserialize("pointer", &bytes)?)),
            None => Ok(None),
        }
    }

    fn merge(&self, locks: &KeyLocks, entries: &[IndexEntry], stats: Option<&Counters>) -> Result<Vec<Merged>> {
        let mut merged = Vec::with_capacity(entries.len());
        for entry in entries {
            let _lock = locks.lock(&entry.key)?;
            let existing = self.pointer(&entry.key)?;
            let mode = resolve(existing.as_ref(), &entry.pointer);

            let pointer = match (mode, existing) {
                (MergeMode::Ignored, Some(existing)) => existing,
                _ => {
                    let prefix = entry.key.prefix();
                    let update = prefix_update(entry.tx_id, &entry.pointer);
                    let batch = vec![
                        (
                            tagged(POINTER_TAG, entry.key.as_bytes()),
                            bincode::serialize("pointer", &entry.pointer)?,
                        ),
                        (
                            tagged(PREFIX_LOG_TAG, &prefix_tx_key(prefix, entry.tx_id, entry.pointer.fp)),
                            bincode::serialize("prefix update", &update)?,
                        ),
                        (
                            tagged(GLOBAL_LOG_TAG, &global_tx_key(entry.tx_id, entry.pointer.fp)),
                            bincode::serialize("prefix update", &(prefix, &update))?,
                        ),
                    ];
                    self.tree.write(batch)?;
                    if let Some(stats) = stats {
                        stats.record(mode);
                    }
                    entry.pointer.clone()
                }
            };

            merged.push(Merged {
                mode,
                tx_id: entry.tx_id,
                key: entry.key.clone(),
                pointer,
            });
        }
        Ok(merged)
    }
}

pub struct LsmPointerIndex {
    gate: Arc<ConcurrencyGate>,
    layout: Layout,
    active: RwLock<Arc<Instance>>,
    generation: AtomicU64,
    stripe: AtomicU32,
    locks: KeyLocks,
    counters: Counters,
    compacting: AtomicBool,
    memtable_size: usize,
}

impl LsmPointerIndex {
    /// Opens the index under `root`, finishing or undoing any interrupted
    /// compaction. A fresh index starts at `initial_generation` in stripe 0.
    pub fn open(
        gate: Arc<ConcurrencyGate>,
        root: impl AsRef<Path>,
        stripes: u32,
        key_lock_stripes: usize,
        memtable_size: usize,
        initial_generation: u64,
    ) -> Result<Self> {
        let layout = Layout::new(root.as_ref(), stripes);
        let (stripe, meta) = match layout.reconcile()? {
            Some(found) => found,
            None => {
                let meta = IndexMeta {
                    generation: initial_generation,
                };
                meta.write(&layout.dir(0, IndexState::Active))?;
                (0, meta)
            }
        };

        let dir = layout.dir(stripe, IndexState::Active);
        let instance = Instance::open(&dir, stripe, meta.generation, memtable_size)?;
        tracing::info!(dir = ?dir, generation = meta.generation, "Opened LSM pointer index");

        Ok(Self {
            gate,
            layout,
            active: RwLock::new(Arc::new(instance)),
            generation: AtomicU64::new(meta.generation),
            stripe: AtomicU32::new(stripe),
            locks: KeyLocks::new(key_lock_stripes),
            counters: Counters::default(),
            compacting: AtomicBool::new(false),
            memtable_size,
        })
    }

    fn active(&self) -> Result<Arc<Instance>> {
        Ok(self.active.read()?.clone())
    }

    /// Number of sorted runs in the active tree.
    pub fn run_count(&self) -> Result<usize> {
        self.active()?.tree.run_count()
    }

    /// Writes the active memtable out as a sorted run.
    pub fn flush_memtable(&self) -> Result<()> {
        self.active()?.tree.flush_memtable()
    }
}

impl PointerIndex for LsmPointerIndex {
    fn name(&self) -> &'static str {
        "lsm"
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn stripe(&self) -> u32 {
        self.stripe.load(Ordering::SeqCst)
    }

    fn merge(&self, entries: &[IndexEntry]) -> Result<Vec<Merged>> {
        self.active()?.merge(&self.locks, entries, Some(&self.counters))
    }

    fn get_pointer(&self, key: &CompositeKey) -> Result<Option<Pointer>> {
        self.active()?.pointer(key)
    }

    fn range_scan(
        &self,
        from: Option<&CompositeKey>,
        to: Option<&CompositeKey>,
        visitor: &mut PointerVisitor<'_>,
    ) -> Result<()> {
        let range = ScanRange::new(from, to);
        let (lower, upper) = range.tagged(POINTER_TAG);
        self.active()?.tree.scan(lower, upper, range.reverse, &mut |key, value| {
            let key = CompositeKey::from_bytes(key[1..].to_vec())?;
            let pointer: Pointer = bincode::deserialize("pointer", value)?;
            visitor(&key, &pointer)
        })
    }

    fn take_prefix_updates_since(
        &self,
        prefix: &[u8],
        since_tx_id: i64,
        visitor: &mut dyn FnMut(PrefixUpdate) -> Result<bool>,
    ) -> Result<()> {
        let lower = Bound::Excluded(tagged(
            PREFIX_LOG_TAG,
            &prefix_tx_key(prefix, since_tx_id, i64::MAX),
        ));
        let upper = Bound::Included(tagged(
            PREFIX_LOG_TAG,
            &prefix_tx_key(prefix, i64::MAX, i64::MAX),
        ));
        self.active()?.tree.scan(lower, upper, false, &mut |_, value| {
            visitor(bincode::deserialize("prefix update", value)?)
        })
    }

    fn take_updates_since(
        &self,
        since_tx_id: i64,
        visitor: &mut dyn FnMut(&[u8], PrefixUpdate) -> Result<bool>,
    ) -> Result<()> {
        let lower = Bound::Excluded(tagged(GLOBAL_LOG_TAG, &global_tx_key(since_tx_id, i64::MAX)));
        let upper = Bound::Excluded(vec![GLOBAL_LOG_TAG + 1]);
        self.active()?.tree.scan(lower, upper, false, &mut |_, value| {
            let (prefix, update): (Vec<u8>, PrefixUpdate) =
                bincode::deserialize("prefix update", value)?;
            visitor(&prefix, update)
        })
    }

    fn count(&self) -> Result<u64> {
        let mut live = 0;
        self.row_scan(&mut |_, pointer| {
            if pointer.is_live() {
                live += 1;
            }
            Ok(true)
        })?;
        Ok(live)
    }

    fn stats(&self) -> IndexStats {
        self.counters.stats()
    }

    fn start_compaction(
        &self,
        has_active: bool,
        target_stripe: u32,
    ) -> Result<Box<dyn CompactionHandle + '_>> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::CompactionInProgress);
        }

        let stripe = target_stripe % self.layout.stripes();
        let dir = self.layout.dir(stripe, IndexState::Compacting);
        let build = || -> Result<Instance> {
            if dir.exists() {
                fs::remove_dir_all(&dir)?;
            }
            let generation = self.generation() + 1;
            IndexMeta { generation }.write(&dir)?;
            Instance::open(&dir, stripe, generation, self.memtable_size)
        };
        let target = match build() {
            Ok(target) => target,
            Err(e) => {
                self.compacting.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        tracing::debug!(stripe, dir = ?dir, "Started index compaction");

        Ok(Box::new(LsmCompaction {
            index: self,
            target: Some(target),
            has_active,
        }))
    }

    fn flush(&self, fsync: bool) -> Result<()> {
        self.active()?.tree.flush(fsync)
    }

    fn expunge(&self) -> Result<()> {
        let _exclusive = self.gate.exclusive()?;
        match fs::remove_dir_all(self.layout.root()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.counters.reset();
        tracing::info!(root = ?self.layout.root(), "Expunged LSM pointer index");
        Ok(())
    }
}

/// A replacement tree in `compacting/`. Dropping an uncommitted handle
/// deletes the directory and frees the compaction slot.
struct LsmCompaction<'a> {
    index: &'a LsmPointerIndex,
    target: Option<Instance>,
    has_active: bool,
}

impl LsmCompaction<'_> {
    /// Directory renames of the swap; returns the previous instance and its backup dir.
    fn swap(&mut self, target: Instance) -> Result<(Arc<Instance>, Option<std::path::PathBuf>)> {
        let index = self.index;
        let layout = &index.layout;
        let stripe = target.stripe;

        let compacted = layout.dir(stripe, IndexState::Compacted);
        fs::rename(layout.dir(stripe, IndexState::Compacting), &compacted)?;
        target.tree.relocate(&compacted)?;

        let current = index.active()?;
        let backup = if self.has_active {
            let from = layout.dir(current.stripe, IndexState::Active);
            let to = layout.dir(current.stripe, IndexState::Backup);
            fs::rename(&from, &to)?;
            current.tree.relocate(&to)?;
            Some(to)
        } else {
            None
        };

        let active = layout.dir(stripe, IndexState::Active);
        fs::rename(&compacted, &active)?;
        target.tree.relocate(&active)?;

        let generation = target.generation;
        let previous = std::mem::replace(&mut *index.active.write()?, Arc::new(target));
        index.generation.store(generation, Ordering::SeqCst);
        index.stripe.store(stripe, Ordering::SeqCst);
        Ok((previous, backup))
    }

    fn rollback(&self, previous: Arc<Instance>, backup: Option<std::path::PathBuf>) -> Result<()> {
        let index = self.index;
        let layout = &index.layout;
        let replacement = std::mem::replace(&mut *index.active.write()?, previous.clone());
        fs::remove_dir_all(layout.dir(replacement.stripe, IndexState::Active))?;
        if let Some(backup) = backup {
            let active = layout.dir(previous.stripe, IndexState::Active);
            fs::rename(&backup, &active)?;
            previous.tree.relocate(&active)?;
        }
        index.generation.store(previous.generation, Ordering::SeqCst);
        index.stripe.store(previous.stripe, Ordering::SeqCst);
        Ok(())
    }
}

impl CompactionHandle for LsmCompaction<'_> {
    fn merge(&mut self, entries: &[IndexEntry]) -> Result<Vec<Merged>> {
        let target = self
            .target
            .as_ref()
            .ok_or_else(|| Error::InvalidState("compaction already finished".into()))?;
        target.merge(&self.index.locks, entries, None)
    }

    fn commit(mut self: Box<Self>, fsync: bool, side_effect: Option<SideEffect<'_>>) -> Result<()> {
        let index = self.index;
        let target = self
            .target
            .take()
            .ok_or_else(|| Error::InvalidState("compaction already finished".into()))?;
        target.tree.flush(fsync)?;
        let generation = target.generation;

        let _exclusive = index.gate.exclusive()?;
        let (previous, backup) = match self.swap(target) {
            Ok(swapped) => swapped,
            Err(e) => {
                tracing::error!(error = %e, "Index swap failed; directories are reconciled on next open");
                return Err(e);
            }
        };

        if let Some(side_effect) = side_effect {
            if let Err(e) = side_effect() {
                tracing::warn!(error = %e, "Compaction side effect failed, restoring previous index");
                self.rollback(previous, backup)?;
                return Err(e);
            }
        }

        if let Some(backup) = backup {
            if let Err(e) = fs::remove_dir_all(&backup) {
                tracing::warn!(dir = ?backup, error = %e, "Failed to delete index backup");
            }
        }
        index.counters.reset();
        tracing::info!(generation, stripe = index.stripe(), "Committed index compaction");
        Ok(())
    }

    fn abort(mut self: Box<Self>) -> Result<()> {
        if let Some(target) = self.target.take() {
            let dir = target.tree.dir()?;
            drop(target);
            fs::remove_dir_all(&dir)?;
            tracing::debug!(dir = ?dir, "Aborted index compaction");
        }
        Ok(())
    }
}

impl Drop for LsmCompaction<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target.take() {
            if let Ok(dir) = target.tree.dir() {
                drop(target);
                let _ = fs::remove_dir_all(dir);
            }
        }
        self.index.compacting.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::contract;
    use tempfile::{tempdir, TempDir};

    fn open(dir: &TempDir, stripes: u32) -> Result<LsmPointerIndex> {
        LsmPointerIndex::open(
            Arc::new(ConcurrencyGate::default()),
            dir.path().join("index"),
            stripes,
            16,
            1 << 20,
            0,
        )
    }

    #[test]
    fn test_clobber_and_ignore() -> Result<()> {
        let dir = tempdir()?;
        contract::clobber_and_ignore(&open(&dir, 1)?)
    }

    #[test]
    fn test_idempotent_merge() -> Result<()> {
        let dir = tempdir()?;
        contract::idempotent_merge(&open(&dir, 1)?)
    }

    #[test]
    fn test_last_writer_wins_any_order() -> Result<()> {
        let dirs = std::cell::RefCell::new(Vec::new());
        contract::last_writer_wins_any_order(&|| {
            let dir = tempdir().unwrap();
            let index = open(&dir, 1).unwrap();
            dirs.borrow_mut().push(dir);
            Box::new(index) as Box<dyn PointerIndex>
        })
    }

    #[test]
    fn test_range_scans() -> Result<()> {
        let dir = tempdir()?;
        contract::scans_in_both_directions(&open(&dir, 1)?)
    }

    #[test]
    fn test_contains_and_count() -> Result<()> {
        let dir = tempdir()?;
        contract::contains_and_counts(&open(&dir, 1)?)
    }

    #[test]
    fn test_prefix_scoped_take() -> Result<()> {
        let dir = tempdir()?;
        contract::prefix_scoped_take(&open(&dir, 1)?)
    }

    #[test]
    fn test_single_compaction_in_flight() -> Result<()> {
        let dir = tempdir()?;
        contract::single_compaction_in_flight(&open(&dir, 1)?)
    }

    #[test]
    fn test_compaction_swaps_contents() -> Result<()> {
        let dir = tempdir()?;
        contract::compaction_swaps_contents(&open(&dir, 1)?)
    }

    #[test]
    fn test_failed_side_effect_keeps_active() -> Result<()> {
        let dir = tempdir()?;
        contract::failed_side_effect_keeps_active(&open(&dir, 1)?)
    }

    #[test]
    fn test_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        {
            let index = open(&dir, 1)?;
            index.merge(&[contract::entry(1, "p", "a", 1, 1, false, "v1")])?;
            index.flush_memtable()?;
            index.merge(&[contract::entry(2, "p", "b", 1, 1, false, "v2")])?;
            index.flush(true)?;
        }

        let index = open(&dir, 1)?;
        assert!(index.get_pointer(&CompositeKey::new(b"p", b"a"))?.is_some());
        assert!(index.get_pointer(&CompositeKey::new(b"p", b"b"))?.is_some());
        let mut taken = Vec::new();
        index.take_prefix_updates_since(b"p", 0, &mut |u| {
            taken.push(u.tx_id);
            Ok(true)
        })?;
        assert_eq!(taken, vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_compaction_moves_between_stripes() -> Result<()> {
        let dir = tempdir()?;
        {
            let index = open(&dir, 2)?;
            index.merge(&[contract::entry(1, "p", "a", 1, 1, false, "v")])?;

            let mut handle = index.start_compaction(true, 1)?;
            handle.merge(&[contract::entry(1, "p", "a", 1, 1, false, "v")])?;
            handle.commit(true, None)?;

            assert_eq!(index.stripe(), 1);
            assert_eq!(index.generation(), 1);
            let layout = Layout::new(dir.path().join("index"), 2);
            assert!(layout.dir(1, IndexState::Active).is_dir());
            assert!(!layout.dir(0, IndexState::Active).exists());
            assert!(!layout.dir(0, IndexState::Backup).exists());
        }

        let reopened = open(&dir, 2)?;
        assert_eq!(reopened.stripe(), 1);
        assert_eq!(reopened.generation(), 1);
        assert!(reopened.get_pointer(&CompositeKey::new(b"p", b"a"))?.is_some());
        Ok(())
    }

    #[test]
    fn test_abandoned_build_is_discarded_on_open() -> Result<()> {
        let dir = tempdir()?;
        {
            let index = open(&dir, 1)?;
            index.merge(&[contract::entry(1, "p", "a", 1, 1, false, "v")])?;
            let mut handle = index.start_compaction(true, 0)?;
            handle.merge(&[contract::entry(9, "p", "z", 1, 1, false, "v")])?;
            index.flush(true)?;
            // Simulate a crash mid-build
            std::mem::forget(handle);
        }

        let index = open(&dir, 1)?;
        assert_eq!(index.generation(), 0);
        assert!(index.get_pointer(&CompositeKey::new(b"p", b"z"))?.is_none());
        assert!(index.get_pointer(&CompositeKey::new(b"p", b"a"))?.is_some());
        Ok(())
    }

    #[test]
    fn test_expunge_removes_storage() -> Result<()> {
        let dir = tempdir()?;
        let index = open(&dir, 1)?;
        index.merge(&[contract::entry(1, "p", "a", 1, 1, false, "v")])?;
        index.expunge()?;
        assert!(!dir.path().join("index").exists());
        Ok(())
    }
}
