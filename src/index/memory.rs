//! In-memory pointer index over concurrent skip lists.
//!
//! Nothing is persisted; a partition using this backend rebuilds it by
//! replaying the base log on open.

use super::{
    global_tx_key, prefix_tx_key, prefix_update, CompactionHandle, Counters, IndexStats,
    KeyLocks, PointerIndex, PointerVisitor, ScanRange, SideEffect,
};
use crate::error::Result;
use crate::gate::ConcurrencyGate;
use crate::key::CompositeKey;
use crate::pointer::{resolve, IndexEntry, MergeMode, Merged, Pointer, PrefixUpdate};
use crate::Error;
use crossbeam_skiplist::SkipMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Default)]
struct Tables {
    pointers: SkipMap<CompositeKey, Pointer>,
    prefix_log: SkipMap<Vec<u8>, PrefixUpdate>,
    global_log: SkipMap<Vec<u8>, (Vec<u8>, PrefixUpdate)>,
}

impl Tables {
    fn merge(&self, locks: &KeyLocks, entries: &[IndexEntry], stats: Option<&Counters>) -> Result<Vec<Merged>> {
        let mut merged = Vec::with_capacity(entries.len());
        for entry in entries {
            let _lock = locks.lock(&entry.key)?;
            let existing = self.pointers.get(&entry.key).map(|e| e.value().clone());
            let mode = resolve(existing.as_ref(), &entry.pointer);

            let pointer = match (mode, existing) {
                (MergeMode::Ignored, Some(existing)) => existing,
                _ => {
                    self.pointers.insert(entry.key.clone(), entry.pointer.clone());
                    let update = prefix_update(entry.tx_id, &entry.pointer);
                    let prefix = entry.key.prefix();
                    self.prefix_log
                        .insert(prefix_tx_key(prefix, entry.tx_id, entry.pointer.fp), update.clone());
                    self.global_log.insert(
                        global_tx_key(entry.tx_id, entry.pointer.fp),
                        (prefix.to_vec(), update),
                    );
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

pub struct MemoryPointerIndex {
    gate: Arc<ConcurrencyGate>,
    tables: RwLock<Arc<Tables>>,
    locks: KeyLocks,
    counters: Counters,
    compacting: AtomicBool,
    generation: AtomicU64,
    stripe: u32,
}

impl MemoryPointerIndex {
    pub fn new(gate: Arc<ConcurrencyGate>, key_lock_stripes: usize, generation: u64) -> Self {
        Self {
            gate,
            tables: RwLock::new(Arc::new(Tables::default())),
            locks: KeyLocks::new(key_lock_stripes),
            counters: Counters::default(),
            compacting: AtomicBool::new(false),
            generation: AtomicU64::new(generation),
            stripe: 0,
        }
    }

    fn tables(&self) -> Result<Arc<Tables>> {
        Ok(self.tables.read()?.clone())
    }
}

impl PointerIndex for MemoryPointerIndex {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn stripe(&self) -> u32 {
        self.stripe
    }

    fn merge(&self, entries: &[IndexEntry]) -> Result<Vec<Merged>> {
        self.tables()?.merge(&self.locks, entries, Some(&self.counters))
    }

    fn get_pointer(&self, key: &CompositeKey) -> Result<Option<Pointer>> {
        Ok(self.tables()?.pointers.get(key).map(|e| e.value().clone()))
    }

    fn range_scan(
        &self,
        from: Option<&CompositeKey>,
        to: Option<&CompositeKey>,
        visitor: &mut PointerVisitor<'_>,
    ) -> Result<()> {
        let tables = self.tables()?;
        let range = ScanRange::new(from, to);
        let mut entries = tables.pointers.range::<[u8], _>(range.as_refs());
        loop {
            let next = if range.reverse { entries.next_back() } else { entries.next() };
            let Some(entry) = next else { break };
            if !visitor(entry.key(), entry.value())? {
                break;
            }
        }
        Ok(())
    }

    fn take_prefix_updates_since(
        &self,
        prefix: &[u8],
        since_tx_id: i64,
        visitor: &mut dyn FnMut(PrefixUpdate) -> Result<bool>,
    ) -> Result<()> {
        let tables = self.tables()?;
        let lower = Bound::Excluded(prefix_tx_key(prefix, since_tx_id, i64::MAX));
        let upper = Bound::Included(prefix_tx_key(prefix, i64::MAX, i64::MAX));
        for entry in tables.prefix_log.range((lower, upper)) {
            if !visitor(entry.value().clone())? {
                break;
            }
        }
        Ok(())
    }

    fn take_updates_since(
        &self,
        since_tx_id: i64,
        visitor: &mut dyn FnMut(&[u8], PrefixUpdate) -> Result<bool>,
    ) -> Result<()> {
        let tables = self.tables()?;
        let lower = Bound::Excluded(global_tx_key(since_tx_id, i64::MAX));
        for entry in tables.global_log.range((lower, Bound::Unbounded)) {
            let (prefix, update) = entry.value();
            if !visitor(prefix, update.clone())? {
                break;
            }
        }
        Ok(())
    }

    fn count(&self) -> Result<u64> {
        Ok(self
            .tables()?
            .pointers
            .iter()
            .filter(|e| e.value().is_live())
            .count() as u64)
    }

    fn stats(&self) -> IndexStats {
        self.counters.stats()
    }

    fn start_compaction(
        &self,
        _has_active: bool,
        _target_stripe: u32,
    ) -> Result<Box<dyn CompactionHandle + '_>> {
        if self
            .compacting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::CompactionInProgress);
        }
        Ok(Box::new(MemoryCompaction {
            index: self,
            target: Arc::new(Tables::default()),
        }))
    }

    fn flush(&self, _fsync: bool) -> Result<()> {
        Ok(())
    }

    fn expunge(&self) -> Result<()> {
        let _exclusive = self.gate.exclusive()?;
        *self.tables.write()? = Arc::new(Tables::default());
        self.counters.reset();
        Ok(())
    }
}

/// Replacement tables built beside the live ones. Dropping the handle,
/// committed or not, frees the compaction slot.
struct MemoryCompaction<'a> {
    index: &'a MemoryPointerIndex,
    target: Arc<Tables>,
}

impl CompactionHandle for MemoryCompaction<'_> {
    fn merge(&mut self, entries: &[IndexEntry]) -> Result<Vec<Merged>> {
        self.target.merge(&self.index.locks, entries, None)
    }

    fn commit(self: Box<Self>, _fsync: bool, side_effect: Option<SideEffect<'_>>) -> Result<()> {
        let index = self.index;
        let _exclusive = index.gate.exclusive()?;

        let previous = std::mem::replace(&mut *index.tables.write()?, self.target.clone());
        if let Some(side_effect) = side_effect {
            if let Err(e) = side_effect() {
                *index.tables.write()? = previous;
                return Err(e);
            }
        }

        index.generation.fetch_add(1, Ordering::SeqCst);
        index.counters.reset();
        Ok(())
    }

    fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

impl Drop for MemoryCompaction<'_> {
    fn drop(&mut self) {
        self.index.compacting.store(false, Ordering::SeqCst);
    }
}
