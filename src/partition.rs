//! A partition: delta overlay in front of a base index, under one gate.
//!
//! ```text
//!            commit ──▶ live delta ──(rotate)──▶ merging delta ──▶ base index
//! get/scan ──▶ live ─────────▶ merging ───────────────▶ base
//! ```
//!
//! Reads and commits hold one gate permit for their whole duration.
//! Releasing a merged delta, compaction commit, close and expunge take every
//! permit, so no read ever sees a half-swapped partition.

use crate::base::BaseStore;
use crate::compactor::{CompactionReport, MergeCompactor, MergeReport};
use crate::config::PartitionConfig;
use crate::delta::{DeltaOverlay, DeltaPointer};
use crate::error::Result;
use crate::gate::ConcurrencyGate;
use crate::index::IndexStats;
use crate::key::CompositeKey;
use crate::log::RowLog;
use crate::oracle::{LivenessOracle, OrderIdProvider};
use crate::pointer::{
    resolve, IndexEntry, KeyPresence, MergeMode, Pointer, PrefixUpdate, Row, TimestampedValue, Update,
};
use crate::Error;
use std::cmp::Ordering as KeyOrdering;
use std::collections::HashMap;
use std::fs;
use std::ops::Bound;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

const OPEN: u8 = 0;
const CLOSED: u8 = 1;
const EXPUNGED: u8 = 2;

/// Outcome of one commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// Transaction id assigned to the winners; `None` when every update lost.
    pub tx_id: Option<i64>,
    /// One mode per update, in input order.
    pub modes: Vec<MergeMode>,
}

/// Point-in-time metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionStatus {
    pub pending: usize,
    pub merging: bool,
    pub generation: u64,
    pub stripe: u32,
    pub highest_tx_id: Option<i64>,
    pub highest_merged_tx_id: i64,
    pub base_log_bytes: u64,
    pub index_stats: IndexStats,
    pub gate_available: usize,
}

pub struct Partition {
    config: PartitionConfig,
    gate: Arc<ConcurrencyGate>,
    base: BaseStore,
    overlay: DeltaOverlay,
    compactor: MergeCompactor,
    oracle: Arc<dyn LivenessOracle>,
    order_ids: Arc<dyn OrderIdProvider>,
    commit_lock: Mutex<()>,
    state: AtomicU8,
}

impl Partition {
    /// Opens the partition under `config.dir`. Delta generations left behind
    /// by an interrupted merge are drained into the base before returning.
    pub fn open(
        config: PartitionConfig,
        oracle: Arc<dyn LivenessOracle>,
        order_ids: Arc<dyn OrderIdProvider>,
    ) -> Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let gate = Arc::new(ConcurrencyGate::new(config.gate_permits));
        let base = BaseStore::open(&config, gate.clone())?;
        let compactor = MergeCompactor::new(&config);
        let (overlay, pending) = DeltaOverlay::open(config.dir.join("delta"), config.inline_threshold)?;

        for delta in pending {
            let progress = delta.merge_progress();
            if progress.complete {
                base.record_merged(progress.highest_tx_id)?;
            } else {
                tracing::info!(
                    generation = delta.generation(),
                    resume_after = progress.highest_tx_id,
                    "Resuming interrupted delta merge"
                );
                compactor.merge_delta(&base, &delta)?;
            }
            delta.remove_log()?;
        }

        tracing::info!(
            dir = ?config.dir,
            pending = overlay.pending()?,
            generation = base.index().generation(),
            "Opened partition"
        );

        Ok(Self {
            config,
            gate,
            base,
            overlay,
            compactor,
            oracle,
            order_ids,
            commit_lock: Mutex::new(()),
            state: AtomicU8::new(OPEN),
        })
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state.load(Ordering::SeqCst) {
            OPEN => Ok(()),
            CLOSED => Err(Error::Closed),
            _ => Err(Error::Expunged),
        }
    }

    /// Background work failing because the partition closed underneath it
    /// reports the lifecycle change rather than its own error.
    fn lifecycle_error(&self, err: Error) -> Error {
        match self.ensure_open() {
            Ok(()) => err,
            Err(lifecycle) => lifecycle,
        }
    }

    /// The newest pointer for `key` across the chain, with the delta that owns
    /// it when it is not in the base.
    fn latest(&self, key: &CompositeKey) -> Result<Option<(Pointer, Option<DeltaPointer>)>> {
        if let Some(found) = self.overlay.lookup(key)? {
            return Ok(Some(((*found.pointer).clone(), Some(found))));
        }
        Ok(self.base.index().get_pointer(key)?.map(|p| (p, None)))
    }

    fn hydrate(&self, pointer: &Pointer, owner: Option<&DeltaPointer>) -> Result<Option<Vec<u8>>> {
        match owner {
            Some(found) => found.owner.hydrate(pointer),
            None => self.base.hydrate(pointer),
        }
    }

    /// Applies `updates` under `prefix` as one transaction. Updates that lose
    /// to what the partition already holds are reported `Ignored` and never
    /// reach the delta.
    pub fn commit(&self, prefix: &[u8], updates: Vec<Update>) -> Result<CommitResult> {
        self.ensure_open()?;
        if !self.oracle.is_online() {
            return Err(Error::PartitionOffline);
        }
        let _permit = self.gate.shared()?;
        let _commit = self.commit_lock.lock()?;
        self.ensure_open()?;

        let mut modes = Vec::with_capacity(updates.len());
        let mut winners: Vec<Update> = Vec::new();
        let mut batch: HashMap<CompositeKey, Pointer> = HashMap::new();
        for update in updates {
            let key = CompositeKey::new(prefix, &update.key);
            let incoming = Pointer {
                fp: 0,
                timestamp: update.timestamp,
                tombstoned: update.tombstoned,
                version: update.version,
                value: update.value.clone(),
            };
            let existing = match batch.get(&key) {
                Some(pointer) => Some(pointer.clone()),
                None => self.latest(&key)?.map(|(p, _)| p),
            };
            let mode = resolve(existing.as_ref(), &incoming);
            if mode != MergeMode::Ignored {
                batch.insert(key, incoming);
                winners.push(update);
            }
            modes.push(mode);
        }

        if winners.is_empty() {
            return Ok(CommitResult { tx_id: None, modes });
        }

        let tx_id = self.next_tx_id()?;
        let rows: Vec<Row> = winners.into_iter().map(|u| u.into_row(tx_id, prefix)).collect();
        let live = self.overlay.live()?;
        live.append(&rows)?;
        live.flush(self.oracle.is_authoritative() && self.config.fsync_on_commit)?;

        tracing::trace!(tx_id, rows = rows.len(), "Committed");
        Ok(CommitResult {
            tx_id: Some(tx_id),
            modes,
        })
    }

    fn next_tx_id(&self) -> Result<i64> {
        let merged = self.base.descriptor()?.highest_merged_tx_id;
        let buffered = self.overlay.highest_tx_id()?.unwrap_or(merged);
        Ok(buffered.max(merged) + 1)
    }

    /// Writes `value` stamped with the next order id.
    pub fn put(&self, prefix: &[u8], key: &[u8], value: &[u8]) -> Result<MergeMode> {
        let id = self.order_ids.next_id();
        let result = self.commit(prefix, vec![Update::put(key, value, id, id)])?;
        Ok(result.modes[0])
    }

    /// Tombstones `key` with the next order id.
    pub fn remove(&self, prefix: &[u8], key: &[u8]) -> Result<MergeMode> {
        let id = self.order_ids.next_id();
        let result = self.commit(prefix, vec![Update::remove(key, id, id)])?;
        Ok(result.modes[0])
    }

    pub fn get(&self, prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.get_timestamped(prefix, key)?.map(|v| v.value))
    }

    pub fn get_timestamped(&self, prefix: &[u8], key: &[u8]) -> Result<Option<TimestampedValue>> {
        let _permit = self.gate.shared()?;
        self.ensure_open()?;
        let key = CompositeKey::new(prefix, key);
        let Some((pointer, owner)) = self.latest(&key)? else {
            return Ok(None);
        };
        Ok(self
            .hydrate(&pointer, owner.as_ref())?
            .map(|value| TimestampedValue {
                value,
                timestamp: pointer.timestamp,
                version: pointer.version,
            }))
    }

    pub fn contains_keys(&self, prefix: &[u8], keys: &[&[u8]]) -> Result<Vec<KeyPresence>> {
        let _permit = self.gate.shared()?;
        self.ensure_open()?;
        keys.iter()
            .map(|key| {
                let latest = self.latest(&CompositeKey::new(prefix, key))?;
                Ok(KeyPresence::of(latest.as_ref().map(|(p, _)| p)))
            })
            .collect()
    }

    /// Visits live rows from `from` (inclusive) toward `to` (exclusive),
    /// descending when `from > to`. Delta rows shadow base rows of the same key.
    pub fn scan(
        &self,
        from: Option<&CompositeKey>,
        to: Option<&CompositeKey>,
        visitor: &mut dyn FnMut(&CompositeKey, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let _permit = self.gate.shared()?;
        self.ensure_open()?;

        let reverse = matches!((from, to), (Some(f), Some(t)) if f > t);
        let (lower, upper) = if reverse {
            (to.map_or(Bound::Unbounded, Bound::Excluded), from.map_or(Bound::Unbounded, Bound::Included))
        } else {
            (from.map_or(Bound::Unbounded, Bound::Included), to.map_or(Bound::Unbounded, Bound::Excluded))
        };
        let mut buffered = self.overlay.range(lower, upper)?;
        if reverse {
            buffered.reverse();
        }

        // Position of `a` relative to `b` in scan order.
        let ahead = |a: &CompositeKey, b: &CompositeKey| {
            let order = a.cmp(b);
            if reverse {
                order.reverse()
            } else {
                order
            }
        };

        let mut pending = buffered.into_iter().peekable();
        let mut stopped = false;
        let mut emit = |key: &CompositeKey, value: Option<Vec<u8>>| -> Result<bool> {
            match value {
                Some(value) => visitor(key, &value),
                None => Ok(true),
            }
        };

        self.base.index().range_scan(from, to, &mut |key, pointer| {
            loop {
                let position = match pending.peek() {
                    Some(next) => ahead(&next.key, key),
                    None => break,
                };
                if position == KeyOrdering::Greater {
                    break;
                }
                let Some(found) = pending.next() else { break };
                if !emit(&found.key, found.owner.hydrate(&found.pointer)?)? {
                    stopped = true;
                    return Ok(false);
                }
                if position == KeyOrdering::Equal {
                    // shadowed
                    return Ok(true);
                }
            }
            let more = emit(key, self.base.hydrate(pointer)?)?;
            stopped = !more;
            Ok(more)
        })?;

        if !stopped {
            for found in pending {
                if !emit(&found.key, found.owner.hydrate(&found.pointer)?)? {
                    break;
                }
            }
        }
        Ok(())
    }

    /// Live rows under `prefix`, ascending.
    pub fn scan_prefix(
        &self,
        prefix: &[u8],
        visitor: &mut dyn FnMut(&CompositeKey, &[u8]) -> Result<bool>,
    ) -> Result<()> {
        let start = CompositeKey::prefix_start(prefix);
        self.scan(Some(&start), None, &mut |key, value| {
            if !key.has_prefix(prefix) {
                return Ok(false);
            }
            visitor(key, value)
        })
    }

    /// Raw delta rows of transactions after `since_tx_id`, oldest first.
    pub fn take_rows_since(
        &self,
        since_tx_id: i64,
        prefix: Option<&[u8]>,
        visitor: &mut dyn FnMut(Row) -> Result<bool>,
    ) -> Result<()> {
        let _permit = self.gate.shared()?;
        self.ensure_open()?;
        self.overlay.take_rows_since(since_tx_id, prefix, visitor)
    }

    /// Updates under `prefix` that reached the base index after `since_tx_id`.
    pub fn take_prefix_updates_since(
        &self,
        prefix: &[u8],
        since_tx_id: i64,
        visitor: &mut dyn FnMut(PrefixUpdate) -> Result<bool>,
    ) -> Result<()> {
        let _permit = self.gate.shared()?;
        self.ensure_open()?;
        self.base.index().take_prefix_updates_since(prefix, since_tx_id, visitor)
    }

    pub fn highest_tx_id(&self) -> Result<Option<i64>> {
        let merged = self.base.descriptor()?.highest_merged_tx_id;
        Ok(match self.overlay.highest_tx_id()? {
            Some(buffered) => Some(buffered.max(merged)),
            None if merged > 0 => Some(merged),
            None => None,
        })
    }

    pub fn lowest_tx_id(&self, prefix: Option<&[u8]>) -> Result<Option<i64>> {
        self.overlay.lowest_tx_id(prefix)
    }

    /// Live rows in the base plus the net effect of the buffered writes.
    pub fn approximate_count(&self) -> Result<u64> {
        let _permit = self.gate.shared()?;
        self.ensure_open()?;
        let candidates: Vec<IndexEntry> = self
            .overlay
            .range(Bound::Unbounded, Bound::Unbounded)?
            .into_iter()
            .map(|found| IndexEntry {
                tx_id: 0,
                key: found.key,
                pointer: (*found.pointer).clone(),
            })
            .collect();
        let index = self.base.index();
        let count = index.count()? as i64 + index.delta_count(&candidates)?;
        Ok(count.max(0) as u64)
    }

    pub fn needs_merge(&self) -> Result<bool> {
        Ok(self.overlay.pending()? >= self.config.merge_threshold)
    }

    pub fn needs_compaction(&self) -> bool {
        self.base.index().needs_compaction(self.config.compaction.factor)
    }

    /// Rotates the live delta and drains it into the base. Returns `None`
    /// when nothing was buffered.
    pub fn merge_delta(&self) -> Result<Option<MergeReport>> {
        self.ensure_open()?;
        let merging = {
            let _commit = self.commit_lock.lock()?;
            self.ensure_open()?;
            match self.overlay.live()?.merging()? {
                // An earlier merge failed part way; finish that one first.
                Some(stuck) => stuck,
                None if self.overlay.live()?.is_empty()? => return Ok(None),
                None => self.overlay.rotate()?,
            }
        };

        let report = self
            .compactor
            .merge_delta(&self.base, &merging)
            .map_err(|e| self.lifecycle_error(e))?;
        {
            let _exclusive = self.gate.exclusive()?;
            self.ensure_open()?;
            self.overlay.finish_merge(&merging)?;
        }
        Ok(Some(report))
    }

    /// Rewrites the base, dropping tombstones older than the retention window
    /// measured back from `now`.
    pub fn compact(&self, now: i64) -> Result<CompactionReport> {
        self.ensure_open()?;
        self.compactor
            .compact(&self.base, now)
            .map_err(|e| self.lifecycle_error(e))
    }

    /// Compacts using the order-id provider's clock.
    pub fn compact_now(&self) -> Result<CompactionReport> {
        self.compact(self.order_ids.next_id())
    }

    pub fn status(&self) -> Result<PartitionStatus> {
        let descriptor = self.base.descriptor()?;
        let index = self.base.index();
        Ok(PartitionStatus {
            pending: self.overlay.pending()?,
            merging: self.overlay.is_merging()?,
            generation: index.generation(),
            stripe: index.stripe(),
            highest_tx_id: self.highest_tx_id()?,
            highest_merged_tx_id: descriptor.highest_merged_tx_id,
            base_log_bytes: self.base.log()?.len(),
            index_stats: index.stats(),
            gate_available: self.gate.available(),
        })
    }

    /// Waits for a running merge or compaction, flushes everything to disk
    /// and refuses further operations.
    pub fn close(&self) -> Result<()> {
        let _serial = self.compactor.exclusive()?;
        let _exclusive = self.gate.exclusive()?;
        if self.state.load(Ordering::SeqCst) != OPEN {
            return Ok(());
        }
        self.overlay.flush(true)?;
        self.base.flush(true)?;
        self.state.store(CLOSED, Ordering::SeqCst);
        tracing::info!(dir = ?self.config.dir, "Closed partition");
        Ok(())
    }

    /// Deletes all partition storage. A running merge or compaction is
    /// cancelled and drained before anything is removed.
    pub fn expunge(&self) -> Result<()> {
        self.compactor.cancel();
        let _serial = self.compactor.exclusive()?;
        let _exclusive = self.gate.exclusive()?;
        // Rotation runs under the commit lock without a permit.
        let _commit = self.commit_lock.lock()?;
        self.state.store(EXPUNGED, Ordering::SeqCst);
        self.overlay.remove_all()?;
        self.base.expunge()?;
        match fs::remove_dir_all(&self.config.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tracing::info!(dir = ?self.config.dir, "Expunged partition");
        Ok(())
    }
}
