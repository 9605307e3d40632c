//! Moves rows from the delta into the base, and rewrites the base.
//!
//! Both jobs mutate the base index and serialize through one lock: a merge
//! running during a compaction would write into the index being replaced.
//!
//! A delta merge walks the merging generation's transactions in `txId` order
//! and merges each one into the base index. Every `marker_interval`
//! transactions the base is flushed and a merge marker is written to the
//! delta log, so a restart resumes after the last marker instead of replaying
//! the whole generation.
//!
//! A compaction copies every surviving row into a fresh base log and a fresh
//! index, then swaps both in under exclusive access. Tombstones older than the
//! retention window are dropped on the way.
//!
//! [`MergeCompactor::cancel`] stops both jobs at their next transaction or row
//! with [`Error::Aborted`]; a cancelled compaction discards its build.

use crate::base::{base_log_path, BaseStore};
use crate::config::PartitionConfig;
use crate::delta::PartitionDelta;
use crate::error::Result;
use crate::index::{CompactionHandle, SideEffect};
use crate::log::{FileRowLog, RowLog};
use crate::pointer::{resolve, IndexEntry, MergeMode, Row};
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

const COMPACTION_BATCH: usize = 512;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub transactions: usize,
    pub rows: usize,
    pub added: usize,
    pub clobbered: usize,
    pub ignored: usize,
    pub highest_tx_id: Option<i64>,
}

impl MergeReport {
    fn record(&mut self, mode: MergeMode) {
        match mode {
            MergeMode::Added => self.added += 1,
            MergeMode::Clobbered => self.clobbered += 1,
            MergeMode::Ignored => self.ignored += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub generation: u64,
    pub kept: usize,
    pub shed_tombstones: usize,
}

pub struct MergeCompactor {
    marker_interval: usize,
    tombstone_retention: i64,
    lock: Mutex<()>,
    cancelled: AtomicBool,
}

impl MergeCompactor {
    pub fn new(config: &PartitionConfig) -> Self {
        Self {
            marker_interval: config.merge_marker_interval.max(1),
            tombstone_retention: config.compaction.tombstone_retention,
            lock: Mutex::new(()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Waits for the running merge or compaction, then holds off new ones
    /// until the guard drops.
    pub fn exclusive(&self) -> Result<MutexGuard<'_, ()>> {
        Ok(self.lock.lock()?)
    }

    /// Makes the running job and every later one fail with
    /// [`Error::Aborted`]. Nothing already merged is rolled back.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Aborted("merge compactor cancelled".into()));
        }
        Ok(())
    }

    /// Drains `delta` into the base, resuming after its last merge marker.
    /// The caller releases the generation afterwards.
    pub fn merge_delta(&self, base: &BaseStore, delta: &PartitionDelta) -> Result<MergeReport> {
        let _serial = self.lock.lock()?;
        self.check_cancelled()?;
        let progress = delta.merge_progress();
        let mut report = MergeReport::default();
        if progress.complete {
            report.highest_tx_id = Some(progress.highest_tx_id);
            return Ok(report);
        }

        let since = progress.highest_tx_id;
        let transactions = delta.own_transactions_since(since, None)?;
        let index = base.index();
        let log = base.log()?;
        let threshold = base.inline_threshold();

        tracing::info!(
            generation = delta.generation(),
            resume_after = since,
            transactions = transactions.len(),
            "Merging delta into base"
        );

        let mut since_marker = 0usize;
        for (i, tx) in transactions.iter().enumerate() {
            self.check_cancelled()?;
            let rows = tx
                .fps
                .iter()
                .map(|fp| delta.read_row(*fp))
                .collect::<Result<Vec<_>>>()?;

            let mut winners: Vec<Row> = Vec::with_capacity(rows.len());
            for row in rows {
                let incoming = row.pointer(0, threshold);
                let existing = index.get_pointer(&row.composite_key())?;
                match resolve(existing.as_ref(), &incoming) {
                    MergeMode::Ignored => report.ignored += 1,
                    _ => winners.push(row),
                }
                report.rows += 1;
            }

            if !winners.is_empty() {
                let fps = log.append_rows(&winners)?;
                let entries: Vec<IndexEntry> = winners
                    .iter()
                    .zip(fps)
                    .map(|(row, fp)| row.index_entry(fp, threshold))
                    .collect();
                for merged in index.merge(&entries)? {
                    report.record(merged.mode);
                }
            }

            report.transactions += 1;
            report.highest_tx_id = Some(tx.tx_id);
            since_marker += 1;

            let boundary = transactions
                .get(i + 1)
                .map_or(true, |next| next.tx_id != tx.tx_id);
            if boundary && since_marker >= self.marker_interval && i + 1 < transactions.len() {
                base.flush(true)?;
                delta.append_marker(tx.tx_id, false, true)?;
                since_marker = 0;
                tracing::debug!(generation = delta.generation(), through = tx.tx_id, "Merge marker");
            }
        }

        self.check_cancelled()?;
        base.flush(true)?;
        let highest = report.highest_tx_id.unwrap_or(since);
        base.record_merged(highest)?;
        delta.append_marker(highest, true, true)?;

        tracing::info!(
            generation = delta.generation(),
            transactions = report.transactions,
            added = report.added,
            clobbered = report.clobbered,
            ignored = report.ignored,
            "Merged delta"
        );
        Ok(report)
    }

    /// Rewrites the base index and log, shedding tombstones older than
    /// `now - tombstone_retention`.
    pub fn compact(&self, base: &BaseStore, now: i64) -> Result<CompactionReport> {
        let _serial = self.lock.lock()?;
        self.check_cancelled()?;
        let index = base.index();
        let target = (index.stripe() + 1) % base.stripes();
        let generation = index.generation() + 1;
        let cutoff = now.saturating_sub(self.tombstone_retention);

        let mut handle = index.start_compaction(true, target)?;
        tracing::info!(generation, stripe = target, cutoff, "Starting base compaction");

        let path = base_log_path(base.dir(), generation);
        let next_log = match open_fresh_log(&path) {
            Ok(log) => Arc::new(log),
            Err(e) => {
                handle.abort()?;
                return Err(e);
            }
        };
        let old_log = base.log()?;

        let copied = self
            .copy_surviving_rows(base, handle.as_mut(), &old_log, &next_log, cutoff)
            .and_then(|report| self.check_cancelled().map(|_| report))
            .and_then(|report| next_log.flush(true).map(|_| report));
        let mut report = match copied {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(error = %e, "Base compaction failed, aborting");
                if let Err(abort) = handle.abort() {
                    tracing::error!(error = %abort, "Failed to discard compaction build");
                }
                next_log.remove()?;
                return Err(e);
            }
        };

        let installed = next_log.clone();
        let side_effect: SideEffect<'_> = Box::new(move || base.install_generation(generation, installed));
        // On failure the new log stays behind; open removes it unless the
        // index swap already reached disk.
        handle.commit(true, Some(side_effect))?;

        if let Err(e) = old_log.remove() {
            tracing::warn!(path = ?old_log.path(), error = %e, "Failed to delete superseded base log");
        }
        report.generation = generation;
        tracing::info!(
            generation,
            kept = report.kept,
            shed_tombstones = report.shed_tombstones,
            "Compacted base"
        );
        Ok(report)
    }

    fn copy_surviving_rows(
        &self,
        base: &BaseStore,
        handle: &mut dyn CompactionHandle,
        from: &FileRowLog,
        to: &FileRowLog,
        cutoff: i64,
    ) -> Result<CompactionReport> {
        let threshold = base.inline_threshold();
        let mut report = CompactionReport::default();
        let mut batch: Vec<Row> = Vec::with_capacity(COMPACTION_BATCH);

        let flush_batch = |batch: &mut Vec<Row>, handle: &mut dyn CompactionHandle| -> Result<()> {
            if batch.is_empty() {
                return Ok(());
            }
            let fps = to.append_rows(batch)?;
            let entries: Vec<IndexEntry> = batch
                .iter()
                .zip(fps)
                .map(|(row, fp)| row.index_entry(fp, threshold))
                .collect();
            handle.merge(&entries)?;
            batch.clear();
            Ok(())
        };

        base.index().row_scan(&mut |_, pointer| {
            self.check_cancelled()?;
            if !pointer.has_value() {
                return Ok(true);
            }
            if pointer.tombstoned && pointer.timestamp < cutoff {
                report.shed_tombstones += 1;
                return Ok(true);
            }
            batch.push(from.read_row(pointer.fp)?);
            report.kept += 1;
            if batch.len() >= COMPACTION_BATCH {
                flush_batch(&mut batch, &mut *handle)?;
            }
            Ok(true)
        })?;
        flush_batch(&mut batch, handle)?;
        Ok(report)
    }
}

fn open_fresh_log(path: &std::path::Path) -> Result<FileRowLog> {
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    FileRowLog::open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, IndexBackend};
    use crate::gate::ConcurrencyGate;
    use crate::key::CompositeKey;
    use crate::pointer::Update;
    use tempfile::{tempdir, TempDir};

    fn config(dir: &TempDir, backend: IndexBackend) -> PartitionConfig {
        PartitionConfig::new(dir.path())
            .index_backend(backend)
            .inline_threshold(4)
            .merge_marker_interval(2)
            .compaction(CompactionConfig::default().tombstone_retention(100))
    }

    fn put(tx_id: i64, key: &str, ts: i64, value: &str) -> Row {
        Update::put(key, value, ts, 1).into_row(tx_id, b"p")
    }

    fn del(tx_id: i64, key: &str, ts: i64) -> Row {
        Update::remove(key, ts, 1).into_row(tx_id, b"p")
    }

    fn open_delta(
        dir: &std::path::Path,
        generation: u64,
        inline_threshold: usize,
        merging: Option<Arc<PartitionDelta>>,
    ) -> Result<PartitionDelta> {
        std::fs::create_dir_all(dir)?;
        PartitionDelta::open(dir, generation, inline_threshold, merging)
    }

    fn value(base: &BaseStore, key: &str) -> Result<Option<Vec<u8>>> {
        match base.index().get_pointer(&CompositeKey::new(b"p", key.as_bytes()))? {
            Some(pointer) => base.hydrate(&pointer),
            None => Ok(None),
        }
    }

    #[test]
    fn test_merge_delta_applies_every_transaction() -> Result<()> {
        for backend in [IndexBackend::Memory, IndexBackend::Lsm] {
            let dir = tempdir()?;
            let config = config(&dir, backend);
            let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
            let delta = open_delta(&dir.path().join("delta"), 1, 4, None)?;
            delta.append(&[put(1, "a", 1, "one"), put(1, "b", 1, "bee")])?;
            delta.append(&[put(2, "a", 2, "two")])?;
            delta.append(&[del(3, "b", 2)])?;
            delta.append(&[put(4, "c", 1, "sea")])?;

            let compactor = MergeCompactor::new(&config);
            let report = compactor.merge_delta(&base, &delta)?;
            assert_eq!(report.transactions, 4);
            assert_eq!(report.highest_tx_id, Some(4));
            assert_eq!(report.added, 3);
            assert_eq!(report.clobbered, 2);

            assert_eq!(value(&base, "a")?, Some(b"two".to_vec()));
            assert_eq!(value(&base, "b")?, None);
            assert_eq!(value(&base, "c")?, Some(b"sea".to_vec()));
            assert_eq!(base.descriptor()?.highest_merged_tx_id, 4);
            assert!(delta.merge_progress().complete);
        }
        Ok(())
    }

    #[test]
    fn test_merge_resumes_after_marker() -> Result<()> {
        let dir = tempdir()?;
        let config = config(&dir, IndexBackend::Lsm);
        let delta_dir = dir.path().join("delta");
        {
            let delta = open_delta(&delta_dir, 1, 4, None)?;
            delta.append(&[put(1, "a", 1, "one")])?;
            delta.append(&[put(2, "b", 1, "two")])?;
            delta.append(&[put(3, "c", 1, "three")])?;
            // A merge interrupted after the first two transactions
            delta.append_marker(2, false, true)?;
        }

        let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
        let delta = open_delta(&delta_dir, 1, 4, None)?;
        let report = MergeCompactor::new(&config).merge_delta(&base, &delta)?;
        assert_eq!(report.transactions, 1);
        assert_eq!(value(&base, "c")?, Some(b"three".to_vec()));
        assert_eq!(value(&base, "a")?, None);
        Ok(())
    }

    #[test]
    fn test_remerge_is_ignored() -> Result<()> {
        let dir = tempdir()?;
        let config = config(&dir, IndexBackend::Memory);
        let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
        let compactor = MergeCompactor::new(&config);

        let first = open_delta(&dir.path().join("d1"), 1, 4, None)?;
        first.append(&[put(1, "a", 5, "v")])?;
        compactor.merge_delta(&base, &first)?;
        let log_len = base.log()?.len();

        let second = open_delta(&dir.path().join("d2"), 1, 4, None)?;
        second.append(&[put(2, "a", 5, "v")])?;
        let report = compactor.merge_delta(&base, &second)?;
        assert_eq!(report.ignored, 1);
        assert_eq!(report.added + report.clobbered, 0);
        assert_eq!(base.log()?.len(), log_len, "Losing rows are not copied to the base log");
        Ok(())
    }

    #[test]
    fn test_cancelled_compactor_persists_nothing() -> Result<()> {
        for backend in [IndexBackend::Memory, IndexBackend::Lsm] {
            let dir = tempdir()?;
            let config = config(&dir, backend);
            let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
            let compactor = MergeCompactor::new(&config);

            let first = open_delta(&dir.path().join("d1"), 1, 4, None)?;
            first.append(&[put(1, "a", 1, "one")])?;
            compactor.merge_delta(&base, &first)?;

            compactor.cancel();
            let second = open_delta(&dir.path().join("d2"), 1, 4, None)?;
            second.append(&[put(2, "b", 1, "two")])?;
            assert!(matches!(compactor.merge_delta(&base, &second), Err(Error::Aborted(_))));
            assert!(matches!(compactor.compact(&base, 0), Err(Error::Aborted(_))));

            assert_eq!(value(&base, "b")?, None);
            assert_eq!(base.descriptor()?.highest_merged_tx_id, 1);
            assert!(!second.merge_progress().complete);
            assert_eq!(base.index().generation(), 0);
            assert!(!base_log_path(base.dir(), 1).exists());
        }
        Ok(())
    }

    #[test]
    fn test_compaction_sheds_old_tombstones() -> Result<()> {
        for backend in [IndexBackend::Memory, IndexBackend::Lsm] {
            let dir = tempdir()?;
            let config = config(&dir, backend);
            let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
            let delta = open_delta(&dir.path().join("delta"), 1, 4, None)?;
            delta.append(&[put(1, "keep", 10, "a long value")])?;
            delta.append(&[put(2, "keep", 20, "newer long value")])?;
            delta.append(&[del(3, "old-tomb", 50)])?;
            delta.append(&[del(4, "new-tomb", 950)])?;

            let compactor = MergeCompactor::new(&config);
            compactor.merge_delta(&base, &delta)?;
            let old_log = base.log()?.path().to_path_buf();

            let report = compactor.compact(&base, 1_000)?;
            assert_eq!(report.generation, 1);
            assert_eq!(report.kept, 2);
            assert_eq!(report.shed_tombstones, 1);

            assert_eq!(base.index().generation(), 1);
            assert_eq!(base.descriptor()?.generation, 1);
            assert!(!old_log.exists());
            assert_eq!(value(&base, "keep")?, Some(b"newer long value".to_vec()));
            assert!(base.index().get_pointer(&CompositeKey::new(b"p", b"old-tomb"))?.is_none());
            assert!(base.index().get_pointer(&CompositeKey::new(b"p", b"new-tomb"))?.is_some());
            assert_eq!(base.index().stats().clobbered, 0);
        }
        Ok(())
    }

    #[test]
    fn test_compacted_generation_survives_reopen() -> Result<()> {
        let dir = tempdir()?;
        let config = config(&dir, IndexBackend::Lsm).stripes(2);
        {
            let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
            let delta = open_delta(&dir.path().join("delta"), 1, 4, None)?;
            delta.append(&[put(1, "a", 1, "value a")])?;
            let compactor = MergeCompactor::new(&config);
            compactor.merge_delta(&base, &delta)?;
            compactor.compact(&base, 0)?;
            assert_eq!(base.index().stripe(), 1);
        }

        let base = BaseStore::open(&config, Arc::new(ConcurrencyGate::default()))?;
        assert_eq!(base.descriptor()?.generation, 1);
        assert_eq!(base.descriptor()?.stripe, 1);
        assert_eq!(value(&base, "a")?, Some(b"value a".to_vec()));
        Ok(())
    }
}
