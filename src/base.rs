//! The merged side of a partition: base index, base row log and descriptor.
//!
//! ```text
//! <dir>/DESCRIPTOR
//! <dir>/base/rows-00000003.log      rows the index points into
//! <dir>/base/index/stripe-N/...     LSM index trees
//! ```
//!
//! The base log is swapped for a fresh one by every compaction; its
//! generation always equals the index generation.

use crate::config::{IndexBackend, PartitionConfig};
use crate::descriptor::Descriptor;
use crate::error::Result;
use crate::gate::ConcurrencyGate;
use crate::index::{LsmPointerIndex, MemoryPointerIndex, PointerIndex};
use crate::log::{FileRowLog, LogEntry, RowLog};
use crate::pointer::{IndexEntry, Pointer, Row};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

const REBUILD_BATCH: usize = 512;

pub(crate) fn base_log_path(dir: &Path, generation: u64) -> PathBuf {
    dir.join(format!("rows-{:08}.log", generation))
}

fn parse_generation(path: &Path) -> Option<u64> {
    path.file_name()?
        .to_str()?
        .strip_prefix("rows-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}

pub struct BaseStore {
    root: PathBuf,
    dir: PathBuf,
    gate: Arc<ConcurrencyGate>,
    index: Box<dyn PointerIndex>,
    log: RwLock<Arc<FileRowLog>>,
    descriptor: Mutex<Descriptor>,
    stripes: u32,
    inline_threshold: usize,
}

impl BaseStore {
    pub fn open(config: &PartitionConfig, gate: Arc<ConcurrencyGate>) -> Result<Self> {
        let root = config.dir.clone();
        let dir = root.join("base");
        fs::create_dir_all(&dir)?;

        let stored = Descriptor::load(&root)?;
        let mut descriptor = stored.unwrap_or_default();

        let index: Box<dyn PointerIndex> = match config.index_backend {
            IndexBackend::Lsm => Box::new(LsmPointerIndex::open(
                gate.clone(),
                dir.join("index"),
                config.stripes,
                config.key_lock_stripes,
                config.memtable_size,
                descriptor.generation,
            )?),
            IndexBackend::Memory => Box::new(MemoryPointerIndex::new(
                gate.clone(),
                config.key_lock_stripes,
                descriptor.generation,
            )),
        };

        if index.generation() != descriptor.generation {
            // The index swap committed but the descriptor write did not.
            tracing::warn!(
                descriptor = descriptor.generation,
                index = index.generation(),
                "Rolling descriptor forward to the index generation"
            );
            descriptor.generation = index.generation();
        }
        descriptor.stripe = index.stripe();
        if stored != Some(descriptor) {
            descriptor.store(&root)?;
        }

        let log = Arc::new(FileRowLog::open(base_log_path(&dir, descriptor.generation))?);
        remove_stale_logs(&dir, descriptor.generation)?;

        let base = Self {
            root,
            dir,
            gate,
            index,
            log: RwLock::new(log),
            descriptor: Mutex::new(descriptor),
            stripes: config.stripes.max(1),
            inline_threshold: config.inline_threshold,
        };
        if config.index_backend == IndexBackend::Memory {
            base.rebuild_index()?;
        }

        tracing::info!(
            dir = ?base.dir,
            backend = base.index.name(),
            generation = descriptor.generation,
            highest_merged_tx_id = descriptor.highest_merged_tx_id,
            "Opened base store"
        );
        Ok(base)
    }

    /// Replays the base log into a fresh in-memory index.
    fn rebuild_index(&self) -> Result<()> {
        let log = self.log()?;
        let mut batch: Vec<IndexEntry> = Vec::with_capacity(REBUILD_BATCH);
        let mut rows = 0usize;
        log.scan(None, false, &mut |fp, entry| {
            if let LogEntry::Row(row) = entry {
                batch.push(row.index_entry(fp, self.inline_threshold));
                rows += 1;
                if batch.len() >= REBUILD_BATCH {
                    self.index.merge(&batch)?;
                    batch.clear();
                }
            }
            Ok(true)
        })?;
        if !batch.is_empty() {
            self.index.merge(&batch)?;
        }
        tracing::info!(rows, "Rebuilt in-memory index from base log");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index(&self) -> &dyn PointerIndex {
        self.index.as_ref()
    }

    pub fn stripes(&self) -> u32 {
        self.stripes
    }

    pub fn inline_threshold(&self) -> usize {
        self.inline_threshold
    }

    pub fn log(&self) -> Result<Arc<FileRowLog>> {
        Ok(self.log.read()?.clone())
    }

    pub fn descriptor(&self) -> Result<Descriptor> {
        Ok(*self.descriptor.lock()?)
    }

    /// Persists progress of a finished delta merge.
    pub fn record_merged(&self, highest_tx_id: i64) -> Result<()> {
        let _exclusive = self.gate.exclusive()?;
        let mut descriptor = self.descriptor.lock()?;
        if highest_tx_id <= descriptor.highest_merged_tx_id {
            return Ok(());
        }
        let mut next = *descriptor;
        next.highest_merged_tx_id = highest_tx_id;
        next.store(&self.root)?;
        *descriptor = next;
        Ok(())
    }

    /// Points the partition at a compacted base log. Runs inside the index
    /// commit, under exclusive access.
    pub(crate) fn install_generation(&self, generation: u64, log: Arc<FileRowLog>) -> Result<()> {
        let mut descriptor = self.descriptor.lock()?;
        let mut next = *descriptor;
        next.generation = generation;
        next.stripe = self.index.stripe();
        next.store(&self.root)?;
        *descriptor = next;
        *self.log.write()? = log;
        Ok(())
    }

    pub fn read_row(&self, fp: i64) -> Result<Row> {
        self.log()?.read_row(fp)
    }

    /// The value behind a base pointer; `None` for tombstones.
    pub fn hydrate(&self, pointer: &Pointer) -> Result<Option<Vec<u8>>> {
        if pointer.tombstoned || !pointer.has_value() {
            return Ok(None);
        }
        if let Some(value) = &pointer.value {
            return Ok(Some(value.clone()));
        }
        Ok(self.read_row(pointer.fp)?.value)
    }

    pub fn flush(&self, fsync: bool) -> Result<()> {
        self.log()?.flush(fsync)?;
        self.index.flush(fsync)
    }

    /// Drops the index and every base log.
    pub fn expunge(&self) -> Result<()> {
        let _exclusive = self.gate.exclusive()?;
        self.index.expunge()?;
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn remove_stale_logs(dir: &Path, current: u64) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        match parse_generation(&path) {
            Some(generation) if generation != current => {
                tracing::info!(path = ?path, "Removing stale base log");
                fs::remove_file(&path)?;
            }
            _ => {}
        }
    }
    Ok(())
}
