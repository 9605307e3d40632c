//! Write buffering in front of the base index.
//!
//! The overlay holds one live [`PartitionDelta`]. A merge swaps in a fresh
//! generation whose `merging` slot points back at the previous one, so reads
//! keep seeing the buffered rows until the merge finishes and the slot is
//! cleared. At most one generation is merging at a time.
//!
//! ```text
//! live (gen N) ──merging──▶ gen N-1 ──▶ base index
//! ```

pub mod generation;

pub use generation::{MergeProgress, PartitionDelta, TxEntry};

use crate::error::Result;
use crate::key::CompositeKey;
use crate::pointer::{Pointer, Row};
use crate::Error;
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A pointer from the overlay with the generation whose log backs it.
#[derive(Debug, Clone)]
pub struct DeltaPointer {
    pub key: CompositeKey,
    pub pointer: Arc<Pointer>,
    pub owner: Arc<PartitionDelta>,
}

pub struct DeltaOverlay {
    dir: PathBuf,
    inline_threshold: usize,
    live: RwLock<Arc<PartitionDelta>>,
}

impl DeltaOverlay {
    /// Opens the newest generation under `dir` as live. Older generations
    /// still on disk were left mid-merge and are returned oldest first; the
    /// caller must drain them before serving.
    pub fn open(dir: impl AsRef<Path>, inline_threshold: usize) -> Result<(Self, Vec<Arc<PartitionDelta>>)> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut generations = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            if let Some(generation) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                generations.push(generation);
            }
        }
        generations.sort_unstable();

        let newest = generations.pop().unwrap_or(1);
        let pending = generations
            .into_iter()
            .map(|g| PartitionDelta::open(&dir, g, inline_threshold, None).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        let live = Arc::new(PartitionDelta::open(&dir, newest, inline_threshold, None)?);

        tracing::debug!(
            dir = ?dir,
            live = newest,
            pending = pending.len(),
            "Opened delta overlay"
        );

        Ok((
            Self {
                dir,
                inline_threshold,
                live: RwLock::new(live),
            },
            pending,
        ))
    }

    pub fn live(&self) -> Result<Arc<PartitionDelta>> {
        Ok(self.live.read()?.clone())
    }

    /// The live generation followed by the one being merged, if any.
    pub fn chain(&self) -> Result<Vec<Arc<PartitionDelta>>> {
        let live = self.live()?;
        let mut chain = vec![live.clone()];
        let mut next = live.merging()?;
        while let Some(delta) = next {
            next = delta.merging()?;
            chain.push(delta);
        }
        Ok(chain)
    }

    /// Installs an empty live generation and returns the previous one, now
    /// reachable only through the `merging` slot.
    pub fn rotate(&self) -> Result<Arc<PartitionDelta>> {
        let mut live = self.live.write()?;
        if live.merging()?.is_some() {
            return Err(Error::MergeInProgress);
        }
        let previous = live.clone();
        let next = PartitionDelta::open(
            &self.dir,
            previous.generation() + 1,
            self.inline_threshold,
            Some(previous.clone()),
        )?;
        *live = Arc::new(next);
        tracing::debug!(
            merging = previous.generation(),
            live = previous.generation() + 1,
            "Rotated delta"
        );
        Ok(previous)
    }

    /// Releases a generation whose rows all reached the base.
    pub fn finish_merge(&self, merged: &Arc<PartitionDelta>) -> Result<()> {
        self.live()?.clear_merging(merged)?;
        merged.remove_log()
    }

    /// Rows appended to the live generation.
    pub fn pending(&self) -> Result<usize> {
        self.live()?.len()
    }

    pub fn is_merging(&self) -> Result<bool> {
        Ok(self.live()?.merging()?.is_some())
    }

    pub fn lookup(&self, key: &CompositeKey) -> Result<Option<DeltaPointer>> {
        Ok(self.live()?.lookup(key)?.map(|(owner, pointer)| DeltaPointer {
            key: key.clone(),
            pointer,
            owner,
        }))
    }

    /// Pointers between the bounds across the chain, ascending. A key held by
    /// a newer generation shadows older ones.
    pub fn range(
        &self,
        lower: Bound<&CompositeKey>,
        upper: Bound<&CompositeKey>,
    ) -> Result<Vec<DeltaPointer>> {
        let mut merged: BTreeMap<CompositeKey, DeltaPointer> = BTreeMap::new();
        for delta in self.chain()? {
            for (key, pointer) in delta.own_range(lower, upper)? {
                merged.entry(key.clone()).or_insert_with(|| DeltaPointer {
                    key,
                    pointer,
                    owner: delta.clone(),
                });
            }
        }
        Ok(merged.into_values().collect())
    }

    pub fn highest_tx_id(&self) -> Result<Option<i64>> {
        for delta in self.chain()? {
            if let Some(highest) = delta.own_highest_tx_id()? {
                return Ok(Some(highest));
            }
        }
        Ok(None)
    }

    pub fn lowest_tx_id(&self, prefix: Option<&[u8]>) -> Result<Option<i64>> {
        for delta in self.chain()?.iter().rev() {
            if let Some(lowest) = delta.own_lowest_tx_id(prefix)? {
                return Ok(Some(lowest));
            }
        }
        Ok(None)
    }

    /// Streams raw rows of transactions after `since_tx_id`, older
    /// generations first. Each transaction is delivered whole.
    pub fn take_rows_since(
        &self,
        since_tx_id: i64,
        prefix: Option<&[u8]>,
        visitor: &mut dyn FnMut(Row) -> Result<bool>,
    ) -> Result<()> {
        for delta in self.chain()?.iter().rev() {
            for entry in delta.own_transactions_since(since_tx_id, prefix)? {
                let rows = entry
                    .fps
                    .iter()
                    .map(|fp| delta.read_row(*fp))
                    .collect::<Result<Vec<_>>>()?;
                for row in rows {
                    if !visitor(row)? {
                        return Ok(());
                    }
                }
            }
        }
        Ok(())
    }

    pub fn flush(&self, fsync: bool) -> Result<()> {
        self.live()?.flush(fsync)
    }

    /// Deletes every generation's log. Used by expunge.
    pub fn remove_all(&self) -> Result<()> {
        for delta in self.chain()? {
            delta.remove_log()?;
        }
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
