//! On-disk placement of index trees.
//!
//! ```text
//! <root>/stripe-<n>/active      the index serving reads and writes
//!                  /compacting  a replacement being built
//!                  /compacted   a finished replacement awaiting the swap
//!                  /backup      the previous index during the swap
//! ```
//!
//! A compaction commit moves `compacting → compacted`, `active → backup`,
//! `compacted → active`, then deletes `backup`. [`Layout::reconcile`] rolls
//! an interrupted sequence back or forward from whichever directories exist.

use crate::encoding::bincode;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const META: &str = "META";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexState {
    Active,
    Compacting,
    Compacted,
    Backup,
}

impl IndexState {
    fn dir_name(&self) -> &'static str {
        match self {
            IndexState::Active => "active",
            IndexState::Compacting => "compacting",
            IndexState::Compacted => "compacted",
            IndexState::Backup => "backup",
        }
    }
}

/// Persisted next to a tree so recovery knows which compaction produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub generation: u64,
}

impl IndexMeta {
    pub fn read(dir: &Path) -> Result<Self> {
        let bytes = fs::read(dir.join(META))?;
        bincode::deserialize("index meta", &bytes)
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{}.tmp", META));
        let mut file = fs::File::create(&tmp)?;
        bincode::serialize_into("index meta", &mut file, self)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, dir.join(META))?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
    stripes: u32,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>, stripes: u32) -> Self {
        Self {
            root: root.into(),
            stripes: stripes.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stripes(&self) -> u32 {
        self.stripes
    }

    pub fn dir(&self, stripe: u32, state: IndexState) -> PathBuf {
        self.root
            .join(format!("stripe-{}", stripe))
            .join(state.dir_name())
    }

    fn existing(&self, stripe: u32, state: IndexState) -> Option<PathBuf> {
        let dir = self.dir(stripe, state);
        dir.is_dir().then_some(dir)
    }

    /// Stripe numbers present on disk, including ones beyond the configured count.
    fn stripes_on_disk(&self) -> Result<Vec<u32>> {
        let mut found = Vec::new();
        if !self.root.is_dir() {
            return Ok(found);
        }
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            if let Some(n) = name
                .to_str()
                .and_then(|n| n.strip_prefix("stripe-"))
                .and_then(|n| n.parse().ok())
            {
                found.push(n);
            }
        }
        found.sort_unstable();
        Ok(found)
    }

    /// Resolves an interrupted compaction and returns the active stripe with
    /// its metadata, or `None` when no index exists yet.
    pub fn reconcile(&self) -> Result<Option<(u32, IndexMeta)>> {
        let stripes = self.stripes_on_disk()?;

        for stripe in &stripes {
            if let Some(dir) = self.existing(*stripe, IndexState::Compacting) {
                tracing::info!(?dir, "Discarding unfinished index build");
                fs::remove_dir_all(&dir)?;
            }
        }

        let active: Vec<u32> = stripes
            .iter()
            .copied()
            .filter(|s| self.existing(*s, IndexState::Active).is_some())
            .collect();

        for stripe in &stripes {
            let Some(compacted) = self.existing(*stripe, IndexState::Compacted) else {
                continue;
            };
            if active.is_empty() {
                // The previous index was already moved aside: finish the swap.
                let target = self.dir(*stripe, IndexState::Active);
                tracing::info!(from = ?compacted, to = ?target, "Completing interrupted index swap");
                fs::rename(&compacted, &target)?;
            } else {
                tracing::info!(dir = ?compacted, "Rolling back interrupted index swap");
                fs::remove_dir_all(&compacted)?;
            }
        }

        let mut best: Option<(u32, IndexMeta)> = None;
        for stripe in &stripes {
            let Some(dir) = self.existing(*stripe, IndexState::Active) else {
                continue;
            };
            let meta = IndexMeta::read(&dir)?;
            if best.map_or(true, |(_, b)| meta.generation > b.generation) {
                best = Some((*stripe, meta));
            }
        }

        if best.is_none() {
            // Only a backup survived: restore it.
            for stripe in &stripes {
                if let Some(backup) = self.existing(*stripe, IndexState::Backup) {
                    let target = self.dir(*stripe, IndexState::Active);
                    tracing::warn!(from = ?backup, "Restoring index from backup");
                    fs::rename(&backup, &target)?;
                    return self.reconcile();
                }
            }
            return Ok(None);
        }

        for stripe in &stripes {
            if let Some(backup) = self.existing(*stripe, IndexState::Backup) {
                fs::remove_dir_all(&backup)?;
            }
            let stale = self.dir(*stripe, IndexState::Active);
            if best.map_or(false, |(s, _)| s != *stripe) && stale.is_dir() {
                tracing::warn!(dir = ?stale, "Removing superseded index");
                fs::remove_dir_all(&stale)?;
            }
        }

        Ok(best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make(layout: &Layout, stripe: u32, state: IndexState, generation: u64) -> Result<()> {
        IndexMeta { generation }.write(&layout.dir(stripe, state))
    }

    #[test]
    fn test_empty_root() -> Result<()> {
        let dir = tempdir()?;
        let layout = Layout::new(dir.path().join("index"), 2);
        assert_eq!(layout.reconcile()?, None);
        Ok(())
    }

    #[test]
    fn test_discards_unfinished_build() -> Result<()> {
        let dir = tempdir()?;
        let layout = Layout::new(dir.path(), 2);
        make(&layout, 0, IndexState::Active, 3)?;
        make(&layout, 1, IndexState::Compacting, 4)?;

        assert_eq!(layout.reconcile()?, Some((0, IndexMeta { generation: 3 })));
        assert!(!layout.dir(1, IndexState::Compacting).exists());
        Ok(())
    }

    #[test]
    fn test_rolls_back_before_active_moved() -> Result<()> {
        let dir = tempdir()?;
        let layout = Layout::new(dir.path(), 1);
        make(&layout, 0, IndexState::Active, 1)?;
        make(&layout, 0, IndexState::Compacted, 2)?;

        assert_eq!(layout.reconcile()?, Some((0, IndexMeta { generation: 1 })));
        assert!(!layout.dir(0, IndexState::Compacted).exists());
        Ok(())
    }

    #[test]
    fn test_rolls_forward_after_active_moved() -> Result<()> {
        let dir = tempdir()?;
        let layout = Layout::new(dir.path(), 2);
        make(&layout, 0, IndexState::Backup, 1)?;
        make(&layout, 1, IndexState::Compacted, 2)?;

        assert_eq!(layout.reconcile()?, Some((1, IndexMeta { generation: 2 })));
        assert!(!layout.dir(0, IndexState::Backup).exists());
        assert!(layout.dir(1, IndexState::Active).is_dir());
        Ok(())
    }

    #[test]
    fn test_restores_lone_backup() -> Result<()> {
        let dir = tempdir()?;
        let layout = Layout::new(dir.path(), 1);
        make(&layout, 0, IndexState::Backup, 5)?;

        assert_eq!(layout.reconcile()?, Some((0, IndexMeta { generation: 5 })));
        Ok(())
    }
}
