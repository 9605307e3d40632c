//! Persisted partition descriptor.
//!
//! Names the base log generation the index points into and how far delta
//! merges have progressed. Replaced atomically: written to a temp file,
//! fsynced, then renamed over the previous copy.

use crate::encoding::bincode;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const FILE_NAME: &str = "DESCRIPTOR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    /// Committed compactions; selects `base/rows-{generation}.log`.
    pub generation: u64,
    /// Index stripe holding the active base index.
    pub stripe: u32,
    /// Highest transaction id whose rows reached the base index.
    pub highest_merged_tx_id: i64,
}

impl Default for Descriptor {
    fn default() -> Self {
        Self {
            generation: 0,
            stripe: 0,
            highest_merged_tx_id: 0,
        }
    }
}

impl Descriptor {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(FILE_NAME)
    }

    /// Loads the descriptor under `dir`, or `None` for a fresh partition.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = Self::path(dir);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(bincode::deserialize("descriptor", &bytes)?))
    }

    pub fn store(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let tmp = dir.join(format!("{}.tmp", FILE_NAME));
        {
            let mut file = fs::File::create(&tmp)?;
            bincode::serialize_into("descriptor", &mut file, self)?;
            file.flush()?;
            file.sync_all()?;
        }
        fs::rename(&tmp, Self::path(dir))?;
        tracing::debug!(
            generation = self.generation,
            stripe = self.stripe,
            highest_merged_tx_id = self.highest_merged_tx_id,
            "Stored partition descriptor"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_descriptor() -> Result<()> {
        let dir = tempdir()?;
        assert_eq!(Descriptor::load(dir.path())?, None);
        Ok(())
    }

    #[test]
    fn test_store_replaces_previous() -> Result<()> {
        let dir = tempdir()?;
        Descriptor::default().store(dir.path())?;

        let next = Descriptor {
            generation: 3,
            stripe: 1,
            highest_merged_tx_id: 42,
        };
        next.store(dir.path())?;

        assert_eq!(Descriptor::load(dir.path())?, Some(next));
        assert!(!dir.path().join("DESCRIPTOR.tmp").exists());
        Ok(())
    }
}
