use super::record::RecordFile;
use super::{LogEntry, RowLog};
use crate::encoding::bincode;
use crate::error::Result;
use crate::Error;
use std::path::Path;

const MAGIC: &[u8; 8] = b"DKV\x00ROWS";

/// Row log stored in a single framed file; an `fp` is a frame offset.
#[derive(Debug)]
pub struct FileRowLog {
    file: RecordFile,
}

impl FileRowLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            file: RecordFile::open(path, MAGIC)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn is_empty(&self) -> bool {
        self.file.is_empty()
    }

    /// Removes the backing file. Outstanding readers keep their handle.
    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn to_offset(fp: i64) -> Result<u64> {
    u64::try_from(fp).map_err(|_| Error::InvalidInput(format!("negative fp {}", fp)))
}

impl RowLog for FileRowLog {
    fn append(&self, entries: &[LogEntry]) -> Result<Vec<i64>> {
        let payloads = entries
            .iter()
            .map(|entry| bincode::serialize("log entry", entry))
            .collect::<Result<Vec<_>>>()?;
        let offsets = self.file.append(&payloads)?;
        Ok(offsets.into_iter().map(|o| o as i64).collect())
    }

    fn read(&self, fp: i64) -> Result<LogEntry> {
        let payload = self.file.read(to_offset(fp)?)?;
        bincode::deserialize("log entry", &payload)
    }

    fn scan(
        &self,
        from_fp: Option<i64>,
        reverse: bool,
        visitor: &mut dyn FnMut(i64, LogEntry) -> Result<bool>,
    ) -> Result<()> {
        let from = from_fp.map(to_offset).transpose()?;
        self.file.scan(from, reverse, &mut |offset, payload| {
            let entry: LogEntry = bincode::deserialize("log entry", &payload)?;
            visitor(offset as i64, entry)
        })
    }

    fn flush(&self, fsync: bool) -> Result<()> {
        self.file.flush(fsync)
    }

    fn len(&self) -> u64 {
        self.file.end()
    }
}
