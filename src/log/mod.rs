//! Append logs holding row versions.
//!
//! The core treats the log as an external primitive: `append` hands back one
//! file pointer (`fp`) per entry, `read` resolves an `fp`, and `scan` walks
//! entries in either direction. [`FileRowLog`] is the on-disk implementation
//! used for both delta logs and base logs.

pub mod file;
pub mod record;

pub use file::FileRowLog;

use crate::error::Result;
use crate::pointer::Row;
use crate::Error;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogEntry {
    Row(Row),
    /// Progress of a delta merge: every transaction up to `highest_tx_id`
    /// has reached the base index. `complete` marks the end of the merge.
    MergeMarker { highest_tx_id: i64, complete: bool },
}

pub trait RowLog: Send + Sync {
    /// Appends entries as one write, returning an `fp` per entry.
    fn append(&self, entries: &[LogEntry]) -> Result<Vec<i64>>;

    fn read(&self, fp: i64) -> Result<LogEntry>;

    /// Visits entries from `from_fp` (inclusive; `None` = the first entry, or
    /// the last one when `reverse`). The visitor returns `false` to stop.
    fn scan(
        &self,
        from_fp: Option<i64>,
        reverse: bool,
        visitor: &mut dyn FnMut(i64, LogEntry) -> Result<bool>,
    ) -> Result<()>;

    fn flush(&self, fsync: bool) -> Result<()>;

    /// Size in bytes of everything appended so far.
    fn len(&self) -> u64;

    fn read_row(&self, fp: i64) -> Result<Row> {
        match self.read(fp)? {
            LogEntry::Row(row) => Ok(row),
            LogEntry::MergeMarker { .. } => Err(Error::CorruptedLog(format!(
                "fp {} holds a merge marker, not a row",
                fp
            ))),
        }
    }

    fn append_rows(&self, rows: &[Row]) -> Result<Vec<i64>> {
        let entries: Vec<LogEntry> = rows.iter().cloned().map(LogEntry::Row).collect();
        self.append(&entries)
    }
}
