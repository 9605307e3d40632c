use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    Decode(&'static str, String),
    Encode(&'static str, String),
    CorruptedLog(String),
    ChecksumMismatch(u64),
    MutexPoisoned,
    InvalidState(String),
    InvalidInput(String),
    // Structural operations
    CompactionInProgress,
    MergeInProgress,
    Aborted(String),
    // Delta invariants
    TxOrderViolation {
        prefix: Vec<u8>,
        last: i64,
        incoming: i64,
    },
    DeltaPoisoned,
    // Partition lifecycle
    PartitionOffline,
    Closed,
    Expunged,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::Decode(what, msg) => write!(f, "Failed to decode {}: {}", what, msg),
            Error::Encode(what, msg) => write!(f, "Failed to encode {}: {}", what, msg),
            Error::CorruptedLog(msg) => write!(f, "Corrupted log: {}", msg),
            Error::ChecksumMismatch(fp) => write!(f, "Checksum mismatch at fp {}", fp),
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::InvalidInput(msg) => write!(f, "Invalid input: {}", msg),
            Error::CompactionInProgress => write!(f, "A compaction is already in flight"),
            Error::MergeInProgress => write!(f, "A delta merge is already in flight"),
            Error::Aborted(msg) => write!(f, "Operation aborted: {}", msg),
            Error::TxOrderViolation {
                prefix,
                last,
                incoming,
            } => write!(
                f,
                "Transaction id {} appended after {} for prefix {:?}",
                incoming, last, prefix
            ),
            Error::DeltaPoisoned => write!(f, "Delta refused further appends after an ordering fault"),
            Error::PartitionOffline => write!(f, "Partition is offline"),
            Error::Closed => write!(f, "Partition is closed"),
            Error::Expunged => write!(f, "Partition was expunged"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err) => Some(err),
            _ => None,
        }
    }
}
