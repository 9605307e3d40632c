//! Per-partition storage core.
//!
//! Writes land in a [`delta::DeltaOverlay`] backed by an append log, and are
//! later merged into a base [`index::PointerIndex`] by the
//! [`compactor::MergeCompactor`]. The base is periodically rewritten by a
//! copy-on-write compaction. A [`gate::ConcurrencyGate`] keeps ordinary reads
//! and writes apart from structural swaps. [`partition::Partition`] ties the
//! pieces together.

pub mod base;
pub mod compactor;
pub mod config;
pub mod delta;
pub mod descriptor;
pub mod encoding;
pub mod error;
pub mod gate;
pub mod index;
pub mod key;
pub mod log;
pub mod oracle;
pub mod partition;
pub mod pointer;
pub mod scheduler;
pub mod tasks;

pub use config::{CompactionConfig, IndexBackend, PartitionConfig};
pub use error::{Error, Result};
pub use gate::ConcurrencyGate;
pub use index::{LsmPointerIndex, MemoryPointerIndex, PointerIndex};
pub use key::CompositeKey;
pub use oracle::{AlwaysOnline, LivenessOracle, MonotonicOrderIds, OrderIdProvider};
pub use partition::{CommitResult, Partition, PartitionStatus};
pub use pointer::{MergeMode, Pointer, TimestampedValue, Update};
