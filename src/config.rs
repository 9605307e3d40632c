use std::path::PathBuf;
use std::time::Duration;

/// Which pointer index implementation backs the base of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    /// Sorted in-memory map, rebuilt from the base log on open.
    Memory,
    /// Persistent log-structured index stored next to the base log.
    Lsm,
}

/// Configuration for a partition store
#[derive(Debug, Clone)]
pub struct PartitionConfig {
    /// Root directory of the partition
    pub dir: PathBuf,

    /// Base index implementation (default: Lsm)
    pub index_backend: IndexBackend,

    /// Values up to this length are inlined in pointers (default: 64 bytes)
    pub inline_threshold: usize,

    /// Pending delta writes that make a merge due (default: 10_000)
    pub merge_threshold: usize,

    /// Merged transactions between two progress markers (default: 1_000)
    pub merge_marker_interval: usize,

    /// Total permits of the concurrency gate (default: 1024)
    pub gate_permits: usize,

    /// Lock stripes used for per-key compare-and-swap (default: 64)
    pub key_lock_stripes: usize,

    /// LSM index memtable size before it is flushed to a run (default: 4MB)
    pub memtable_size: usize,

    /// Number of index stripes under the base directory (default: 1)
    pub stripes: u32,

    /// Fsync the delta log before acknowledging authoritative commits (default: false)
    pub fsync_on_commit: bool,

    /// How often the merge task checks the delta (default: 1s)
    pub merge_interval: Duration,

    /// How often the compaction task checks the base index (default: 30s)
    pub compaction_interval: Duration,

    /// How often the status task logs partition metrics (default: 60s)
    pub status_interval: Duration,

    /// Compaction configuration
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Compact when (clobbered + 1) / (added + 1) exceeds this factor (default: 2.0)
    pub factor: f64,

    /// Tombstones older than `now - tombstone_retention` are dropped, in the
    /// units of the order-id provider (default: 7 days of milliseconds)
    pub tombstone_retention: i64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            factor: 2.0,
            tombstone_retention: 7 * 24 * 60 * 60 * 1000,
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./deltakv"),
            index_backend: IndexBackend::Lsm,
            inline_threshold: 64,
            merge_threshold: 10_000,
            merge_marker_interval: 1_000,
            gate_permits: 1024,
            key_lock_stripes: 64,
            memtable_size: 4 * 1024 * 1024, // 4MB
            stripes: 1,
            fsync_on_commit: false,
            merge_interval: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(60),
            compaction: CompactionConfig::default(),
        }
    }
}

impl PartitionConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn index_backend(mut self, backend: IndexBackend) -> Self {
        self.index_backend = backend;
        self
    }

    pub fn inline_threshold(mut self, bytes: usize) -> Self {
        self.inline_threshold = bytes;
        self
    }

    pub fn merge_threshold(mut self, pending: usize) -> Self {
        self.merge_threshold = pending;
        self
    }

    pub fn merge_marker_interval(mut self, transactions: usize) -> Self {
        self.merge_marker_interval = transactions.max(1);
        self
    }

    pub fn gate_permits(mut self, permits: usize) -> Self {
        self.gate_permits = permits.max(1);
        self
    }

    pub fn key_lock_stripes(mut self, stripes: usize) -> Self {
        self.key_lock_stripes = stripes.max(1);
        self
    }

    pub fn memtable_size(mut self, size: usize) -> Self {
        self.memtable_size = size;
        self
    }

    pub fn stripes(mut self, stripes: u32) -> Self {
        self.stripes = stripes.max(1);
        self
    }

    pub fn fsync_on_commit(mut self, enabled: bool) -> Self {
        self.fsync_on_commit = enabled;
        self
    }

    pub fn merge_interval(mut self, interval: Duration) -> Self {
        self.merge_interval = interval;
        self
    }

    pub fn compaction_interval(mut self, interval: Duration) -> Self {
        self.compaction_interval = interval;
        self
    }

    pub fn status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// Configure compaction settings
    pub fn compaction(mut self, config: CompactionConfig) -> Self {
        self.compaction = config;
        self
    }
}

impl CompactionConfig {
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    pub fn tombstone_retention(mut self, retention: i64) -> Self {
        self.tombstone_retention = retention;
        self
    }
}
