//! Collaborators the partition consults but does not implement.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Supplies `(timestamp, version)` ids for new writes. Ids must be distinct
/// and increase per provider.
pub trait OrderIdProvider: Send + Sync {
    fn next_id(&self) -> i64;
}

/// Wall-clock milliseconds, bumped past the last id handed out.
#[derive(Debug, Default)]
pub struct MonotonicOrderIds {
    last: AtomicI64,
}

impl MonotonicOrderIds {
    pub fn new() -> Self {
        Self::default()
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

impl OrderIdProvider for MonotonicOrderIds {
    fn next_id(&self) -> i64 {
        let now = now_millis();
        let mut last = self.last.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(current) => last = current,
            }
        }
    }
}

/// Liveness and leadership signals from the replication layer.
pub trait LivenessOracle: Send + Sync {
    /// Whether writes may be accepted at all.
    fn is_online(&self) -> bool;

    /// Whether this replica's acknowledgement makes a write durable.
    fn is_authoritative(&self) -> bool;
}

/// A single-node oracle: always online and authoritative.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOnline;

impl LivenessOracle for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }

    fn is_authoritative(&self) -> bool {
        true
    }
}

/// An oracle whose signals can be flipped at runtime.
#[derive(Debug)]
pub struct SwitchableOracle {
    online: AtomicBool,
    authoritative: AtomicBool,
}

impl SwitchableOracle {
    pub fn new(online: bool, authoritative: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
            authoritative: AtomicBool::new(authoritative),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn set_authoritative(&self, authoritative: bool) {
        self.authoritative.store(authoritative, Ordering::SeqCst);
    }
}

impl LivenessOracle for SwitchableOracle {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn is_authoritative(&self) -> bool {
        self.authoritative.load(Ordering::SeqCst)
    }
}
