//! Counting-permit gate separating ordinary operations from structural ones.
//!
//! Point and range operations take one permit for their duration; structural
//! operations (compaction commit, expunge, close, descriptor updates) take all
//! of them, which drains every in-flight ordinary operation first.
//!
//! Acquisition is reentrant per thread: a thread that already holds a permit
//! nests without consuming another one, and the permit is returned when the
//! outermost guard drops. A thread holding one shared permit may escalate to
//! exclusive; it then waits for the remaining `N - 1`. Only one thread may
//! escalate at a time: a second escalator would wait on the permit the first
//! one needs, so it is refused with [`Error::InvalidState`].
//!
//! Once a thread is waiting for exclusive access, new (non-nested) shared
//! acquisitions queue behind it so a steady stream of readers cannot starve
//! structural work.

use crate::error::Result;
use crate::Error;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

pub const DEFAULT_PERMITS: usize = 1024;

#[derive(Debug, Default, Clone, Copy)]
struct Hold {
    shared: usize,
    exclusive: usize,
    permits: usize,
}

#[derive(Debug)]
struct GateState {
    available: usize,
    exclusive_waiters: usize,
    escalating: Option<ThreadId>,
    holders: HashMap<ThreadId, Hold>,
}

#[derive(Debug)]
pub struct ConcurrencyGate {
    permits: usize,
    state: Mutex<GateState>,
    released: Condvar,
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new(DEFAULT_PERMITS)
    }
}

impl ConcurrencyGate {
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            permits,
            state: Mutex::new(GateState {
                available: permits,
                exclusive_waiters: 0,
                escalating: None,
                holders: HashMap::new(),
            }),
            released: Condvar::new(),
        }
    }

    pub fn permits(&self) -> usize {
        self.permits
    }

    /// Permits not currently held by anyone.
    pub fn available(&self) -> usize {
        self.lock().available
    }

    /// Acquire one permit for an ordinary operation.
    pub fn shared(&self) -> Result<SharedPermit<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;

        if let Some(hold) = state.holders.get_mut(&me) {
            hold.shared += 1;
            return Ok(SharedPermit {
                gate: self,
                _not_send: PhantomData,
            });
        }

        while state.available == 0 || state.exclusive_waiters > 0 {
            state = self.released.wait(state)?;
        }
        state.available -= 1;
        state.holders.insert(
            me,
            Hold {
                shared: 1,
                exclusive: 0,
                permits: 1,
            },
        );

        Ok(SharedPermit {
            gate: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire every permit for a structural operation.
    pub fn exclusive(&self) -> Result<ExclusivePermit<'_>> {
        let me = thread::current().id();
        let mut state = self.state.lock()?;

        let held = state.holders.get(&me).copied().unwrap_or_default();
        if held.exclusive > 0 {
            if let Some(hold) = state.holders.get_mut(&me) {
                hold.exclusive += 1;
            }
            return Ok(ExclusivePermit {
                gate: self,
                _not_send: PhantomData,
            });
        }

        let escalation = held.permits > 0;
        if escalation {
            if let Some(other) = state.escalating {
                return Err(Error::InvalidState(format!(
                    "thread {:?} is already escalating to exclusive access",
                    other
                )));
            }
            state.escalating = Some(me);
        }

        let needed = self.permits - held.permits;
        state.exclusive_waiters += 1;
        while state.available < needed {
            state = match self.released.wait(state) {
                Ok(state) => state,
                Err(poisoned) => {
                    let mut state = poisoned.into_inner();
                    state.exclusive_waiters -= 1;
                    if escalation {
                        state.escalating = None;
                    }
                    drop(state);
                    self.released.notify_all();
                    return Err(Error::MutexPoisoned);
                }
            };
        }
        state.exclusive_waiters -= 1;
        if escalation {
            state.escalating = None;
        }
        state.available -= needed;

        let hold = state.holders.entry(me).or_default();
        hold.exclusive = 1;
        hold.permits = self.permits;

        Ok(ExclusivePermit {
            gate: self,
            _not_send: PhantomData,
        })
    }

    fn lock(&self) -> MutexGuard<'_, GateState> {
        // Guards release from Drop, where a poisoned lock must not leak permits.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, exclusive: bool) {
        let me = thread::current().id();
        let mut state = self.lock();

        let Some(hold) = state.holders.get_mut(&me) else {
            return;
        };

        if exclusive {
            hold.exclusive -= 1;
            if hold.exclusive == 0 {
                // Fall back to the single permit an outer shared guard still needs.
                let keep = if hold.shared > 0 { 1 } else { 0 };
                let returned = hold.permits - keep;
                hold.permits = keep;
                state.available += returned;
            }
        } else {
            hold.shared -= 1;
            if hold.shared == 0 && hold.exclusive == 0 {
                let returned = hold.permits;
                hold.permits = 0;
                state.available += returned;
            }
        }

        if let Some(hold) = state.holders.get(&me) {
            if hold.shared == 0 && hold.exclusive == 0 {
                state.holders.remove(&me);
            }
        }

        drop(state);
        self.released.notify_all();
    }
}

/// RAII guard for one shared permit. Bound to the acquiring thread.
pub struct SharedPermit<'a> {
    gate: &'a ConcurrencyGate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedPermit<'_> {
    fn drop(&mut self) {
        self.gate.release(false);
    }
}

/// RAII guard for exclusive access. Bound to the acquiring thread.
pub struct ExclusivePermit<'a> {
    gate: &'a ConcurrencyGate,
    _not_send: PhantomData<*const ()>,
}

impl Drop for ExclusivePermit<'_> {
    fn drop(&mut self) {
        self.gate.release(true);
    }
}
