//! Periodic background work for a partition.
//!
//! Each registered task gets its own tokio timer loop. A run that overlaps
//! the next tick delays it rather than stacking runs, and shutdown is
//! broadcast to every loop at once.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::Error;

/// Context provided to background tasks during execution
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// A unit of periodic work.
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// How often to run this task
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

pub struct Scheduler {
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Starts a timer loop for `task`. Must be called inside a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let name = task.name();
        let handle = self.spawn_timer_loop(task);
        self.tasks.lock()?.push((name, handle));
        tracing::debug!(task = name, "Registered background task");
        Ok(self)
    }

    pub fn task_count(&self) -> Result<usize> {
        Ok(self.tasks.lock()?.len())
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            tracing::error!(
                                task = task.name(),
                                run_id,
                                error = %e,
                                "Background task failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::info!(task = task.name(), runs = run_id, "Task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signals every loop to stop and waits for in-flight runs to finish.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let tasks = std::mem::take(&mut *self.tasks.lock()?);
        for (name, task) in tasks {
            task.await
                .map_err(|e| Error::InvalidState(format!("task {} failed to join: {}", name, e)))?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
