//! Background tasks driving merges, compactions and status logging.
//!
//! Partition work is blocking file I/O, so each run moves onto tokio's
//! blocking pool.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::partition::Partition;
use crate::scheduler::{BackgroundTask, Context, Scheduler};
use crate::Error;

async fn blocking<T, F>(partition: &Arc<Partition>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Partition) -> Result<T> + Send + 'static,
{
    let partition = partition.clone();
    tokio::task::spawn_blocking(move || f(&partition))
        .await
        .map_err(|e| Error::InvalidState(format!("blocking task failed: {}", e)))?
}

pub struct MergeTask {
    partition: Arc<Partition>,
}

impl MergeTask {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MergeTask {
    fn name(&self) -> &'static str {
        "delta-merge"
    }

    fn interval(&self) -> Duration {
        self.partition.config().merge_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        blocking(&self.partition, |p| {
            if p.needs_merge()? {
                p.merge_delta()?;
            }
            Ok(())
        })
        .await
    }
}

pub struct CompactionTask {
    partition: Arc<Partition>,
}

impl CompactionTask {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.partition.config().compaction_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        blocking(&self.partition, |p| {
            if !p.needs_compaction() {
                return Ok(());
            }
            match p.compact_now() {
                Ok(_) | Err(Error::CompactionInProgress) => Ok(()),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

pub struct StatusTask {
    partition: Arc<Partition>,
}

impl StatusTask {
    pub fn new(partition: Arc<Partition>) -> Self {
        Self { partition }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for StatusTask {
    fn name(&self) -> &'static str {
        "status"
    }

    fn interval(&self) -> Duration {
        self.partition.config().status_interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let status = blocking(&self.partition, |p| p.status()).await?;
        tracing::info!(
            run_id = ctx.run_id,
            pending = status.pending,
            merging = status.merging,
            generation = status.generation,
            stripe = status.stripe,
            highest_merged_tx_id = status.highest_merged_tx_id,
            base_log_bytes = status.base_log_bytes,
            added = status.index_stats.added,
            clobbered = status.index_stats.clobbered,
            "Partition status"
        );
        Ok(())
    }
}

/// Registers the merge, compaction and status tasks for `partition`.
pub fn schedule(scheduler: &Scheduler, partition: &Arc<Partition>) -> Result<()> {
    scheduler
        .register(Arc::new(MergeTask::new(partition.clone())))?
        .register(Arc::new(CompactionTask::new(partition.clone())))?
        .register(Arc::new(StatusTask::new(partition.clone())))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CompactionConfig, IndexBackend, PartitionConfig};
    use crate::oracle::{AlwaysOnline, MonotonicOrderIds};
    use tempfile::tempdir;

    fn partition(dir: &std::path::Path) -> Result<Arc<Partition>> {
        let config = PartitionConfig::new(dir)
            .index_backend(IndexBackend::Memory)
            .merge_threshold(5)
            .merge_interval(Duration::from_millis(10))
            .compaction_interval(Duration::from_millis(10))
            .status_interval(Duration::from_millis(10))
            .compaction(CompactionConfig::default().factor(0.25));
        Ok(Arc::new(Partition::open(
            config,
            Arc::new(AlwaysOnline),
            Arc::new(MonotonicOrderIds::new()),
        )?))
    }

    #[tokio::test]
    async fn test_merge_task_drains_delta() -> Result<()> {
        let dir = tempdir()?;
        let p = partition(dir.path())?;
        for i in 0..5 {
            p.put(b"p", format!("k{}", i).as_bytes(), b"v")?;
        }

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(MergeTask::new(p.clone())))?;
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await?;

        let status = p.status()?;
        assert_eq!(status.pending, 0);
        assert_eq!(status.index_stats.added, 5);
        assert_eq!(p.get(b"p", b"k3")?, Some(b"v".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn test_compaction_task_runs_when_due() -> Result<()> {
        let dir = tempdir()?;
        let p = partition(dir.path())?;
        p.put(b"p", b"k", b"v")?;
        p.merge_delta()?;
        // (0 + 1) / (1 + 1) already exceeds 0.25
        assert!(p.needs_compaction());

        let scheduler = Scheduler::new();
        schedule(&scheduler, &p)?;
        assert_eq!(scheduler.task_count()?, 3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        scheduler.shutdown().await?;

        assert!(p.status()?.generation >= 1);
        assert_eq!(p.get(b"p", b"k")?, Some(b"v".to_vec()));
        Ok(())
    }
}
