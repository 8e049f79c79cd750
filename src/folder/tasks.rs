use std::time::Duration;

use super::FolderStore;
use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
};

pub struct PurgeTask {
    store: FolderStore,
}

impl PurgeTask {
    pub fn new(store: FolderStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for PurgeTask {
    fn name(&self) -> &'static str {
        "message-purge"
    }

    fn interval(&self) -> Duration {
        self.store.config().purge_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if !self.store.purge_scheduled() {
            return Ok(());
        }

        let store = &self.store;
        store
            .run_mutexed("purge", |release| async move {
                release.finish(store.purge_excess_messages().await)
            })
            .await?;

        Ok(())
    }
}

pub struct CheckpointTask {
    store: FolderStore,
}

impl CheckpointTask {
    pub fn new(store: FolderStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CheckpointTask {
    fn name(&self) -> &'static str {
        "checkpoint"
    }

    fn interval(&self) -> Duration {
        self.store.config().checkpoint_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.store.checkpoint().await?;
        Ok(())
    }
}

pub struct CacheFlushTask {
    store: FolderStore,
}

impl CacheFlushTask {
    pub fn new(store: FolderStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CacheFlushTask {
    fn name(&self) -> &'static str {
        "cache-flush"
    }

    fn interval(&self) -> Duration {
        self.store.config().idle_flush_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // Busy folders get flushed by the next idle timer instead.
        self.store.flush_cache_if_idle();
        Ok(())
    }
}

pub struct MetricsTask {
    store: FolderStore,
}

impl MetricsTask {
    pub fn new(store: FolderStore) -> Self {
        Self { store }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.store.config().metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.store.log_metrics()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::{PurgeConfig, StoreConfig};
    use crate::model::BodyRecord;
    use crate::scheduler::Scheduler;
    use crate::testing::{header, open_store_with};

    fn ctx() -> Context {
        let (tx, rx) = tokio::sync::broadcast::channel(1);
        drop(tx);
        Context {
            task_name: "test",
            run_id: 1,
            shutdown: rx,
        }
    }

    #[tokio::test]
    async fn test_purge_task_only_runs_when_scheduled() -> Result<()> {
        let config = StoreConfig::new().purge(PurgeConfig::default().hard_max_block_limit(0));
        let (store, _) = open_store_with(config);
        store.add_header(header(1, 1000)).await?;

        let task = PurgeTask::new(store.clone());
        task.execute(ctx()).await?;
        assert_eq!(store.known_message_count(), 1);

        store.lock().purge_scheduled = true;
        task.execute(ctx()).await?;
        assert!(!store.purge_scheduled());
        assert_eq!(store.known_message_count(), 0);
        assert!(store.mutex_idle());
        Ok(())
    }

    #[tokio::test]
    async fn test_checkpoint_and_flush_tasks() -> Result<()> {
        let (store, block_store) = open_store_with(StoreConfig::default());
        store.add_header(header(1, 1000)).await?;
        store.add_body(1, BodyRecord::new(1000)).await?;

        CacheFlushTask::new(store.clone()).execute(ctx()).await?;
        // Dirty blocks are never flushed.
        assert_eq!(store.resident_block_count(), 2);

        CheckpointTask::new(store.clone()).execute(ctx()).await?;
        assert_eq!(block_store.checkpoint_count(), 1);

        CacheFlushTask::new(store.clone()).execute(ctx()).await?;
        assert_eq!(store.resident_block_count(), 0);
        MetricsTask::new(store).execute(ctx()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_tasks_run_under_scheduler() -> Result<()> {
        let config = StoreConfig::new().checkpoint_interval(Duration::from_millis(10));
        let (store, block_store) = open_store_with(config);
        store.add_header(header(1, 1000)).await?;

        let scheduler = Scheduler::new();
        scheduler.register(Arc::new(CheckpointTask::new(store.clone())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown().await?;

        assert_eq!(block_store.checkpoint_count(), 1);
        assert!(store.generate_persistence_info().is_none());
        Ok(())
    }
}
