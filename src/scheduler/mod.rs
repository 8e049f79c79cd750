use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};
use crate::folder::{CacheFlushTask, CheckpointTask, FolderStore, MetricsTask, PurgeTask};

/// Handed to a task on every run
pub struct Context {
    pub task_name: &'static str,
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// A periodic piece of folder housekeeping
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging
    fn name(&self) -> &'static str;

    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs periodic tasks until shut down
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a periodic background task
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        self
    }

    /// Register purge, checkpoint, cache flush and metrics for `store`.
    pub fn register_folder(&self, store: &FolderStore) -> &Self {
        self.register(Arc::new(PurgeTask::new(store.clone())))
            .register(Arc::new(CheckpointTask::new(store.clone())))
            .register(Arc::new(CacheFlushTask::new(store.clone())))
            .register(Arc::new(MetricsTask::new(store.clone())))
    }

    pub fn task_count(&self) -> usize {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // A slow purge or checkpoint must not be followed by a burst of runs.
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
                                "Task execution failed"
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

    /// Signal every task and wait for the loops to exit
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let tasks: Vec<_> = self
            .tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            task.await
                .map_err(|e| Error::InvalidState(format!("Task join error: {}", e)))?;
        }

        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::testing::{header, open_store_with};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTask {
        interval: Duration,
        counter: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait::async_trait]
    impl BackgroundTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            self.interval
        }

        async fn execute(&self, _ctx: Context) -> Result<()> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::InvalidState("always fails".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failing_task_keeps_running() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
            fail: true,
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(counter.load(Ordering::SeqCst) > 1);

        scheduler.shutdown().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_shutdown_stops_tasks() -> Result<()> {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingTask {
            interval: Duration::from_millis(10),
            counter: counter.clone(),
            fail: false,
        }));

        tokio::time::sleep(Duration::from_millis(25)).await;
        let count_before_shutdown = counter.load(Ordering::SeqCst);

        let start = std::time::Instant::now();
        scheduler.shutdown().await?;
        assert!(start.elapsed() < Duration::from_millis(100));

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(count_before_shutdown, counter.load(Ordering::SeqCst));
        Ok(())
    }

    #[tokio::test]
    async fn test_folder_tasks() -> Result<()> {
        let config = StoreConfig::new()
            .checkpoint_interval(Duration::from_millis(10))
            .metrics_interval(Duration::from_millis(10));
        let (store, block_store) = open_store_with(config);
        store.add_header(header(1, 1000)).await?;

        let scheduler = Scheduler::new();
        scheduler.register_folder(&store);
        assert_eq!(scheduler.task_count(), 4);

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.shutdown().await?;
        assert!(block_store.checkpoint_count() >= 1);
        assert!(block_store.folder(store.folder_id()).is_some());
        Ok(())
    }
}
