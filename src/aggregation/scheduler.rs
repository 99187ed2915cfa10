use crate::error::ConfigError;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A periodic unit of work owned by the [`AggregationScheduler`].
#[async_trait]
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    /// Runs until `cancel` fires. Returns early only when the job cannot be scheduled at all.
    async fn run(&self, cancel: CancellationToken) -> Result<(), ConfigError>;

    /// Called once after `run` has returned.
    async fn shutdown(&self);
}

pub struct AggregationScheduler {
    cancel: CancellationToken,
    tasks: Vec<(Arc<dyn ScheduledJob>, JoinHandle<()>)>,
}

impl AggregationScheduler {
    pub fn new(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            tasks: Vec::new(),
        }
    }

    pub fn start(&mut self, jobs: Vec<Arc<dyn ScheduledJob>>) {
        for job in jobs {
            let token = self.cancel.child_token();
            let task_job = job.clone();
            let handle = tokio::spawn(async move {
                if let Err(err) = task_job.run(token).await {
                    tracing::error!(job = %task_job.name(), error = %err, "aggregation job exited");
                }
            });
            self.tasks.push((job, handle));
        }
        tracing::info!(jobs = self.tasks.len(), "aggregation scheduler started");
    }

    pub fn running(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .count()
    }

    /// Cancels every job and waits for each one to finish its current cycle.
    pub async fn stop_all(&mut self) {
        self.cancel.cancel();
        for (job, handle) in self.tasks.drain(..) {
            if let Err(err) = handle.await {
                tracing::warn!(job = %job.name(), error = %err, "aggregation task failed");
            }
            job.shutdown().await;
        }
        tracing::info!("aggregation scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeJob {
        name: String,
        fail: bool,
        started: AtomicBool,
        finished: AtomicBool,
        shutdowns: AtomicU32,
    }

    impl FakeJob {
        fn named(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                ..Self::default()
            })
        }

        fn failing(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                fail: true,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl ScheduledJob for FakeJob {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, cancel: CancellationToken) -> Result<(), ConfigError> {
            self.started.store(true, Ordering::SeqCst);
            if self.fail {
                return Err(ConfigError::NonPositiveInterval("0s".to_string()));
            }
            cancel.cancelled().await;
            // Simulates a cycle that is still writing when cancellation arrives.
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.finished.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_all_waits_for_every_job() {
        let first = FakeJob::named("temperature");
        let second = FakeJob::named("humidity");
        let mut scheduler = AggregationScheduler::new(CancellationToken::new());
        scheduler.start(vec![
            first.clone() as Arc<dyn ScheduledJob>,
            second.clone() as Arc<dyn ScheduledJob>,
        ]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.running(), 2);
        assert!(first.started.load(Ordering::SeqCst));

        scheduler.stop_all().await;

        for job in [&first, &second] {
            assert!(job.finished.load(Ordering::SeqCst));
            assert_eq!(job.shutdowns.load(Ordering::SeqCst), 1);
        }
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_job_does_not_stop_the_others() {
        let broken = FakeJob::failing("electricity");
        let healthy = FakeJob::named("humidity");
        let mut scheduler = AggregationScheduler::new(CancellationToken::new());
        scheduler.start(vec![
            broken.clone() as Arc<dyn ScheduledJob>,
            healthy.clone() as Arc<dyn ScheduledJob>,
        ]);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.running(), 1);
        assert!(!healthy.finished.load(Ordering::SeqCst));

        scheduler.stop_all().await;
        assert!(healthy.finished.load(Ordering::SeqCst));
        assert_eq!(broken.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn parent_cancellation_reaches_jobs() {
        let parent = CancellationToken::new();
        let job = FakeJob::named("temperature");
        let mut scheduler = AggregationScheduler::new(parent.child_token());
        scheduler.start(vec![job.clone() as Arc<dyn ScheduledJob>]);

        parent.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(job.finished.load(Ordering::SeqCst));

        scheduler.stop_all().await;
        assert_eq!(job.shutdowns.load(Ordering::SeqCst), 1);
    }
}
