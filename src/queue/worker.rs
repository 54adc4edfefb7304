//! Queue workers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::job_queue::JobQueue;
use crate::Result;
use crate::db::JobRecord;

/// Processes jobs of one queue
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Run a job; the returned value is stored as the job result
    async fn handle(&self, job: &JobRecord) -> Result<Option<serde_json::Value>>;
}

/// Workers serving one queue
pub struct WorkerPool {
    queue: String,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers for `queue`
    ///
    /// Idle workers wake on enqueue in this process and re-check the store
    /// every `poll_interval` to pick up jobs enqueued elsewhere.
    #[must_use]
    pub fn spawn(
        queue: JobQueue,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..concurrency.max(1))
            .map(|worker| {
                let queue = queue.clone();
                let handler = Arc::clone(&handler);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_worker(worker, queue, handler, poll_interval, shutdown).await;
                })
            })
            .collect();

        tracing::info!(queue = %queue.name(), concurrency, "workers started");
        Self {
            queue: queue.name().to_string(),
            shutdown,
            handles,
        }
    }

    /// Stop taking jobs and wait for in-flight jobs to finish
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(queue = %self.queue, error = %e, "worker task failed");
            }
        }
        tracing::info!(queue = %self.queue, "workers stopped");
    }
}

async fn run_worker(
    worker: usize,
    queue: JobQueue,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::debug!(queue = %queue.name(), worker, "worker waiting for jobs");

    while !shutdown.is_cancelled() {
        match queue.claim() {
            Ok(Some(job)) => process(&queue, handler.as_ref(), &job).await,
            Ok(None) => {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = queue.notified() => {}
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(e) => {
                tracing::error!(queue = %queue.name(), error = %e, "failed to claim job");
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }
}

async fn process(queue: &JobQueue, handler: &dyn JobHandler, job: &JobRecord) {
    tracing::info!(queue = %queue.name(), job_id = job.id, name = %job.name, attempt = job.attempts, "processing job");

    let outcome = match handler.handle(job).await {
        Ok(result) => {
            tracing::info!(queue = %queue.name(), job_id = job.id, "job completed");
            Ok(result)
        }
        Err(e) => {
            tracing::warn!(queue = %queue.name(), job_id = job.id, error = %e, "job failed");
            Err(e.to_string())
        }
    };

    if let Err(e) = queue.finish(job.id, outcome) {
        tracing::error!(queue = %queue.name(), job_id = job.id, error = %e, "failed to record job outcome");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::Error;
    use crate::db::{JobStatus, init_memory};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Echo {
        async fn handle(&self, job: &JobRecord) -> Result<Option<serde_json::Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if job.payload["fail"] == json!(true) {
                return Err(Error::Hardware("motor stalled".into()));
            }
            Ok(Some(job.payload.clone()))
        }
    }

    #[tokio::test]
    async fn workers_complete_and_fail_jobs() {
        let queue = JobQueue::new("test", init_memory().unwrap());
        let handler = Arc::new(Echo {
            calls: AtomicUsize::new(0),
        });
        let pool = WorkerPool::spawn(
            queue.clone(),
            handler.clone(),
            1,
            Duration::from_millis(10),
        );

        let ok = queue.enqueue("work", &json!({"n": 1})).unwrap();
        let bad = queue.enqueue("work", &json!({"fail": true})).unwrap();

        let ok = queue.wait_for(ok.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(ok.status, JobStatus::Completed);
        assert_eq!(ok.result, Some(json!({"n": 1})));

        let bad = queue.wait_for(bad.id, Duration::from_secs(5)).await.unwrap();
        assert_eq!(bad.status, JobStatus::Failed);
        assert!(bad.error.unwrap().contains("motor stalled"));

        pool.shutdown().await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_leaves_waiting_jobs() {
        let queue = JobQueue::new("test", init_memory().unwrap());
        let pool = WorkerPool::spawn(
            queue.clone(),
            Arc::new(Echo {
                calls: AtomicUsize::new(0),
            }),
            2,
            Duration::from_millis(10),
        );
        pool.shutdown().await;

        let job = queue.enqueue("work", &json!({})).unwrap();
        assert_eq!(
            queue.get(job.id).unwrap().unwrap().status,
            JobStatus::Waiting
        );
    }
}
