//! Named durable queue

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, broadcast};

use crate::db::{DbPool, JobCounts, JobRecord, JobRepo, JobStatus, NewJob};
use crate::{Error, Result};

const OUTCOME_CAPACITY: usize = 256;

/// Upper bound between store re-reads while waiting on a job
const STATUS_RECHECK: Duration = Duration::from_millis(250);

/// Finished job notification
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job_id: i64,
    pub status: JobStatus,
}

/// Options for [`JobQueue::enqueue_with`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Return the existing job when a non-failed job has this key
    pub dedup_key: Option<String>,
    /// Repeating the job would repeat a physical effect
    pub incremental: bool,
}

/// Handle on one named queue; clones share wakeups and outcome events
#[derive(Clone)]
pub struct JobQueue {
    name: Arc<str>,
    repo: JobRepo,
    notify: Arc<Notify>,
    outcomes: broadcast::Sender<JobOutcome>,
}

impl JobQueue {
    #[must_use]
    pub fn new(name: &str, pool: DbPool) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CAPACITY);
        Self {
            name: Arc::from(name),
            repo: JobRepo::new(pool),
            notify: Arc::new(Notify::new()),
            outcomes,
        }
    }

    /// Queue name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a job
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized or stored
    pub fn enqueue<T: Serialize>(&self, job_name: &str, payload: &T) -> Result<JobRecord> {
        self.enqueue_with(job_name, payload, &EnqueueOptions::default())
    }

    /// Append a job with dedup and replay options
    ///
    /// # Errors
    ///
    /// Returns error if the payload cannot be serialized or stored
    pub fn enqueue_with<T: Serialize>(
        &self,
        job_name: &str,
        payload: &T,
        options: &EnqueueOptions,
    ) -> Result<JobRecord> {
        let payload = serde_json::to_value(payload)?;
        let (job, inserted) = self.repo.insert(&NewJob {
            queue: &self.name,
            name: job_name,
            payload: &payload,
            dedup_key: options.dedup_key.as_deref(),
            incremental: options.incremental,
        })?;

        if inserted {
            tracing::debug!(queue = %self.name, job_id = job.id, name = %job_name, "job enqueued");
            self.notify.notify_one();
        } else {
            tracing::info!(
                queue = %self.name,
                job_id = job.id,
                dedup_key = options.dedup_key.as_deref().unwrap_or_default(),
                status = %job.status,
                "duplicate job, returning existing"
            );
        }
        Ok(job)
    }

    /// Look up a job of this queue
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, job_id: i64) -> Result<Option<JobRecord>> {
        Ok(self
            .repo
            .find(job_id)?
            .filter(|job| *job.queue == *self.name))
    }

    /// Newest jobs first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, limit: usize) -> Result<Vec<JobRecord>> {
        self.repo.list(Some(&self.name), limit)
    }

    /// Jobs per status
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn counts(&self) -> Result<JobCounts> {
        self.repo.counts(&self.name)
    }

    /// Resolve jobs a previous process left active
    ///
    /// Idempotent jobs are put back to waiting; incremental jobs are failed
    /// so their physical effect is never repeated.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recover_stalled(&self) -> Result<(usize, usize)> {
        let (requeued, failed) = self.repo.recover_stalled(&self.name)?;
        if requeued + failed > 0 {
            tracing::warn!(queue = %self.name, requeued, failed, "recovered stalled jobs");
            self.notify.notify_one();
        }
        Ok((requeued, failed))
    }

    /// Wait until a job completes or fails, bounded by `timeout`
    ///
    /// Returns the finished record; callers inspect its status.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown job and `Timeout` when the job is
    /// still unfinished at the deadline
    pub async fn wait_for(&self, job_id: i64, timeout: Duration) -> Result<JobRecord> {
        // Subscribe before the status check so no outcome slips in between
        let mut outcomes = self.outcomes.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let job = self
                .get(job_id)?
                .ok_or_else(|| Error::NotFound(format!("job {job_id} in {}", self.name)))?;
            if job.status.is_finished() {
                return Ok(job);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    operation: "job wait",
                    after: timeout,
                });
            }

            // Jobs finished through another handle or process only show in the store
            let recheck = deadline.min(tokio::time::Instant::now() + STATUS_RECHECK);
            loop {
                match tokio::time::timeout_at(recheck, outcomes.recv()).await {
                    Err(_) => break,
                    Ok(Ok(outcome)) if outcome.job_id == job_id => break,
                    Ok(Ok(_)) => {}
                    // Missed events: re-read the row
                    Ok(Err(broadcast::error::RecvError::Lagged(_))) => break,
                    Ok(Err(broadcast::error::RecvError::Closed)) => {
                        return Err(Error::Queue(format!("{} outcome channel closed", self.name)));
                    }
                }
            }
        }
    }

    /// Wait for a job and turn a failure into an error
    ///
    /// # Errors
    ///
    /// Returns `Queue` with the job's error text if it failed, or any error of
    /// [`JobQueue::wait_for`]
    pub async fn wait_until_completed(
        &self,
        job_id: i64,
        timeout: Duration,
    ) -> Result<Option<serde_json::Value>> {
        let job = self.wait_for(job_id, timeout).await?;
        match job.status {
            JobStatus::Completed => Ok(job.result),
            _ => Err(Error::Queue(format!(
                "{} job {job_id} ({}) failed: {}",
                self.name,
                job.name,
                job.error.as_deref().unwrap_or("unknown error")
            ))),
        }
    }

    pub(crate) fn claim(&self) -> Result<Option<JobRecord>> {
        self.repo.claim_next(&self.name)
    }

    pub(crate) fn finish(
        &self,
        job_id: i64,
        outcome: std::result::Result<Option<serde_json::Value>, String>,
    ) -> Result<()> {
        let status = match outcome {
            Ok(result) => {
                self.repo.complete(job_id, result.as_ref())?;
                JobStatus::Completed
            }
            Err(error) => {
                self.repo.fail(job_id, &error)?;
                JobStatus::Failed
            }
        };
        let _ = self.outcomes.send(JobOutcome { job_id, status });
        Ok(())
    }

    pub(crate) async fn notified(&self) {
        self.notify.notified().await;
    }
}
