use std::time::Duration;

use async_trait::async_trait;

use super::{MOTOR_JOB, MotorCommand, MotorJob};
use crate::Result;
use crate::queue::{EnqueueOptions, JobQueue};

/// Runs a movement to completion
#[async_trait]
pub trait MotorDriver: Send + Sync {
    /// Execute `command` and return once the machine finished it
    ///
    /// `step` identifies the movement within an order. Incremental movements
    /// with a step run at most once per step.
    ///
    /// # Errors
    ///
    /// Returns error if the movement failed or did not finish in time
    async fn run(&self, command: MotorCommand, step: Option<&str>) -> Result<()>;
}

/// Driver that submits each movement to the motor queue and waits for it
#[derive(Clone)]
pub struct QueuedMotorDriver {
    queue: JobQueue,
    wait_timeout: Duration,
}

impl QueuedMotorDriver {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(queue: JobQueue, wait_timeout: Duration) -> Self {
        Self {
            queue,
            wait_timeout,
        }
    }
}

#[async_trait]
impl MotorDriver for QueuedMotorDriver {
    async fn run(&self, command: MotorCommand, step: Option<&str>) -> Result<()> {
        let incremental = command.is_incremental();
        let options = EnqueueOptions {
            dedup_key: step.filter(|_| incremental).map(str::to_string),
            incremental,
        };
        let job = self.queue.enqueue_with(
            MOTOR_JOB,
            &MotorJob {
                command,
                step: step.map(str::to_string),
            },
            &options,
        )?;

        tracing::debug!(job_id = job.id, %command, "waiting for movement");
        self.queue
            .wait_until_completed(job.id, self.wait_timeout)
            .await?;
        Ok(())
    }
}
