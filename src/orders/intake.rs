use async_trait::async_trait;
use serde_json::json;

use super::{OrderPayload, PREPARE_JOB};
use crate::Result;
use crate::queue::{EnqueueOptions, JobHandler, JobQueue, JobRecord};

/// Moves accepted orders to the preparation queue
pub struct IntakeWorker {
    prepare: JobQueue,
}

impl IntakeWorker {
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(prepare: JobQueue) -> Self {
        Self { prepare }
    }
}

#[async_trait]
impl JobHandler for IntakeWorker {
    async fn handle(&self, job: &JobRecord) -> Result<Option<serde_json::Value>> {
        let order: OrderPayload = serde_json::from_value(job.payload.clone())?;
        order.validate()?;

        // Keyed by order so a re-run intake job does not prepare twice.
        // An interrupted preparation left material on the scale, so it is
        // failed on recovery instead of dispensing again.
        let prepared = self.prepare.enqueue_with(
            PREPARE_JOB,
            &order,
            &EnqueueOptions {
                dedup_key: Some(order.order_id.clone()),
                incremental: true,
            },
        )?;
        tracing::debug!(order_id = %order.order_id, prepare_job = prepared.id, "order forwarded");

        Ok(Some(json!({ "prepareJobId": prepared.id })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;
    use crate::queue::{INTAKE_QUEUE, PREPARE_QUEUE};

    #[tokio::test]
    async fn forwards_payload_unchanged_once() {
        let pool = init_memory().unwrap();
        let intake = JobQueue::new(INTAKE_QUEUE, pool.clone());
        let prepare = JobQueue::new(PREPARE_QUEUE, pool);
        let worker = IntakeWorker::new(prepare.clone());

        let order = OrderPayload {
            order_id: "order-9".into(),
            product_id: "lentils".into(),
            hopper_id: "hopper-2".into(),
            weight_grams: 120.5,
        };
        let job = intake.enqueue(crate::orders::INTAKE_JOB, &order).unwrap();

        let first = worker.handle(&job).await.unwrap().unwrap();
        let second = worker.handle(&job).await.unwrap().unwrap();
        assert_eq!(first, second);

        let jobs = prepare.list(10).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, PREPARE_JOB);
        assert!(jobs[0].incremental);
        let forwarded: OrderPayload = serde_json::from_value(jobs[0].payload.clone()).unwrap();
        assert_eq!(forwarded, order);
    }
}
