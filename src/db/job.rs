//! Job repository backing the durable queues
//!
//! Rows are retained after completion or failure so that the pipeline can be
//! inspected. Claiming is a single `UPDATE ... RETURNING` statement, so two
//! workers never receive the same job.

use std::fmt;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, TransactionBehavior, params};
use serde::Serialize;

use super::{DbPool, connection, parse_datetime, timestamp};
use crate::Result;

const COLUMNS: &str = "id, queue, name, payload, status, attempts, result, error, dedup_key, \
                       incremental, created_at, started_at, finished_at";

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Completed or failed
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Waiting,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored job
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: i64,
    pub queue: String,
    pub name: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts: u32,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub dedup_key: Option<String>,
    /// Re-running this job would repeat a physical effect
    pub incremental: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Job to insert
#[derive(Debug, Clone)]
pub struct NewJob<'a> {
    pub queue: &'a str,
    pub name: &'a str,
    pub payload: &'a serde_json::Value,
    pub dedup_key: Option<&'a str>,
    pub incremental: bool,
}

/// Per-status job counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Job repository
#[derive(Clone)]
pub struct JobRepo {
    pool: DbPool,
}

impl JobRepo {
    /// Create a new job repository
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Insert a job
    ///
    /// When a dedup key is given and a job with that key exists in the same
    /// queue and has not failed, the existing job is returned with `false`.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn insert(&self, job: &NewJob<'_>) -> Result<(JobRecord, bool)> {
        let mut conn = connection(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(key) = job.dedup_key {
            let existing = tx
                .query_row(
                    &format!(
                        "SELECT {COLUMNS} FROM jobs WHERE queue = ?1 AND dedup_key = ?2 \
                         AND status != 'failed' ORDER BY id DESC LIMIT 1"
                    ),
                    [job.queue, key],
                    row_to_job,
                )
                .optional()?;
            if let Some(existing) = existing {
                return Ok((existing, false));
            }
        }

        let now = Utc::now();
        tx.execute(
            "INSERT INTO jobs (queue, name, payload, dedup_key, incremental, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.queue,
                job.name,
                job.payload.to_string(),
                job.dedup_key,
                job.incremental,
                timestamp(&now)
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok((
            JobRecord {
                id,
                queue: job.queue.to_string(),
                name: job.name.to_string(),
                payload: job.payload.clone(),
                status: JobStatus::Waiting,
                attempts: 0,
                result: None,
                error: None,
                dedup_key: job.dedup_key.map(String::from),
                incremental: job.incremental,
                created_at: now,
                started_at: None,
                finished_at: None,
            },
            true,
        ))
    }

    /// Atomically move the oldest waiting job of a queue to active
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn claim_next(&self, queue: &str) -> Result<Option<JobRecord>> {
        let conn = connection(&self.pool)?;
        let job = conn
            .query_row(
                &format!(
                    "UPDATE jobs SET status = 'active', attempts = attempts + 1, started_at = ?2 \
                     WHERE id = (SELECT id FROM jobs WHERE queue = ?1 AND status = 'waiting' \
                     ORDER BY id LIMIT 1) RETURNING {COLUMNS}"
                ),
                params![queue, timestamp(&Utc::now())],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Mark an active job completed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn complete(&self, id: i64, result: Option<&serde_json::Value>) -> Result<()> {
        let conn = connection(&self.pool)?;
        conn.execute(
            "UPDATE jobs SET status = 'completed', result = ?2, error = NULL, finished_at = ?3 \
             WHERE id = ?1",
            params![
                id,
                result.map(ToString::to_string),
                timestamp(&Utc::now())
            ],
        )?;
        Ok(())
    }

    /// Mark a job failed, keeping the error text
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn fail(&self, id: i64, error: &str) -> Result<()> {
        let conn = connection(&self.pool)?;
        conn.execute(
            "UPDATE jobs SET status = 'failed', error = ?2, finished_at = ?3 WHERE id = ?1",
            params![id, error, timestamp(&Utc::now())],
        )?;
        Ok(())
    }

    /// Find a job by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn find(&self, id: i64) -> Result<Option<JobRecord>> {
        let conn = connection(&self.pool)?;
        let job = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM jobs WHERE id = ?1"),
                [id],
                row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    /// Newest jobs first, optionally restricted to one queue
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self, queue: Option<&str>, limit: usize) -> Result<Vec<JobRecord>> {
        let conn = connection(&self.pool)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let jobs = if let Some(queue) = queue {
            let mut stmt = conn.prepare(&format!(
                "SELECT {COLUMNS} FROM jobs WHERE queue = ?1 ORDER BY id DESC LIMIT ?2"
            ))?;
            stmt.query_map(params![queue, limit], row_to_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt =
                conn.prepare(&format!("SELECT {COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"))?;
            stmt.query_map([limit], row_to_job)?
                .collect::<std::result::Result<Vec<_>, _>>()?
        };

        Ok(jobs)
    }

    /// Count jobs per status in a queue
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn counts(&self, queue: &str) -> Result<JobCounts> {
        let conn = connection(&self.pool)?;
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status")?;
        let rows = stmt.query_map([queue], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = JobCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = u64::try_from(n).unwrap_or(0);
            match JobStatus::parse(&status) {
                JobStatus::Waiting => counts.waiting = n,
                JobStatus::Active => counts.active = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    /// Resolve jobs left active by a previous process
    ///
    /// Idempotent jobs return to waiting; incremental ones are failed.
    /// Returns `(requeued, failed)`.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn recover_stalled(&self, queue: &str) -> Result<(usize, usize)> {
        let mut conn = connection(&self.pool)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let failed = tx.execute(
            "UPDATE jobs SET status = 'failed', finished_at = ?2, \
             error = 'interrupted while active; incremental job not re-run' \
             WHERE queue = ?1 AND status = 'active' AND incremental = 1",
            params![queue, timestamp(&Utc::now())],
        )?;
        let requeued = tx.execute(
            "UPDATE jobs SET status = 'waiting', started_at = NULL \
             WHERE queue = ?1 AND status = 'active' AND incremental = 0",
            [queue],
        )?;
        tx.commit()?;

        Ok((requeued, failed))
    }
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let payload: String = row.get(3)?;
    let result: Option<String> = row.get(6)?;
    let started_at: Option<String> = row.get(11)?;
    let finished_at: Option<String> = row.get(12)?;

    Ok(JobRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        status: JobStatus::parse(&row.get::<_, String>(4)?),
        attempts: row.get(5)?,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get(7)?,
        dedup_key: row.get(8)?,
        incremental: row.get(9)?,
        created_at: parse_datetime(&row.get::<_, String>(10)?),
        started_at: started_at.as_deref().map(parse_datetime),
        finished_at: finished_at.as_deref().map(parse_datetime),
    })
}
