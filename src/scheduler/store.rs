//! Durable job queue on the shared SQLite store
//!
//! Run bookkeeping (`complete_run`, `schedule_retry`, `fail_permanently`)
//! only touches jobs still in `running`, so an operator cancellation that
//! lands mid-run is never overwritten by the run's outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, Transaction};

use super::error::SchedulerError;
use super::job::{Job, JobPriority, JobStatus};
use crate::error::Result;
use crate::storage::{format_ts, parse_ts, Database};

/// SQLite-backed job queue
pub struct JobQueue {
    db: Arc<Database>,
}

impl JobQueue {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new job; names are unique
    pub fn add(&self, job: &Job) -> Result<()> {
        let config = serde_json::to_string(&job.config).map_err(SchedulerError::from)?;
        let retry = serde_json::to_string(&job.retry).map_err(SchedulerError::from)?;
        let metadata = serde_json::to_string(&job.metadata).map_err(SchedulerError::from)?;

        let inserted = self.db.with_conn(|conn| {
            let res = conn.execute(
                r#"
                INSERT INTO jobs (
                    id, name, job_type, priority, schedule_expression, config,
                    retry_policy, created_at, next_run_at, last_run_at, status,
                    retry_count, last_error, metadata
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                "#,
                params![
                    job.id,
                    job.name,
                    job.job_type,
                    job.priority.level(),
                    job.schedule_expression,
                    config,
                    retry,
                    format_ts(&job.created_at),
                    format_ts(&job.next_run_at),
                    job.last_run_at.as_ref().map(format_ts),
                    job.status.as_str(),
                    job.retry_count,
                    job.last_error,
                    metadata,
                ],
            );
            match res {
                Ok(n) => Ok(n),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Ok(0)
                }
                Err(e) => Err(e.into()),
            }
        })?;

        if inserted == 0 {
            return Err(SchedulerError::DuplicateJob {
                name: job.name.clone(),
            }
            .into());
        }

        tracing::info!(job_id = %job.id, name = %job.name, job_type = %job.job_type, "Job created");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                    params![id],
                    RawJob::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawJob::decode).transpose()
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<Job>> {
        let raw = self.db.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE name = ?1"),
                    params![name],
                    RawJob::from_row,
                )
                .optional()?)
        })?;
        raw.map(RawJob::decode).transpose()
    }

    /// All jobs, optionally of one status, in run order
    pub fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let raw = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs \
                 WHERE (?1 IS NULL OR status = ?1) \
                 ORDER BY priority DESC, next_run_at ASC, id ASC"
            ))?;
            let rows = stmt
                .query_map(params![status.map(|s| s.as_str())], RawJob::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })?;
        decode_all(raw)
    }

    /// Jobs due at `now`, without claiming them
    pub fn ready_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let raw = self
            .db
            .with_conn(|conn| select_ready(conn, now, i64::MAX))?;
        decode_all(raw)
    }

    /// Atomically move up to `limit` due jobs to `running`
    pub fn claim_ready(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let started = format_ts(&now);

        let raw = self.db.with_transaction(|tx| {
            let mut rows = select_ready(tx, now, limit)?;
            let mut claim = tx.prepare(
                "UPDATE jobs SET status = 'running', last_run_at = ?1 \
                 WHERE id = ?2 AND status IN ('pending', 'retrying')",
            )?;
            for row in &mut rows {
                if claim.execute(params![started, row.id])? == 1 {
                    row.status = JobStatus::Running.as_str().to_string();
                    row.last_run_at = Some(started.clone());
                }
            }
            Ok(rows)
        })?;

        let jobs = decode_all(raw)?;
        if !jobs.is_empty() {
            tracing::debug!(claimed = jobs.len(), "Claimed ready jobs");
        }
        Ok(jobs)
    }

    /// Successful run: back to `pending` at `next_run_at`, retries reset
    ///
    /// Returns `false` when the job left `running` during the run.
    pub fn complete_run(&self, id: &str, next_run_at: DateTime<Utc>) -> Result<bool> {
        self.finish_running(
            id,
            "UPDATE jobs SET status = 'pending', next_run_at = ?2, retry_count = 0, \
             last_error = NULL WHERE id = ?1 AND status = 'running'",
            params![id, format_ts(&next_run_at)],
        )
    }

    /// Retryable failure: `retrying` until `next_run_at`
    pub fn schedule_retry(
        &self,
        id: &str,
        next_run_at: DateTime<Utc>,
        retry_count: u32,
        error: &str,
    ) -> Result<bool> {
        self.finish_running(
            id,
            "UPDATE jobs SET status = 'retrying', next_run_at = ?2, retry_count = ?3, \
             last_error = ?4 WHERE id = ?1 AND status = 'running'",
            params![id, format_ts(&next_run_at), retry_count, error],
        )
    }

    /// Permanent failure: terminal `failed`
    pub fn fail_permanently(&self, id: &str, retry_count: u32, error: &str) -> Result<bool> {
        self.finish_running(
            id,
            "UPDATE jobs SET status = 'failed', retry_count = ?2, last_error = ?3 \
             WHERE id = ?1 AND status = 'running'",
            params![id, retry_count, error],
        )
    }

    fn finish_running(&self, id: &str, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<bool> {
        let changed = self.db.with_conn(|conn| Ok(conn.execute(sql, params)?))?;
        if changed == 0 {
            tracing::info!(job_id = id, "Job left running during execution, outcome dropped");
        }
        Ok(changed == 1)
    }

    /// Operator cancellation from any non-terminal state
    ///
    /// A running handler is not interrupted; its outcome is discarded.
    pub fn cancel(&self, id: &str) -> Result<Job> {
        self.transition(
            id,
            &[JobStatus::Pending, JobStatus::Running, JobStatus::Retrying],
            "cancel",
            |tx| {
                tx.execute(
                    "UPDATE jobs SET status = 'cancelled' WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            },
        )
    }

    /// Operator requeue of a failed or cancelled job, due at `now`
    pub fn requeue(&self, id: &str, now: DateTime<Utc>) -> Result<Job> {
        self.transition(
            id,
            &[JobStatus::Failed, JobStatus::Cancelled],
            "requeue",
            |tx| {
                tx.execute(
                    "UPDATE jobs SET status = 'pending', retry_count = 0, last_error = NULL, \
                     next_run_at = ?2 WHERE id = ?1",
                    params![id, format_ts(&now)],
                )?;
                Ok(())
            },
        )
    }

    fn transition(
        &self,
        id: &str,
        allowed: &[JobStatus],
        operation: &str,
        apply: impl FnOnce(&Transaction<'_>) -> Result<()>,
    ) -> Result<Job> {
        self.db.with_transaction(|tx| {
            let status: Option<String> = tx
                .query_row("SELECT status FROM jobs WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            let status = status.ok_or_else(|| SchedulerError::job_not_found(id))?;
            let current: JobStatus = status.parse()?;
            if !allowed.contains(&current) {
                return Err(SchedulerError::invalid_state(id, current.as_str(), operation).into());
            }
            apply(tx)
        })?;

        tracing::info!(job_id = id, operation, "Job updated by operator");
        self.get(id)?
            .ok_or_else(|| SchedulerError::job_not_found(id).into())
    }
}

fn select_ready(conn: &rusqlite::Connection, now: DateTime<Utc>, limit: i64) -> Result<Vec<RawJob>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {JOB_COLUMNS} FROM jobs \
         WHERE next_run_at <= ?1 AND status IN ('pending', 'retrying') \
         ORDER BY priority DESC, next_run_at ASC, id ASC LIMIT ?2"
    ))?;
    let rows = stmt
        .query_map(params![format_ts(&now), limit], RawJob::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn decode_all(raw: Vec<RawJob>) -> Result<Vec<Job>> {
    raw.into_iter().map(RawJob::decode).collect()
}

const JOB_COLUMNS: &str = "id, name, job_type, priority, schedule_expression, config, \
     retry_policy, created_at, next_run_at, last_run_at, status, retry_count, last_error, metadata";

/// Job row before its JSON and timestamp columns are decoded
struct RawJob {
    id: String,
    name: String,
    job_type: String,
    priority: i64,
    schedule_expression: String,
    config: String,
    retry_policy: String,
    created_at: String,
    next_run_at: String,
    last_run_at: Option<String>,
    status: String,
    retry_count: u32,
    last_error: Option<String>,
    metadata: String,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            job_type: row.get(2)?,
            priority: row.get(3)?,
            schedule_expression: row.get(4)?,
            config: row.get(5)?,
            retry_policy: row.get(6)?,
            created_at: row.get(7)?,
            next_run_at: row.get(8)?,
            last_run_at: row.get(9)?,
            status: row.get(10)?,
            retry_count: row.get(11)?,
            last_error: row.get(12)?,
            metadata: row.get(13)?,
        })
    }

    fn decode(self) -> Result<Job> {
        Ok(Job {
            priority: JobPriority::from_level(self.priority),
            config: serde_json::from_str(&self.config).map_err(SchedulerError::from)?,
            retry: serde_json::from_str(&self.retry_policy).map_err(SchedulerError::from)?,
            created_at: parse_ts(&self.created_at)?,
            next_run_at: parse_ts(&self.next_run_at)?,
            last_run_at: self.last_run_at.as_deref().map(parse_ts).transpose()?,
            status: self.status.parse()?,
            metadata: serde_json::from_str(&self.metadata).map_err(SchedulerError::from)?,
            id: self.id,
            name: self.name,
            job_type: self.job_type,
            schedule_expression: self.schedule_expression,
            retry_count: self.retry_count,
            last_error: self.last_error,
        })
    }
}
