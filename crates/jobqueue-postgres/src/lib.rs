//! A [`Storage`] backed by Postgres, built around a single atomic claim query instead of
//! optimistic retries.
//!
//! Schema this crate expects (run separately, e.g. via `sqlx migrate` — this crate does not ship
//! or run migrations itself):
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id            TEXT PRIMARY KEY,
//!     job_type      TEXT NOT NULL,
//!     unique_id     TEXT,
//!     message       JSONB NOT NULL,
//!     client        TEXT NOT NULL,
//!     worker        TEXT,
//!     recurring     TEXT,
//!     timezone      TEXT NOT NULL,
//!     status        TEXT NOT NULL CHECK (status IN
//!                       ('waiting','running','error','failed','completed','expired','canceled')),
//!     retries       INTEGER NOT NULL,
//!     attempt       INTEGER NOT NULL,
//!     priority      INTEGER NOT NULL,
//!     scheduled     TIMESTAMPTZ NOT NULL,
//!     acquired      TIMESTAMPTZ,
//!     timeout       TIMESTAMPTZ,
//!     expire        TIMESTAMPTZ,
//!     completed     TIMESTAMPTZ,
//!     created       TIMESTAMPTZ NOT NULL,
//!     modified      TIMESTAMPTZ NOT NULL,
//!     waiting_ms    BIGINT,
//!     running_ms    BIGINT,
//!     completed_ms  BIGINT
//! );
//!
//! CREATE UNIQUE INDEX idx_jobs_unique_live ON jobs (unique_id)
//!     WHERE unique_id IS NOT NULL AND status NOT IN ('completed','expired','canceled');
//! CREATE INDEX idx_jobs_ready ON jobs (priority, scheduled) WHERE status = 'waiting';
//! CREATE INDEX idx_jobs_lease ON jobs (timeout) WHERE status = 'running';
//!
//! CREATE TABLE job_logs (
//!     job_type TEXT NOT NULL,
//!     job_id   TEXT NOT NULL REFERENCES jobs (id),
//!     level    TEXT NOT NULL,
//!     message  JSONB NOT NULL,
//!     created  TIMESTAMPTZ NOT NULL
//! );
//! CREATE INDEX idx_job_logs_job_id ON job_logs (job_id, created);
//!
//! CREATE TABLE job_results (
//!     job_id   TEXT PRIMARY KEY REFERENCES jobs (id),
//!     job_type TEXT NOT NULL,
//!     message  JSONB NOT NULL,
//!     created  TIMESTAMPTZ NOT NULL
//! );
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobqueue_core::{Job, JobLog, JobPatch, JobQueueError, JobResult, JobSelector, JobStatus, LeaseRef, LogLevel, Storage, Stopwatches};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};

fn map_err(err: sqlx::Error) -> JobQueueError {
    JobQueueError::storage(err)
}

#[derive(Debug, thiserror::Error)]
enum RowDecodeError {
    #[error("row has an unrecognized job status: {0}")]
    UnknownStatus(String),
}

fn log_level_str(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Error => "error",
        LogLevel::Warn => "warn",
        LogLevel::Info => "info",
        LogLevel::Debug => "debug",
    }
}

fn parse_log_level(s: &str) -> LogLevel {
    match s {
        "error" => LogLevel::Error,
        "warn" => LogLevel::Warn,
        "debug" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

fn row_to_job(row: &PgRow) -> Result<Job, JobQueueError> {
    let status_str: String = row.try_get("status").map_err(map_err)?;
    let status: JobStatus = status_str
        .parse()
        .map_err(|_| JobQueueError::storage(RowDecodeError::UnknownStatus(status_str.clone())))?;
    Ok(Job {
        id: row.try_get("id").map_err(map_err)?,
        job_type: row.try_get("job_type").map_err(map_err)?,
        unique_id: row.try_get("unique_id").map_err(map_err)?,
        message: row.try_get("message").map_err(map_err)?,
        client: row.try_get("client").map_err(map_err)?,
        worker: row.try_get("worker").map_err(map_err)?,
        recurring: row.try_get("recurring").map_err(map_err)?,
        timezone: row.try_get("timezone").map_err(map_err)?,
        status,
        retries: row.try_get::<i32, _>("retries").map_err(map_err)? as u32,
        attempt: row.try_get::<i32, _>("attempt").map_err(map_err)? as u32,
        priority: row.try_get("priority").map_err(map_err)?,
        scheduled: row.try_get("scheduled").map_err(map_err)?,
        acquired: row.try_get("acquired").map_err(map_err)?,
        timeout: row.try_get("timeout").map_err(map_err)?,
        expire: row.try_get("expire").map_err(map_err)?,
        completed: row.try_get("completed").map_err(map_err)?,
        created: row.try_get("created").map_err(map_err)?,
        modified: row.try_get("modified").map_err(map_err)?,
        stopwatches: Stopwatches {
            waiting_ms: row.try_get("waiting_ms").map_err(map_err)?,
            running_ms: row.try_get("running_ms").map_err(map_err)?,
            completed_ms: row.try_get("completed_ms").map_err(map_err)?,
        },
    })
}

fn row_to_log(row: &PgRow) -> Result<JobLog, JobQueueError> {
    let level_str: String = row.try_get("level").map_err(map_err)?;
    Ok(JobLog {
        job_type: row.try_get("job_type").map_err(map_err)?,
        job_id: row.try_get("job_id").map_err(map_err)?,
        level: parse_log_level(&level_str),
        message: row.try_get("message").map_err(map_err)?,
        created: row.try_get("created").map_err(map_err)?,
    })
}

fn row_to_result(row: &PgRow) -> Result<JobResult, JobQueueError> {
    Ok(JobResult {
        job_id: row.try_get("job_id").map_err(map_err)?,
        job_type: row.try_get("job_type").map_err(map_err)?,
        message: row.try_get("message").map_err(map_err)?,
        created: row.try_get("created").map_err(map_err)?,
    })
}

fn push_patch(qb: &mut QueryBuilder<'_, sqlx::Postgres>, patch: &JobPatch) {
    qb.push("modified = ");
    qb.push_bind(patch.modified);
    if let Some(status) = patch.status {
        qb.push(", status = ");
        qb.push_bind(status.to_string());
    }
    if let Some(worker) = &patch.worker {
        qb.push(", worker = ");
        qb.push_bind(worker.clone());
    }
    if let Some(acquired) = patch.acquired {
        qb.push(", acquired = ");
        qb.push_bind(acquired);
    }
    if let Some(timeout) = patch.timeout {
        qb.push(", timeout = ");
        qb.push_bind(timeout);
    }
    if let Some(scheduled) = patch.scheduled {
        qb.push(", scheduled = ");
        qb.push_bind(scheduled);
    }
    if let Some(attempt) = patch.attempt {
        qb.push(", attempt = ");
        qb.push_bind(attempt as i32);
    }
    if let Some(completed) = patch.completed {
        qb.push(", completed = ");
        qb.push_bind(completed);
    }
    if let Some(stopwatches) = patch.stopwatches {
        qb.push(", waiting_ms = ");
        qb.push_bind(stopwatches.waiting_ms);
        qb.push(", running_ms = ");
        qb.push_bind(stopwatches.running_ms);
        qb.push(", completed_ms = ");
        qb.push_bind(stopwatches.completed_ms);
    }
}

/// Aggregate counts by status, used for dashboards and health checks rather than anything the
/// engine itself consumes.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub waiting: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub expired: i64,
    pub canceled: i64,
}

/// A [`Storage`] implementation over a Postgres connection pool.
#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        PgStorage { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, JobQueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(map_err)?;
        Ok(PgStorage { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Summarizes the table by status. Not part of the [`Storage`] contract — it's an operational
    /// helper, not something the engine's run loop needs.
    pub async fn stats(&self) -> Result<QueueStats, JobQueueError> {
        let row = sqlx::query(
            "SELECT \
                count(*) FILTER (WHERE status = 'waiting')   AS waiting, \
                count(*) FILTER (WHERE status = 'running')   AS running, \
                count(*) FILTER (WHERE status = 'completed') AS completed, \
                count(*) FILTER (WHERE status = 'failed')    AS failed, \
                count(*) FILTER (WHERE status = 'expired')   AS expired, \
                count(*) FILTER (WHERE status = 'canceled')  AS canceled \
             FROM jobs",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(QueueStats {
            waiting: row.try_get("waiting").map_err(map_err)?,
            running: row.try_get("running").map_err(map_err)?,
            completed: row.try_get("completed").map_err(map_err)?,
            failed: row.try_get("failed").map_err(map_err)?,
            expired: row.try_get("expired").map_err(map_err)?,
            canceled: row.try_get("canceled").map_err(map_err)?,
        })
    }

    /// Requeues jobs left `running` with an elapsed lease — the backstop for a worker that died
    /// without a lease supervisor of its own to cancel and report them. Intended to run on an
    /// interval from a maintenance task, independent of any one [`jobqueue_core::JobQueue`]'s own
    /// in-process supervisor, which only sees jobs it personally claimed.
    pub async fn reclaim_expired(&self) -> Result<u64, JobQueueError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'waiting', acquired = NULL, timeout = NULL, worker = NULL, modified = NOW() \
             WHERE status = 'running' AND timeout < NOW()",
        )
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            tracing::warn!(reclaimed, "requeued jobs whose lease expired without a local supervisor noticing");
        }
        Ok(reclaimed)
    }

    /// The 24h-TTL maintenance sweep: deletes `jobs` rows that reached a terminal resting state
    /// (`completed` or `expired`) before `older_than`, plus `job_logs`/`job_results` rows whose own
    /// `created` predates it. Nothing in the poll path or the engine calls this; it's meant to run
    /// on an interval from an external maintenance task, same as [`PgStorage::reclaim_expired`].
    pub async fn purge_expired(&self, older_than: Duration) -> Result<u64, JobQueueError> {
        let cutoff = Utc::now() - older_than;
        let jobs = sqlx::query("DELETE FROM jobs WHERE status IN ('completed', 'expired') AND completed < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(map_err)?;
        let logs = sqlx::query("DELETE FROM job_logs WHERE created < $1").bind(cutoff).execute(&self.pool).await.map_err(map_err)?;
        let results = sqlx::query("DELETE FROM job_results WHERE created < $1").bind(cutoff).execute(&self.pool).await.map_err(map_err)?;
        Ok(jobs.rows_affected() + logs.rows_affected() + results.rows_affected())
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn save_job(&self, job: &Job) -> Result<bool, JobQueueError> {
        let result = sqlx::query(
            "INSERT INTO jobs (id, job_type, unique_id, message, client, worker, recurring, timezone, status, \
                                retries, attempt, priority, scheduled, acquired, timeout, expire, completed, created, modified) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19) \
             ON CONFLICT (unique_id) WHERE unique_id IS NOT NULL AND status NOT IN ('completed','expired','canceled') \
             DO NOTHING",
        )
        .bind(&job.id)
        .bind(&job.job_type)
        .bind(&job.unique_id)
        .bind(&job.message)
        .bind(&job.client)
        .bind(&job.worker)
        .bind(&job.recurring)
        .bind(&job.timezone)
        .bind(job.status.to_string())
        .bind(job.retries as i32)
        .bind(job.attempt as i32)
        .bind(job.priority)
        .bind(job.scheduled)
        .bind(job.acquired)
        .bind(job.timeout)
        .bind(job.expire)
        .bind(job.completed)
        .bind(job.created)
        .bind(job.modified)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_job_by_id(&self, id: &str) -> Result<Option<Job>, JobQueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = $1").bind(id).fetch_optional(&self.pool).await.map_err(map_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn update_job_by_id(&self, id: &str, patch: JobPatch) -> Result<Option<Job>, JobQueueError> {
        let mut qb = QueryBuilder::new("UPDATE jobs SET ");
        push_patch(&mut qb, &patch);
        qb.push(" WHERE id = ");
        qb.push_bind(id.to_string());
        qb.push(" RETURNING *");
        let row = qb.build().fetch_optional(&self.pool).await.map_err(map_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn cancel_job(&self, selector: JobSelector<'_>) -> Result<Option<Job>, JobQueueError> {
        let now = Utc::now();
        let (column, value) = match selector {
            JobSelector::Id(id) => ("id", id.to_string()),
            JobSelector::UniqueId(unique_id) => ("unique_id", unique_id.to_string()),
        };
        let sql = format!(
            "UPDATE jobs SET status = 'canceled', modified = $1 \
             WHERE {column} = $2 AND status NOT IN ('completed','expired','canceled') RETURNING *"
        );
        let row = sqlx::query(&sql).bind(now).bind(value).fetch_optional(&self.pool).await.map_err(map_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn poll_for_runnable_job(
        &self,
        types: &[String],
        new_timeout: DateTime<Utc>,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobQueueError> {
        let row = sqlx::query(
            "WITH candidate AS ( \
                SELECT id FROM jobs \
                WHERE job_type = ANY($2) AND scheduled <= $1 AND ( \
                    status = 'waiting' \
                    OR (status = 'running' AND timeout <= $1) \
                    OR status = 'error' \
                    OR (status = 'failed' AND recurring IS NOT NULL) \
                ) \
                ORDER BY priority ASC, created ASC \
                LIMIT 1 \
                FOR UPDATE SKIP LOCKED \
             ) \
             UPDATE jobs \
             SET status = 'running', worker = $3, acquired = $1, timeout = $4, attempt = attempt + 1, modified = $1 \
             FROM candidate \
             WHERE jobs.id = candidate.id \
             RETURNING jobs.*",
        )
        .bind(now)
        .bind(types)
        .bind(worker)
        .bind(new_timeout)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn update_running_job(&self, lease: &LeaseRef, patch: JobPatch) -> Result<Option<Job>, JobQueueError> {
        let mut qb = QueryBuilder::new("UPDATE jobs SET ");
        push_patch(&mut qb, &patch);
        qb.push(" WHERE id = ");
        qb.push_bind(lease.id.clone());
        qb.push(" AND acquired = ");
        qb.push_bind(lease.acquired);
        qb.push(" AND timeout = ");
        qb.push_bind(lease.timeout);
        qb.push(" RETURNING *");
        let row = qb.build().fetch_optional(&self.pool).await.map_err(map_err)?;
        row.as_ref().map(row_to_job).transpose()
    }

    async fn write_job_log(&self, job_type: &str, job_id: &str, level: LogLevel, message: Value) -> Result<Option<JobLog>, JobQueueError> {
        let now = Utc::now();
        let row = sqlx::query(
            "INSERT INTO job_logs (job_type, job_id, level, message, created) VALUES ($1,$2,$3,$4,$5) \
             RETURNING job_type, job_id, level, message, created",
        )
        .bind(job_type)
        .bind(job_id)
        .bind(log_level_str(level))
        .bind(message)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(Some(row_to_log(&row)?))
    }

    async fn read_job_log(&self, job_id: &str, skip: u64, limit: u64) -> Result<Vec<JobLog>, JobQueueError> {
        let rows = sqlx::query("SELECT job_type, job_id, level, message, created FROM job_logs WHERE job_id = $1 ORDER BY created ASC OFFSET $2 LIMIT $3")
            .bind(job_id)
            .bind(skip as i64)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(map_err)?;
        rows.iter().map(row_to_log).collect()
    }

    async fn write_job_result(&self, job_type: &str, job_id: &str, message: Value) -> Result<(), JobQueueError> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO job_results (job_id, job_type, message, created) VALUES ($1,$2,$3,$4) \
             ON CONFLICT (job_id) DO UPDATE SET job_type = EXCLUDED.job_type, message = EXCLUDED.message, created = EXCLUDED.created",
        )
        .bind(job_id)
        .bind(job_type)
        .bind(message)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_err)?;
        Ok(())
    }

    async fn read_job_result(&self, job_id: &str) -> Result<Option<JobResult>, JobQueueError> {
        let row = sqlx::query("SELECT job_id, job_type, message, created FROM job_results WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_err)?;
        row.as_ref().map(row_to_result).transpose()
    }

    async fn disconnect(&self) -> Result<(), JobQueueError> {
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_round_trips_through_its_string_form() {
        for level in [LogLevel::Error, LogLevel::Warn, LogLevel::Info, LogLevel::Debug] {
            assert_eq!(parse_log_level(log_level_str(level)), level);
        }
    }

    #[test]
    fn unknown_level_string_falls_back_to_info() {
        assert_eq!(parse_log_level("nonsense"), LogLevel::Info);
    }
}
