use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobQueueError;
use crate::job::{Job, JobId, JobStatus, Stopwatches};

/// Identifies the lease a conditional update must still hold: the triple `(id, acquired,
/// timeout)` a backend compares against its current row before applying a patch. A mismatch means
/// some other worker's poll already reclaimed and re-leased the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRef {
    pub id: JobId,
    pub acquired: DateTime<Utc>,
    pub timeout: DateTime<Utc>,
}

/// Selects a single job for [`Storage::cancel_job`] by one of its two unique handles.
#[derive(Debug, Clone, Copy)]
pub enum JobSelector<'a> {
    Id(&'a str),
    UniqueId(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLog {
    pub job_type: String,
    pub job_id: JobId,
    pub level: LogLevel,
    pub message: Value,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: JobId,
    pub job_type: String,
    pub message: Value,
    pub created: DateTime<Utc>,
}

/// A partial update to a job's mutable fields.
///
/// Nullable fields use `Option<Option<T>>`: the outer `Option` distinguishes "untouched" from
/// "set" and the inner one carries the new value, including `None` to clear a field (for example
/// clearing `acquired`/`timeout` when a recurring job rearms). `modified` is always present —
/// every patch bumps it.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub modified: DateTime<Utc>,
    pub status: Option<JobStatus>,
    pub worker: Option<Option<String>>,
    pub acquired: Option<Option<DateTime<Utc>>>,
    pub timeout: Option<Option<DateTime<Utc>>>,
    pub scheduled: Option<DateTime<Utc>>,
    pub attempt: Option<u32>,
    pub completed: Option<Option<DateTime<Utc>>>,
    pub stopwatches: Option<Stopwatches>,
}

impl JobPatch {
    pub fn new(modified: DateTime<Utc>) -> Self {
        JobPatch {
            modified,
            ..Default::default()
        }
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn worker(mut self, worker: Option<String>) -> Self {
        self.worker = Some(worker);
        self
    }

    pub fn acquired(mut self, acquired: Option<DateTime<Utc>>) -> Self {
        self.acquired = Some(acquired);
        self
    }

    pub fn timeout(mut self, timeout: Option<DateTime<Utc>>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn scheduled(mut self, scheduled: DateTime<Utc>) -> Self {
        self.scheduled = Some(scheduled);
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn completed(mut self, completed: Option<DateTime<Utc>>) -> Self {
        self.completed = Some(completed);
        self
    }

    pub fn stopwatches(mut self, stopwatches: Stopwatches) -> Self {
        self.stopwatches = Some(stopwatches);
        self
    }

    /// Applies this patch's `Some` fields onto `job` in place. Backends that keep their state as
    /// plain structs (the in-memory reference backend) can use this directly instead of
    /// reimplementing field-by-field assignment; SQL backends translate the same fields into a
    /// `SET` clause instead.
    pub fn apply(&self, job: &mut Job) {
        job.modified = self.modified;
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(worker) = &self.worker {
            job.worker = worker.clone();
        }
        if let Some(acquired) = self.acquired {
            job.acquired = acquired;
        }
        if let Some(timeout) = self.timeout {
            job.timeout = timeout;
        }
        if let Some(scheduled) = self.scheduled {
            job.scheduled = scheduled;
        }
        if let Some(attempt) = self.attempt {
            job.attempt = attempt;
        }
        if let Some(completed) = self.completed {
            job.completed = completed;
        }
        if let Some(stopwatches) = self.stopwatches {
            job.stopwatches = stopwatches;
        }
    }
}

/// The contract every persistence backend implements. The engine in [`crate::queue`] is written
/// entirely against this trait and never assumes anything about the underlying store beyond what
/// it promises here.
///
/// Implementors must uphold three invariants the engine relies on for correctness under
/// concurrent workers:
///
/// - [`Storage::save_job`] is atomic with respect to `unique_id`: two concurrent saves naming the
///   same non-null `unique_id` must not both succeed.
/// - [`Storage::poll_for_runnable_job`] claims at most one job per call, and no two concurrent
///   callers may claim the same job — the classic `FOR UPDATE SKIP LOCKED` guarantee.
/// - [`Storage::update_running_job`] only applies its patch if the stored row's `(id, acquired,
///   timeout)` still matches the given [`LeaseRef`]; otherwise it returns `Ok(None)` rather than
///   erroring, so callers can treat a lost lease as an ordinary (if unfortunate) outcome.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Persists a new job. Returns `Ok(false)` instead of an error when the job's `unique_id`
    /// already has a live, non-terminal job on record — the common "don't double-enqueue" case.
    async fn save_job(&self, job: &Job) -> Result<bool, JobQueueError>;

    async fn find_job_by_id(&self, id: &str) -> Result<Option<Job>, JobQueueError>;

    /// Unconditional read-modify-write, used by the engine itself for transitions that don't
    /// require proof of an active lease (`record_error`, `fail`, `expire`).
    async fn update_job_by_id(&self, id: &str, patch: JobPatch) -> Result<Option<Job>, JobQueueError>;

    /// Cancels a job if it hasn't already resolved. Returns the job as it stood the moment
    /// cancellation was recorded, or `None` if no matching job exists.
    async fn cancel_job(&self, selector: JobSelector<'_>) -> Result<Option<Job>, JobQueueError>;

    /// Atomically finds the single highest-priority, earliest-scheduled, runnable job among
    /// `types` and marks it `Running` with a fresh lease, or returns `Ok(None)` if nothing is
    /// runnable right now.
    async fn poll_for_runnable_job(
        &self,
        types: &[String],
        new_timeout: DateTime<Utc>,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobQueueError>;

    /// Lease-guarded read-modify-write: applies `patch` only if `lease` still matches the current
    /// row, returning `Ok(None)` on mismatch (the caller's lease was lost).
    async fn update_running_job(&self, lease: &LeaseRef, patch: JobPatch) -> Result<Option<Job>, JobQueueError>;

    async fn write_job_log(&self, job_type: &str, job_id: &str, level: LogLevel, message: Value) -> Result<Option<JobLog>, JobQueueError>;

    async fn read_job_log(&self, job_id: &str, skip: u64, limit: u64) -> Result<Vec<JobLog>, JobQueueError>;

    async fn write_job_result(&self, job_type: &str, job_id: &str, message: Value) -> Result<(), JobQueueError>;

    async fn read_job_result(&self, job_id: &str) -> Result<Option<JobResult>, JobQueueError>;

    /// Opens any connection pool or resources the backend needs. The default is a no-op for
    /// backends (like the in-memory reference store) with nothing to open.
    async fn connect(&self) -> Result<(), JobQueueError> {
        Ok(())
    }

    /// Releases connection resources. Called by [`crate::queue::JobQueue::stop`] once every
    /// running job has drained.
    async fn disconnect(&self) -> Result<(), JobQueueError> {
        Ok(())
    }
}
