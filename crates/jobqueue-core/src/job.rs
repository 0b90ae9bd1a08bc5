use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::{next_occurrence, Clock};
use crate::error::JobQueueError;
use crate::storage::{JobPatch, LeaseRef, LogLevel, Storage};

pub type JobId = String;

/// The job lifecycle's terminal and non-terminal states.
///
/// `Failed` is only a permanent end state for non-recurring jobs: a recurring job that fails
/// is rearmed back to `Waiting` for its next occurrence, same as a recurring job that completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Waiting,
    Running,
    Error,
    Failed,
    Completed,
    Expired,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Expired | JobStatus::Canceled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Running => "running",
            JobStatus::Error => "error",
            JobStatus::Failed => "failed",
            JobStatus::Completed => "completed",
            JobStatus::Expired => "expired",
            JobStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "error" => Ok(JobStatus::Error),
            "failed" => Ok(JobStatus::Failed),
            "completed" => Ok(JobStatus::Completed),
            "expired" => Ok(JobStatus::Expired),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status `{other}`")),
        }
    }
}

/// Named durations recorded once a job reaches a resting state, in milliseconds.
///
/// `waiting` is how long the job sat scheduled before being claimed, `running` is how long the
/// claim held the job, `completed` is wall time from `scheduled` through now — the three together
/// account for the gap between "I asked for this" and "it's done".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stopwatches {
    pub waiting_ms: Option<i64>,
    pub running_ms: Option<i64>,
    pub completed_ms: Option<i64>,
}

impl Stopwatches {
    pub fn compute(scheduled: DateTime<Utc>, acquired: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        Stopwatches {
            waiting_ms: acquired.map(|a| (a - scheduled).num_milliseconds()),
            running_ms: acquired.map(|a| (now - a).num_milliseconds()),
            completed_ms: Some((now - scheduled).num_milliseconds()),
        }
    }
}

/// A point-in-time record; everything a handler, the engine, or a caller inspecting queue state
/// needs to know about one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub unique_id: Option<String>,
    pub message: Value,
    pub client: String,
    pub worker: Option<String>,
    pub recurring: Option<String>,
    pub timezone: String,
    pub status: JobStatus,
    pub retries: u32,
    pub attempt: u32,
    pub priority: i32,
    pub scheduled: DateTime<Utc>,
    pub acquired: Option<DateTime<Utc>>,
    pub timeout: Option<DateTime<Utc>>,
    pub expire: Option<DateTime<Utc>>,
    pub completed: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub stopwatches: Stopwatches,
}

/// Caller-supplied overrides for [`Job::new`]; anything left `None` falls back to the engine's
/// defaults. [`JobOptions::merge`] lets a [`crate::queue::JobProxy`] layer per-call overrides on
/// top of its own fixed defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub unique_id: Option<String>,
    pub recurring: Option<String>,
    pub timezone: Option<String>,
    pub retries: Option<u32>,
    pub priority: Option<i32>,
    pub scheduled: Option<DateTime<Utc>>,
    pub delay: Option<Duration>,
    pub expire: Option<DateTime<Utc>>,
}

impl JobOptions {
    /// Layers `override_opts` on top of `self`, preferring the override wherever it sets a field.
    pub fn merge(self, override_opts: JobOptions) -> JobOptions {
        JobOptions {
            unique_id: override_opts.unique_id.or(self.unique_id),
            recurring: override_opts.recurring.or(self.recurring),
            timezone: override_opts.timezone.or(self.timezone),
            retries: override_opts.retries.or(self.retries),
            priority: override_opts.priority.or(self.priority),
            scheduled: override_opts.scheduled.or(self.scheduled),
            delay: override_opts.delay.or(self.delay),
            expire: override_opts.expire.or(self.expire),
        }
    }
}

const DEFAULT_RETRIES: u32 = 2;

impl Job {
    /// Constructs a new, unsaved job in `Waiting` status. `now` is the only clock input — callers
    /// go through [`crate::queue::JobQueue`] or [`crate::queue::JobProxy`], which thread the
    /// engine's [`Clock`] through so this stays pure and easy to test.
    pub fn new(job_type: impl Into<String>, message: Value, client: impl Into<String>, opts: JobOptions, now: DateTime<Utc>) -> Self {
        let timezone = opts.timezone.clone().unwrap_or_else(|| "UTC".to_string());

        let mut scheduled = now;
        if let Some(explicit) = opts.scheduled {
            scheduled = explicit;
        } else if let Some(cron_expr) = &opts.recurring {
            if let Some(next) = next_occurrence(cron_expr, &timezone, now) {
                scheduled = next;
            }
        }
        if let Some(delay) = opts.delay {
            if delay > Duration::zero() {
                scheduled = scheduled.max(now + delay);
            }
        }

        Job {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            unique_id: opts.unique_id,
            message,
            client: client.into(),
            worker: None,
            recurring: opts.recurring,
            timezone,
            status: JobStatus::Waiting,
            retries: opts.retries.unwrap_or(DEFAULT_RETRIES),
            attempt: 0,
            priority: opts.priority.unwrap_or(0),
            scheduled,
            acquired: None,
            timeout: None,
            expire: opts.expire,
            completed: None,
            created: now,
            modified: now,
            stopwatches: Stopwatches::default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Expired | JobStatus::Canceled)
    }

    pub fn has_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout.is_some_and(|t| t <= now)
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire.is_some_and(|e| e <= now)
    }

    pub fn has_error(&self) -> bool {
        matches!(self.status, JobStatus::Error)
    }

    pub fn is_recurring(&self) -> bool {
        self.recurring.is_some()
    }

    /// A job may still be attempted as long as it hasn't used up its budget of `retries + 1`
    /// tries (the original attempt plus `retries` retries).
    pub fn can_retry(&self) -> bool {
        self.attempt <= self.retries + 1
    }

    pub fn lease(&self) -> Option<LeaseRef> {
        match (self.acquired, self.timeout) {
            (Some(acquired), Some(timeout)) => Some(LeaseRef {
                id: self.id.clone(),
                acquired,
                timeout,
            }),
            _ => None,
        }
    }

    /// Marks the job done: rearms a recurring job back to `Waiting` for its next occurrence, or
    /// moves a one-shot job to `Completed`. Requires an active, unexpired lease — a
    /// [`JobQueueError::LeaseLost`] here means the supervisor already reclaimed this job out from
    /// under the handler, and the result is discarded rather than recorded.
    pub async fn complete(&mut self, storage: &dyn Storage, clock: &dyn Clock, result: Option<Value>) -> Result<(), JobQueueError> {
        let now = clock.now();
        if self.is_complete() || self.has_timed_out(now) {
            return Err(JobQueueError::State {
                job_id: self.id.clone(),
                reason: "job is already resolved or its lease has expired".into(),
            });
        }
        let lease = self.lease().ok_or_else(|| JobQueueError::State {
            job_id: self.id.clone(),
            reason: "job has no active lease".into(),
        })?;

        let stopwatches = Stopwatches::compute(self.scheduled, self.acquired, now);
        let patch = if let Some(cron_expr) = &self.recurring {
            let next = next_occurrence(cron_expr, &self.timezone, now).unwrap_or(now);
            JobPatch::new(now)
                .status(JobStatus::Waiting)
                .scheduled(next)
                .acquired(None)
                .timeout(None)
                .attempt(0)
                .stopwatches(stopwatches)
        } else {
            JobPatch::new(now)
                .status(JobStatus::Completed)
                .completed(Some(now))
                .timeout(None)
                .stopwatches(stopwatches)
        };

        let updated = storage
            .update_running_job(&lease, patch)
            .await?
            .ok_or_else(|| JobQueueError::LeaseLost { job_id: self.id.clone() })?;
        *self = updated;

        if let Some(message) = result {
            storage.write_job_result(&self.job_type, &self.id, message).await?;
        }
        Ok(())
    }

    /// Records a handler failure without ending the attempt: status moves to `Error` and the
    /// failure is appended to the job's log. The engine decides afterward, from `can_retry`,
    /// whether to try again or call [`Job::fail`].
    pub async fn record_error(&mut self, storage: &dyn Storage, clock: &dyn Clock, err: &anyhow::Error) -> Result<(), JobQueueError> {
        let now = clock.now();
        let patch = JobPatch::new(now).status(JobStatus::Error);
        if let Some(updated) = storage.update_job_by_id(&self.id, patch).await? {
            *self = updated;
        }
        storage
            .write_job_log(&self.job_type, &self.id, LogLevel::Error, Value::String(format!("{err:#}")))
            .await?;
        Ok(())
    }

    /// Ends a job's retry budget: rearms a recurring job for its next occurrence (with a fresh
    /// attempt counter), or leaves a one-shot job permanently `Failed`.
    pub async fn fail(&mut self, storage: &dyn Storage, clock: &dyn Clock) -> Result<(), JobQueueError> {
        let now = clock.now();
        let patch = if let Some(cron_expr) = &self.recurring {
            let next = next_occurrence(cron_expr, &self.timezone, now).unwrap_or(self.scheduled);
            JobPatch::new(now)
                .status(JobStatus::Failed)
                .scheduled(next)
                .acquired(None)
                .timeout(None)
                .attempt(0)
        } else {
            JobPatch::new(now)
                .status(JobStatus::Failed)
                .attempt(self.attempt.saturating_sub(1))
        };
        if let Some(updated) = storage.update_job_by_id(&self.id, patch).await? {
            *self = updated;
        }
        Ok(())
    }

    /// Retires a job whose `expire` deadline has passed before it was ever claimed.
    pub async fn expire(&mut self, storage: &dyn Storage, clock: &dyn Clock) -> Result<(), JobQueueError> {
        let now = clock.now();
        let patch = JobPatch::new(now).status(JobStatus::Expired).completed(Some(now));
        if let Some(updated) = storage.update_job_by_id(&self.id, patch).await? {
            *self = updated;
        }
        Ok(())
    }

    /// Extends an in-flight lease, called by a handler doing long-running work to stay ahead of
    /// the lease supervisor. Like [`Job::complete`], this is lease-guarded: a stale handler whose
    /// lease already expired gets [`JobQueueError::LeaseLost`] instead of silently resurrecting.
    pub async fn update_timeout(&mut self, storage: &dyn Storage, clock: &dyn Clock, seconds: i64) -> Result<(), JobQueueError> {
        let now = clock.now();
        if self.is_complete() || self.has_timed_out(now) {
            return Err(JobQueueError::State {
                job_id: self.id.clone(),
                reason: "cannot extend the timeout of a resolved or expired lease".into(),
            });
        }
        let lease = self.lease().ok_or_else(|| JobQueueError::State {
            job_id: self.id.clone(),
            reason: "job has no active lease".into(),
        })?;
        let new_timeout = now + Duration::seconds(seconds);
        let patch = JobPatch::new(now).timeout(Some(new_timeout));
        let updated = storage
            .update_running_job(&lease, patch)
            .await?
            .ok_or_else(|| JobQueueError::LeaseLost { job_id: self.id.clone() })?;
        *self = updated;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn new_job_defaults_to_now_and_waiting() {
        let job = Job::new("email.send", Value::Null, "api", JobOptions::default(), now());
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.scheduled, now());
        assert_eq!(job.retries, DEFAULT_RETRIES);
        assert_eq!(job.attempt, 0);
    }

    #[test]
    fn delay_pushes_scheduled_time_forward() {
        let opts = JobOptions {
            delay: Some(Duration::seconds(30)),
            ..Default::default()
        };
        let job = Job::new("email.send", Value::Null, "api", opts, now());
        assert_eq!(job.scheduled, now() + Duration::seconds(30));
    }

    #[test]
    fn delay_never_moves_an_explicit_schedule_earlier() {
        let later = now() + Duration::hours(1);
        let opts = JobOptions {
            scheduled: Some(later),
            delay: Some(Duration::seconds(5)),
            ..Default::default()
        };
        let job = Job::new("email.send", Value::Null, "api", opts, now());
        assert_eq!(job.scheduled, later);
    }

    #[test]
    fn recurring_job_schedules_its_first_cron_occurrence() {
        let opts = JobOptions {
            recurring: Some("0 0 * * * *".to_string()),
            ..Default::default()
        };
        let job = Job::new("report.nightly", Value::Null, "api", opts, now());
        assert!(job.scheduled > now());
    }

    #[test]
    fn can_retry_respects_retry_budget() {
        let mut job = Job::new("x", Value::Null, "api", JobOptions::default(), now());
        job.retries = 2;
        job.attempt = 3;
        assert!(job.can_retry());
        job.attempt = 4;
        assert!(!job.can_retry());
    }

    #[test]
    fn merge_prefers_override_fields() {
        let defaults = JobOptions {
            priority: Some(1),
            retries: Some(5),
            ..Default::default()
        };
        let overrides = JobOptions {
            priority: Some(9),
            ..Default::default()
        };
        let merged = defaults.merge(overrides);
        assert_eq!(merged.priority, Some(9));
        assert_eq!(merged.retries, Some(5));
    }
}
