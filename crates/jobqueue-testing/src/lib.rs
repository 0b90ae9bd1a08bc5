//! A non-durable reference [`Storage`] implementation plus a steppable [`Clock`], so tests for
//! handlers, recurrence, and cancellation don't need a Postgres instance to run against.
//!
//! `MemoryStorage` makes the same concurrency promises `jobqueue-postgres::PgStorage` makes
//! (atomic claim, unique_id dedup, lease-guarded update) but does it behind a single
//! `parking_lot::RwLock`, since a test process never actually contends on it the way a fleet of
//! real workers would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jobqueue_core::{
    Clock, Job, JobLog, JobPatch, JobQueueError, JobResult, JobSelector, JobStatus, LeaseRef, LogLevel, Storage,
};
use parking_lot::RwLock;
use serde_json::Value;

/// A [`Clock`] whose `now()` is set explicitly rather than tracking the wall clock, so recurrence
/// and lease-expiry tests can jump straight to the moment they want to assert on.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        ManualClock {
            millis: AtomicI64::new(now.timestamp_millis()),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        self.millis.store(now.timestamp_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, duration: Duration) {
        self.millis.fetch_add(duration.num_milliseconds(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).expect("manual clock millis always in range")
    }
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    logs: HashMap<String, Vec<JobLog>>,
    results: HashMap<String, JobResult>,
}

/// An in-process [`Storage`]. Cheap to construct, `Clone`, and share across tasks — every clone
/// points at the same underlying table.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage::default()
    }

    /// Returns every job currently on record, for assertions in tests that don't want to go
    /// through `find_job_by_id` one id at a time.
    pub fn all_jobs(&self) -> Vec<Job> {
        self.state.read().jobs.values().cloned().collect()
    }

    /// Back-doors a job's lease into the past, without waiting for a real timeout to elapse —
    /// the fast path for exercising the lease supervisor's reclaim behavior.
    pub fn force_lease_expiry(&self, job_id: &str) {
        if let Some(job) = self.state.write().jobs.get_mut(job_id) {
            job.timeout = Some(Utc::now() - Duration::seconds(1));
        }
    }
}

fn is_live(job: &Job) -> bool {
    !matches!(job.status, JobStatus::Completed | JobStatus::Expired | JobStatus::Canceled)
}

/// Mirrors the selection predicate every `Storage::poll_for_runnable_job` implementor must apply:
/// a fresh `Waiting` job, a `Running` job whose lease has lapsed, a job left `Error` by a prior
/// attempt, or a `Failed` recurring job waiting for its next occurrence.
fn is_runnable(job: &Job, now: DateTime<Utc>) -> bool {
    match job.status {
        JobStatus::Waiting => true,
        JobStatus::Running => job.timeout.is_some_and(|t| t <= now),
        JobStatus::Error => true,
        JobStatus::Failed => job.recurring.is_some(),
        _ => false,
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_job(&self, job: &Job) -> Result<bool, JobQueueError> {
        let mut state = self.state.write();
        if let Some(unique_id) = &job.unique_id {
            let collides = state.jobs.values().any(|existing| existing.unique_id.as_deref() == Some(unique_id.as_str()) && is_live(existing));
            if collides {
                return Ok(false);
            }
        }
        state.jobs.insert(job.id.clone(), job.clone());
        Ok(true)
    }

    async fn find_job_by_id(&self, id: &str) -> Result<Option<Job>, JobQueueError> {
        Ok(self.state.read().jobs.get(id).cloned())
    }

    async fn update_job_by_id(&self, id: &str, patch: JobPatch) -> Result<Option<Job>, JobQueueError> {
        let mut state = self.state.write();
        let Some(job) = state.jobs.get_mut(id) else {
            return Ok(None);
        };
        patch.apply(job);
        Ok(Some(job.clone()))
    }

    async fn cancel_job(&self, selector: JobSelector<'_>) -> Result<Option<Job>, JobQueueError> {
        let mut state = self.state.write();
        let now = Utc::now();
        let found_id = match selector {
            JobSelector::Id(id) => state.jobs.get(id).filter(|job| is_live(job)).map(|job| job.id.clone()),
            JobSelector::UniqueId(unique_id) => state
                .jobs
                .values()
                .find(|job| job.unique_id.as_deref() == Some(unique_id) && is_live(job))
                .map(|job| job.id.clone()),
        };
        let Some(id) = found_id else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).expect("id came from this same lookup");
        job.status = JobStatus::Canceled;
        job.modified = now;
        Ok(Some(job.clone()))
    }

    async fn poll_for_runnable_job(
        &self,
        types: &[String],
        new_timeout: DateTime<Utc>,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobQueueError> {
        let mut state = self.state.write();
        let claim_id = state
            .jobs
            .values()
            .filter(|job| is_runnable(job, now) && job.scheduled <= now && types.iter().any(|t| t == &job.job_type))
            .min_by(|a, b| a.priority.cmp(&b.priority).then(a.created.cmp(&b.created)))
            .map(|job| job.id.clone());

        let Some(id) = claim_id else {
            return Ok(None);
        };
        let job = state.jobs.get_mut(&id).expect("id came from this same lookup");
        job.status = JobStatus::Running;
        job.worker = Some(worker.to_string());
        job.acquired = Some(now);
        job.timeout = Some(new_timeout);
        job.attempt += 1;
        job.modified = now;
        Ok(Some(job.clone()))
    }

    async fn update_running_job(&self, lease: &LeaseRef, patch: JobPatch) -> Result<Option<Job>, JobQueueError> {
        let mut state = self.state.write();
        let Some(job) = state.jobs.get_mut(&lease.id) else {
            return Ok(None);
        };
        if job.acquired != Some(lease.acquired) || job.timeout != Some(lease.timeout) {
            return Ok(None);
        }
        patch.apply(job);
        Ok(Some(job.clone()))
    }

    async fn write_job_log(&self, job_type: &str, job_id: &str, level: LogLevel, message: Value) -> Result<Option<JobLog>, JobQueueError> {
        let log = JobLog {
            job_type: job_type.to_string(),
            job_id: job_id.to_string(),
            level,
            message,
            created: Utc::now(),
        };
        self.state.write().logs.entry(job_id.to_string()).or_default().push(log.clone());
        Ok(Some(log))
    }

    async fn read_job_log(&self, job_id: &str, skip: u64, limit: u64) -> Result<Vec<JobLog>, JobQueueError> {
        let state = self.state.read();
        let entries = state.logs.get(job_id).cloned().unwrap_or_default();
        Ok(entries.into_iter().skip(skip as usize).take(limit as usize).collect())
    }

    async fn write_job_result(&self, job_type: &str, job_id: &str, message: Value) -> Result<(), JobQueueError> {
        let result = JobResult {
            job_id: job_id.to_string(),
            job_type: job_type.to_string(),
            message,
            created: Utc::now(),
        };
        self.state.write().results.insert(job_id.to_string(), result);
        Ok(())
    }

    async fn read_job_result(&self, job_id: &str) -> Result<Option<JobResult>, JobQueueError> {
        Ok(self.state.read().results.get(job_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobqueue_core::JobOptions;

    fn sample_job(job_type: &str, priority: i32) -> Job {
        Job::new(job_type, Value::Null, "test", JobOptions { priority: Some(priority), ..Default::default() }, Utc::now())
    }

    #[tokio::test]
    async fn save_job_rejects_duplicate_unique_id_while_live() {
        let storage = MemoryStorage::new();
        let mut job = sample_job("email.send", 0);
        job.unique_id = Some("welcome-42".to_string());
        assert!(storage.save_job(&job).await.unwrap());

        let mut dup = sample_job("email.send", 0);
        dup.unique_id = Some("welcome-42".to_string());
        assert!(!storage.save_job(&dup).await.unwrap());
    }

    #[tokio::test]
    async fn poll_claims_highest_priority_job_first() {
        let storage = MemoryStorage::new();
        let low = sample_job("t", 10);
        let high = sample_job("t", -5);
        storage.save_job(&low).await.unwrap();
        storage.save_job(&high).await.unwrap();

        let now = Utc::now();
        let claimed = storage
            .poll_for_runnable_job(&["t".to_string()], now + Duration::seconds(30), "worker-1", now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claimed.id, high.id);
        assert_eq!(claimed.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn update_running_job_fails_on_stale_lease() {
        let storage = MemoryStorage::new();
        let job = sample_job("t", 0);
        storage.save_job(&job).await.unwrap();

        let now = Utc::now();
        let claimed = storage
            .poll_for_runnable_job(&["t".to_string()], now + Duration::seconds(30), "worker-1", now)
            .await
            .unwrap()
            .unwrap();

        let stale_lease = LeaseRef {
            id: claimed.id.clone(),
            acquired: now - Duration::seconds(999),
            timeout: now - Duration::seconds(999),
        };
        let result = storage.update_running_job(&stale_lease, JobPatch::new(now)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn cancel_job_marks_canceled_and_is_idempotent_after() {
        let storage = MemoryStorage::new();
        let job = sample_job("t", 0);
        storage.save_job(&job).await.unwrap();

        let canceled = storage.cancel_job(JobSelector::Id(&job.id)).await.unwrap().unwrap();
        assert_eq!(canceled.status, JobStatus::Canceled);

        let second = storage.cancel_job(JobSelector::Id(&job.id)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn poll_reclaims_a_job_left_in_error_status() {
        let storage = MemoryStorage::new();
        let mut job = sample_job("flaky", 0);
        job.status = JobStatus::Error;
        storage.save_job(&job).await.unwrap();

        let now = Utc::now();
        let claimed = storage.poll_for_runnable_job(&["flaky".to_string()], now + Duration::seconds(30), "worker-1", now).await.unwrap();
        assert!(claimed.is_some(), "a job left `error` by a prior attempt must still be pollable");
    }

    #[tokio::test]
    async fn poll_reclaims_a_failed_recurring_job_but_not_a_failed_one_shot() {
        let storage = MemoryStorage::new();

        let mut recurring = sample_job("nightly", 0);
        recurring.status = JobStatus::Failed;
        recurring.recurring = Some("0 0 * * * *".to_string());
        storage.save_job(&recurring).await.unwrap();

        let mut one_shot = sample_job("nightly", 0);
        one_shot.status = JobStatus::Failed;
        storage.save_job(&one_shot).await.unwrap();

        let now = Utc::now();
        let claimed = storage.poll_for_runnable_job(&["nightly".to_string()], now + Duration::seconds(30), "worker-1", now).await.unwrap().unwrap();
        assert_eq!(claimed.id, recurring.id, "only the recurring failed job is eligible for reclaim");
    }

    #[test]
    fn manual_clock_advances_deterministically() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::seconds(60));
        assert_eq!(clock.now(), start + Duration::seconds(60));
    }
}
