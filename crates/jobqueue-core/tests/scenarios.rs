use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use jobqueue_core::{Job, JobOptions, JobQueue, JobQueueConfig, JobSelector, JobStatus, Storage};
use jobqueue_testing::MemoryStorage;
use serde_json::{json, Value};

fn job(job_type: &str, opts: JobOptions) -> Job {
    Job::new(job_type, Value::Null, "test-client", opts, Utc::now())
}

#[tokio::test]
async fn simple_round_trip_completes_through_a_real_handler() {
    let storage = Arc::new(MemoryStorage::new());
    let config = JobQueueConfig::builder().concurrency(2).idle_sleep(StdDuration::from_millis(5)).active_sleep(StdDuration::from_millis(1)).build();
    let queue = Arc::new(JobQueue::new(storage.clone(), config));

    queue
        .handle("greet", 1, |handle, _cancel| async move {
            let job = handle.job();
            Ok(Some(json!({ "greeted": job.client })))
        })
        .unwrap();

    let pushed = queue.push(job("greet", JobOptions::default())).await.unwrap();
    assert!(pushed);

    queue.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(200)).await;
    queue.stop().await;

    let jobs = storage.all_jobs();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, JobStatus::Completed);

    let result = storage.read_job_result(&jobs[0].id).await.unwrap().unwrap();
    assert_eq!(result.message["greeted"], json!("test-client"));
}

#[tokio::test]
async fn canceling_a_running_job_fires_its_cancel_listener() {
    let storage = Arc::new(MemoryStorage::new());
    let config = JobQueueConfig::builder().concurrency(2).idle_sleep(StdDuration::from_millis(5)).active_sleep(StdDuration::from_millis(1)).build();
    let queue = Arc::new(JobQueue::new(storage.clone(), config));

    let canceled_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

    {
        let canceled_flag = canceled_flag.clone();
        queue
            .handle("long_task", 1, move |_handle, cancel| {
                let canceled_flag = canceled_flag.clone();
                async move {
                    cancel.on_cancel(move || {
                        canceled_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                        Ok(())
                    });
                    tokio::time::sleep(StdDuration::from_millis(500)).await;
                    Ok(None)
                }
            })
            .unwrap();
    }

    let pushed_job = job("long_task", JobOptions::default());
    let id = pushed_job.id.clone();
    queue.push(pushed_job).await.unwrap();

    queue.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let canceled = queue.cancel(Some(&id), None).await.unwrap();
    assert!(canceled.is_some());
    assert_eq!(canceled.unwrap().status, JobStatus::Canceled);
    assert!(canceled_flag.load(std::sync::atomic::Ordering::SeqCst));

    queue.stop().await;
}

#[tokio::test]
async fn unique_id_prevents_a_second_live_job_from_being_admitted() {
    let storage = MemoryStorage::new();
    let mut first = job("email.welcome", JobOptions::default());
    first.unique_id = Some("user-7".to_string());
    assert!(storage.save_job(&first).await.unwrap());

    let mut second = job("email.welcome", JobOptions::default());
    second.unique_id = Some("user-7".to_string());
    assert!(!storage.save_job(&second).await.unwrap());
}

#[tokio::test]
async fn lease_timeout_returns_a_job_to_waiting_for_retry() {
    let storage = MemoryStorage::new();
    let pushed = job("slow", JobOptions::default());
    let id = pushed.id.clone();
    storage.save_job(&pushed).await.unwrap();

    let now = Utc::now();
    let claimed = storage
        .poll_for_runnable_job(&["slow".to_string()], now + Duration::seconds(1), "worker-a", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.status, JobStatus::Running);
    assert_eq!(claimed.attempt, 1);

    storage.force_lease_expiry(&id);

    // A fresh poll reclaims the job directly off its expired lease — no help needed from a
    // manual status reset; `running ∧ timeout ≤ now` is itself part of the claim predicate.
    let now2 = now + Duration::seconds(2);
    let second_claim = storage
        .poll_for_runnable_job(&["slow".to_string()], now2 + Duration::seconds(1), "worker-b", now2)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second_claim.attempt, 2);
    assert!(second_claim.can_retry());
}

#[tokio::test]
async fn exhausting_retries_leaves_a_one_shot_job_permanently_failed() {
    use jobqueue_core::{Clock, SystemClock};

    let storage = MemoryStorage::new();
    let mut pushed = job("flaky", JobOptions { retries: Some(1), ..Default::default() });
    pushed.attempt = 3; // already spent the original attempt plus its one retry
    storage.save_job(&pushed).await.unwrap();

    let mut tracked = pushed.clone();
    assert!(!tracked.can_retry());

    let clock = SystemClock;
    tracked.fail(&storage, &clock).await.unwrap();
    assert_eq!(tracked.status, JobStatus::Failed);

    let stored = storage.find_job_by_id(&pushed.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
}

#[tokio::test]
async fn poll_prefers_lower_priority_number_then_earlier_schedule() {
    let storage = MemoryStorage::new();
    let now = Utc::now();

    let urgent = job(
        "batch",
        JobOptions {
            priority: Some(-10),
            scheduled: Some(now),
            ..Default::default()
        },
    );
    let routine = job(
        "batch",
        JobOptions {
            priority: Some(0),
            scheduled: Some(now - Duration::minutes(5)),
            ..Default::default()
        },
    );
    storage.save_job(&routine).await.unwrap();
    storage.save_job(&urgent).await.unwrap();

    let claimed = storage
        .poll_for_runnable_job(&["batch".to_string()], now + Duration::seconds(30), "worker-1", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, urgent.id, "lower priority number must be claimed first even though it was scheduled later");
}

#[tokio::test]
async fn poll_breaks_same_priority_ties_by_earliest_created_not_schedule() {
    let storage = MemoryStorage::new();
    let now = Utc::now();

    // Same priority, same scheduled time, but `first` was created earlier. If the tie-break
    // mistakenly looked at `scheduled` instead of `created` this would be ambiguous; the job
    // IDs are otherwise unordered so only `created` can decide it.
    let first = Job::new(
        "batch",
        Value::Null,
        "test-client",
        JobOptions { priority: Some(5), scheduled: Some(now), ..Default::default() },
        now - Duration::minutes(10),
    );
    let second = Job::new(
        "batch",
        Value::Null,
        "test-client",
        JobOptions { priority: Some(5), scheduled: Some(now), ..Default::default() },
        now - Duration::minutes(1),
    );
    storage.save_job(&second).await.unwrap();
    storage.save_job(&first).await.unwrap();

    let claimed = storage
        .poll_for_runnable_job(&["batch".to_string()], now + Duration::seconds(30), "worker-1", now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, first.id, "equal priority must fall back to earliest created, not insertion order or schedule");
}

#[tokio::test]
async fn a_tracing_subscriber_can_be_attached_without_panicking() {
    use tracing_subscriber::EnvFilter;

    let _guard = tracing::subscriber::set_default(tracing_subscriber::fmt().with_env_filter(EnvFilter::new("trace")).finish());

    let storage = Arc::new(MemoryStorage::new());
    let config = JobQueueConfig::builder().idle_sleep(StdDuration::from_millis(5)).active_sleep(StdDuration::from_millis(1)).build();
    let queue = Arc::new(JobQueue::new(storage.clone(), config));
    queue.handle("noop", 1, |_handle, _cancel| async move { Ok(None) }).unwrap();
    queue.push(job("noop", JobOptions::default())).await.unwrap();

    queue.start().await.unwrap();
    tokio::time::sleep(StdDuration::from_millis(50)).await;
    queue.stop().await;
}

#[tokio::test]
async fn cancel_by_unique_id_finds_the_right_job() {
    let storage = MemoryStorage::new();
    let mut a = job("report", JobOptions::default());
    a.unique_id = Some("nightly-report".to_string());
    storage.save_job(&a).await.unwrap();

    let canceled = storage.cancel_job(JobSelector::UniqueId("nightly-report")).await.unwrap().unwrap();
    assert_eq!(canceled.id, a.id);
    assert_eq!(canceled.status, JobStatus::Canceled);
}
