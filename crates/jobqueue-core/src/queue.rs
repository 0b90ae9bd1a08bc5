//! The run loop: poll storage for runnable jobs, dispatch them to registered handlers with a
//! per-type concurrency cap, and supervise leases so a worker that dies mid-job doesn't strand
//! it forever.
//!
//! ```text
//!                       ┌─────────────┐
//!   push/proxy  ───────▶│   storage   │◀────── cancel
//!                       └─────┬───────┘
//!                             │ poll_for_runnable_job
//!                             ▼
//!                      ┌─────────────┐   1s tick   ┌────────────────┐
//!                      │  run_loop   │────────────▶│ lease_supervisor│
//!                      └─────┬───────┘             └────────────────┘
//!                            │ tokio::spawn
//!                            ▼
//!                      ┌─────────────┐
//!                      │   run_job   │── handler() ──▶ complete/record_error/fail
//!                      └─────────────┘
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration as ChronoDuration;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use crate::clock::{default_worker_id, Clock, SystemClock};
use crate::error::{ConfigError, JobQueueError};
use crate::events::{EventBus, JobQueueEvent};
use crate::job::{Job, JobId, JobOptions};
use crate::storage::{JobSelector, Storage};

pub type HandlerResult = anyhow::Result<Option<Value>>;
type HandlerFn = Arc<dyn Fn(JobHandle, CancelRegistrar) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

struct HandlerEntry {
    concurrency: usize,
    running: AtomicUsize,
    func: HandlerFn,
}

/// Tracks one in-flight attempt: its latest known [`Job`] snapshot (kept current so the lease
/// supervisor can evaluate `has_timed_out` without a storage round trip), whether it has already
/// been canceled, and the listeners registered through [`CancelRegistrar::on_cancel`].
struct RunningEntry {
    job: parking_lot::Mutex<Job>,
    canceled: AtomicBool,
    listeners: parking_lot::Mutex<Vec<Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>>>,
}

impl RunningEntry {
    fn new(job: Job) -> Self {
        RunningEntry {
            job: parking_lot::Mutex::new(job),
            canceled: AtomicBool::new(false),
            listeners: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn snapshot(&self) -> Job {
        self.job.lock().clone()
    }

    fn set_job(&self, job: Job) {
        *self.job.lock() = job;
    }

    fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    fn has_timed_out(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        self.job.lock().has_timed_out(now)
    }

    /// Marks the entry canceled and fires every registered listener exactly once. Returns any
    /// errors listeners raised, for the caller to turn into [`JobQueueEvent::Error`]s.
    fn cancel(&self) -> Vec<anyhow::Error> {
        if self.canceled.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        self.listeners.lock().iter().filter_map(|listener| listener().err()).collect()
    }

    fn register_listener(&self, listener: Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>) {
        self.listeners.lock().push(listener);
    }
}

/// The job and cancellation plumbing handed to a running handler. Handlers read the job through
/// [`JobHandle::job`] and, for long operations, extend their own lease with
/// [`JobHandle::update_timeout`] before the supervisor's deadline arrives.
#[derive(Clone)]
pub struct JobHandle {
    entry: Arc<RunningEntry>,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl JobHandle {
    pub fn job(&self) -> Job {
        self.entry.snapshot()
    }

    pub async fn update_timeout(&self, seconds: i64) -> Result<(), JobQueueError> {
        let mut job = self.entry.snapshot();
        job.update_timeout(self.storage.as_ref(), self.clock.as_ref(), seconds).await?;
        self.entry.set_job(job);
        Ok(())
    }
}

/// Lets a running handler register cleanup to run if the job is canceled or its lease expires
/// out from under it. Registration never fails here the way a dynamic-language queue's `onCancel`
/// might reject a non-callable — the type system already guarantees that.
#[derive(Clone)]
pub struct CancelRegistrar {
    entry: Arc<RunningEntry>,
}

impl CancelRegistrar {
    pub fn on_cancel<F>(&self, listener: F)
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.entry.register_listener(Box::new(listener));
    }

    pub fn is_canceled(&self) -> bool {
        self.entry.is_canceled()
    }
}

/// Tunable knobs for [`JobQueue`]'s run loop.
#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    /// Total jobs this worker will run concurrently, across all job types.
    pub concurrency: usize,
    /// Lease duration granted on each claim, in seconds.
    pub timeout_secs: i64,
    /// How long `run_loop` sleeps when nothing was runnable.
    pub idle_sleep: StdDuration,
    /// How long `run_loop` sleeps between successful claims, to avoid starving other workers.
    pub active_sleep: StdDuration,
    /// Overrides the `hostname[pid]` default worker identity.
    pub worker_id: Option<String>,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        JobQueueConfig {
            concurrency: 10,
            timeout_secs: 60,
            idle_sleep: StdDuration::from_millis(1000),
            active_sleep: StdDuration::from_millis(10),
            worker_id: None,
        }
    }
}

impl JobQueueConfig {
    pub fn builder() -> JobQueueConfigBuilder {
        JobQueueConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct JobQueueConfigBuilder {
    config: JobQueueConfig,
}

impl JobQueueConfigBuilder {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: i64) -> Self {
        self.config.timeout_secs = timeout_secs;
        self
    }

    pub fn idle_sleep(mut self, idle_sleep: StdDuration) -> Self {
        self.config.idle_sleep = idle_sleep;
        self
    }

    pub fn active_sleep(mut self, active_sleep: StdDuration) -> Self {
        self.config.active_sleep = active_sleep;
        self
    }

    pub fn worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = Some(worker_id.into());
        self
    }

    pub fn build(self) -> JobQueueConfig {
        self.config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Stopped,
    Running,
    Paused,
}

/// The engine: owns the handler registry, the run loop, and the lease supervisor. Cheap to clone
/// (it's `Arc`-internally where it needs to be), but [`JobQueue::start`], [`JobQueue::pause`], and
/// [`JobQueue::stop`] require an `Arc<JobQueue>` since they spawn tasks that must outlive the
/// calling stack frame.
pub struct JobQueue {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    config: JobQueueConfig,
    worker: String,
    handlers: DashMap<String, Arc<HandlerEntry>>,
    running: Arc<AtomicUsize>,
    running_jobs: Arc<DashMap<JobId, Arc<RunningEntry>>>,
    events: EventBus,
    state: AsyncMutex<RunState>,
    stop_flag: Arc<AtomicBool>,
    /// Set by [`JobQueue::pause`] to stop the run loop from polling without touching `stop_flag` —
    /// the lease supervisor checks only `stop_flag`, so a paused queue keeps supervising whatever
    /// is still running.
    poll_paused: Arc<AtomicBool>,
    tasks: AsyncMutex<Option<(JoinHandle<()>, JoinHandle<()>)>>,
}

impl JobQueue {
    pub fn new(storage: Arc<dyn Storage>, config: JobQueueConfig) -> Self {
        let worker = config.worker_id.clone().unwrap_or_else(default_worker_id);
        JobQueue {
            storage,
            clock: Arc::new(SystemClock),
            config,
            worker,
            handlers: DashMap::new(),
            running: Arc::new(AtomicUsize::new(0)),
            running_jobs: Arc::new(DashMap::new()),
            events: EventBus::new(),
            state: AsyncMutex::new(RunState::Stopped),
            stop_flag: Arc::new(AtomicBool::new(false)),
            poll_paused: Arc::new(AtomicBool::new(false)),
            tasks: AsyncMutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    pub fn worker_id(&self) -> &str {
        &self.worker
    }

    pub fn running_count(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Registers an async handler for `job_type`, allowed to run up to `concurrency` instances of
    /// that type at once. Fails if a handler for this type is already registered — handlers are
    /// meant to be wired up once at startup, not swapped at runtime.
    pub fn handle<F, Fut>(&self, job_type: impl Into<String>, concurrency: usize, handler: F) -> Result<(), JobQueueError>
    where
        F: Fn(JobHandle, CancelRegistrar) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let job_type = job_type.into();
        if self.handlers.contains_key(&job_type) {
            return Err(ConfigError::HandlerExists(job_type).into());
        }
        let func: HandlerFn = Arc::new(move |handle, cancel| Box::pin(handler(handle, cancel)) as Pin<Box<dyn Future<Output = HandlerResult> + Send>>);
        self.handlers.insert(
            job_type.clone(),
            Arc::new(HandlerEntry {
                concurrency,
                running: AtomicUsize::new(0),
                func,
            }),
        );
        self.events.emit(JobQueueEvent::Handle(job_type));
        Ok(())
    }

    /// Persists `job` and, if it was actually accepted (not rejected as a `unique_id` duplicate),
    /// emits [`JobQueueEvent::Push`].
    pub async fn push(&self, job: Job) -> Result<bool, JobQueueError> {
        let saved = self.storage.save_job(&job).await?;
        if saved {
            self.events.emit(JobQueueEvent::Push(job));
        }
        Ok(saved)
    }

    /// Returns a [`JobProxy`] bound to `job_type` with `defaults` layered under every call's own
    /// overrides — the idiomatic way to build a small, reusable "producer" for one job type
    /// without repeating its options at every call site.
    pub fn proxy(self: &Arc<Self>, job_type: impl Into<String>, defaults: JobOptions) -> JobProxy {
        JobProxy {
            queue: self.clone(),
            job_type: job_type.into(),
            defaults,
        }
    }

    /// Cancels a job by id or unique_id. If the job is currently running on this worker, its
    /// cancel listeners fire immediately; if it's running on another worker, that worker's own
    /// lease supervisor will notice on its next poll of [`crate::storage::Storage::find_job_by_id`]-backed
    /// state once the row reflects `Canceled`.
    pub async fn cancel(&self, id: Option<&str>, unique_id: Option<&str>) -> Result<Option<Job>, JobQueueError> {
        let selector = match (id, unique_id) {
            (Some(id), _) => JobSelector::Id(id),
            (None, Some(unique_id)) => JobSelector::UniqueId(unique_id),
            (None, None) => return Err(ConfigError::MissingSelector.into()),
        };
        let job = self.storage.cancel_job(selector).await?;
        if let Some(job) = &job {
            if let Some(entry) = self.running_jobs.get(&job.id) {
                for err in entry.cancel() {
                    self.events.emit(JobQueueEvent::Error(Arc::new(JobQueueError::storage(err))));
                }
            }
            self.events.emit(JobQueueEvent::Cancel(job.clone()));
        }
        Ok(job)
    }

    /// Connects storage and starts the run loop and lease supervisor as background tasks.
    /// Idempotent: calling `start` while already running is a no-op. Calling it again after
    /// [`JobQueue::pause`] simply resumes polling on the same tasks rather than spawning new ones.
    pub async fn start(self: &Arc<Self>) -> Result<(), JobQueueError> {
        {
            let mut state = self.state.lock().await;
            if *state == RunState::Running {
                return Ok(());
            }
            if *state == RunState::Paused {
                self.poll_paused.store(false, Ordering::SeqCst);
                *state = RunState::Running;
                self.events.emit(JobQueueEvent::Start);
                return Ok(());
            }
            *state = RunState::Running;
        }
        self.storage.connect().await?;
        self.events.emit(JobQueueEvent::Connect);

        self.stop_flag.store(false, Ordering::SeqCst);
        self.poll_paused.store(false, Ordering::SeqCst);

        let loop_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.run_loop().await })
        };
        let supervisor_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.run_lease_supervisor().await })
        };
        *self.tasks.lock().await = Some((loop_handle, supervisor_handle));

        self.events.emit(JobQueueEvent::Start);
        Ok(())
    }

    /// Stops polling for new work without disconnecting storage or canceling running jobs — they
    /// run to completion. Unlike [`JobQueue::stop`], the lease supervisor keeps running, so a job
    /// still in flight when `pause` is called doesn't lose timeout supervision for the whole paused
    /// window. A subsequent [`JobQueue::start`] resumes polling.
    pub async fn pause(self: &Arc<Self>) {
        self.poll_paused.store(true, Ordering::SeqCst);
        *self.state.lock().await = RunState::Paused;
        self.events.emit(JobQueueEvent::Pause);
    }

    /// Cancels every running job, waits for them to drain, stops the run loop and the lease
    /// supervisor, and disconnects storage. Use this for a clean worker shutdown;
    /// [`JobQueue::pause`] is for a temporary halt.
    pub async fn stop(self: &Arc<Self>) {
        self.stop_flag.store(true, Ordering::SeqCst);

        for entry in self.running_jobs.iter() {
            entry.cancel();
        }
        while self.running.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        if let Some((loop_handle, supervisor_handle)) = self.tasks.lock().await.take() {
            let _ = loop_handle.await;
            let _ = supervisor_handle.await;
        }

        let _ = self.storage.disconnect().await;
        self.events.emit(JobQueueEvent::Disconnect);

        *self.state.lock().await = RunState::Stopped;
        self.events.emit(JobQueueEvent::Stop);
    }

    fn runnable_types(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|entry| entry.value().running.load(Ordering::SeqCst) < entry.value().concurrency)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Jitters `self.config.idle_sleep` by up to +/-20% so that many workers polling the same
    /// queue don't all wake up and hit storage in lockstep.
    fn jittered_idle_sleep(&self) -> StdDuration {
        let base = self.config.idle_sleep.as_millis() as i64;
        let spread = base / 5;
        if spread == 0 {
            return self.config.idle_sleep;
        }
        let jitter = fastrand::i64(-spread..=spread);
        StdDuration::from_millis((base + jitter).max(0) as u64)
    }

    async fn run_loop(self: Arc<Self>) {
        loop {
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }

            if self.poll_paused.load(Ordering::SeqCst) {
                tokio::time::sleep(self.jittered_idle_sleep()).await;
                continue;
            }

            if self.running.load(Ordering::SeqCst) >= self.config.concurrency {
                tokio::time::sleep(self.jittered_idle_sleep()).await;
                continue;
            }

            let types = self.runnable_types();
            if types.is_empty() {
                tokio::time::sleep(self.jittered_idle_sleep()).await;
                continue;
            }

            let now = self.clock.now();
            let new_timeout = now + ChronoDuration::seconds(self.config.timeout_secs);
            match self.storage.poll_for_runnable_job(&types, new_timeout, &self.worker, now).await {
                Ok(Some(job)) => {
                    self.dispatch_claimed_job(job).await;
                    tokio::time::sleep(self.config.active_sleep).await;
                }
                Ok(None) => tokio::time::sleep(self.jittered_idle_sleep()).await,
                Err(err) => {
                    self.events.emit(JobQueueEvent::Error(Arc::new(err)));
                    tokio::time::sleep(self.jittered_idle_sleep()).await;
                }
            }
        }
    }

    /// Disposes of a freshly claimed job that can't actually be attempted (past its `expire`
    /// deadline or out of retries), or spawns it for real execution.
    async fn dispatch_claimed_job(self: &Arc<Self>, mut job: Job) {
        let now = self.clock.now();
        if job.has_expired(now) {
            if let Err(err) = job.expire(self.storage.as_ref(), self.clock.as_ref()).await {
                self.events.emit(JobQueueEvent::Error(Arc::new(err)));
            }
            return;
        }
        if !job.can_retry() {
            if let Err(err) = job.fail(self.storage.as_ref(), self.clock.as_ref()).await {
                self.events.emit(JobQueueEvent::Error(Arc::new(err)));
            }
            return;
        }

        let this = self.clone();
        tokio::spawn(async move { this.run_job(job).await });
    }

    async fn run_job(self: Arc<Self>, job: Job) {
        self.events.emit(JobQueueEvent::BeforeRun(job.clone()));
        self.running.fetch_add(1, Ordering::SeqCst);

        let handler = match self.handlers.get(&job.job_type).map(|entry| entry.value().clone()) {
            Some(handler) => handler,
            None => {
                tracing::error!(job_type = %job.job_type, job_id = %job.id, "no handler registered for job type");
                self.running.fetch_sub(1, Ordering::SeqCst);
                return;
            }
        };
        handler.running.fetch_add(1, Ordering::SeqCst);

        let job_id = job.id.clone();
        let entry = Arc::new(RunningEntry::new(job));
        self.running_jobs.insert(job_id.clone(), entry.clone());

        let handle = JobHandle {
            entry: entry.clone(),
            storage: self.storage.clone(),
            clock: self.clock.clone(),
        };
        let registrar = CancelRegistrar { entry: entry.clone() };

        let result = (handler.func)(handle, registrar).await;
        let mut job = entry.snapshot();

        match result {
            Ok(value) => {
                if entry.is_canceled() {
                    tracing::debug!(job_id = %job.id, "discarding result for a canceled job");
                } else if job.has_error() {
                    tracing::debug!(job_id = %job.id, "skipping completion for a job already marked error");
                } else {
                    match job.complete(self.storage.as_ref(), self.clock.as_ref(), value).await {
                        Ok(()) => {}
                        Err(JobQueueError::LeaseLost { .. }) => {
                            tracing::debug!(job_id = %job.id, "lease lost while completing; treating as canceled");
                        }
                        Err(err) => self.events.emit(JobQueueEvent::Error(Arc::new(err))),
                    }
                }
            }
            Err(err) => {
                let canceled = entry.is_canceled();
                let err = Arc::new(err);
                self.events.emit(JobQueueEvent::HandlerError {
                    job: job.clone(),
                    error: err.clone(),
                });
                if !canceled {
                    if let Err(record_err) = job.record_error(self.storage.as_ref(), self.clock.as_ref(), &err).await {
                        self.events.emit(JobQueueEvent::Error(Arc::new(record_err)));
                    }
                } else {
                    tracing::debug!(job_id = %job.id, "handler error on a canceled job; not recording");
                }
            }
        }

        self.running_jobs.remove(&job_id);
        handler.running.fetch_sub(1, Ordering::SeqCst);
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.events.emit(JobQueueEvent::AfterRun(job));
    }

    async fn run_lease_supervisor(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(StdDuration::from_secs(1));
        loop {
            ticker.tick().await;
            if self.stop_flag.load(Ordering::SeqCst) {
                break;
            }
            let now = self.clock.now();
            let expired: Vec<Arc<RunningEntry>> = self
                .running_jobs
                .iter()
                .filter(|entry| !entry.value().is_canceled() && entry.value().has_timed_out(now))
                .map(|entry| entry.value().clone())
                .collect();

            for entry in expired {
                let job = entry.snapshot();
                for err in entry.cancel() {
                    self.events.emit(JobQueueEvent::Error(Arc::new(JobQueueError::storage(err))));
                }
                self.events.emit(JobQueueEvent::Timeout(job));
            }
        }
    }
}

/// A bound producer for one job type, carrying its own fixed defaults so callers only specify
/// what varies from one push to the next.
#[derive(Clone)]
pub struct JobProxy {
    queue: Arc<JobQueue>,
    job_type: String,
    defaults: JobOptions,
}

impl JobProxy {
    pub async fn push(&self, message: Value, opts: JobOptions) -> Result<bool, JobQueueError> {
        let merged = self.defaults.clone().merge(opts);
        let now = self.queue.clock.now();
        let job = Job::new(self.job_type.clone(), message, self.queue.worker.clone(), merged, now);
        self.queue.push(job).await
    }
}
