//! Engine and storage contract for a distributed, persistent job queue.
//!
//! A [`Job`](job::Job) is a row that one of any number of worker processes can claim, run once,
//! and resolve — at-least-once, never at-most-once. [`Storage`](storage::Storage) is the contract
//! a persistence backend implements to make that claim safe under concurrent workers; this crate
//! ships no backend of its own (see `jobqueue-postgres` and `jobqueue-testing`), only the engine
//! that drives one.
//!
//! ```text
//! producer ──push──▶ Storage ◀──poll_for_runnable_job── JobQueue::run_loop ──▶ handler
//! ```

pub mod backend;
pub mod clock;
pub mod error;
pub mod events;
pub mod job;
pub mod queue;
pub mod storage;

pub use backend::{BackendFactory, BackendRegistry};
pub use clock::{default_worker_id, next_occurrence, Clock, SystemClock};
pub use error::{ConfigError, JobQueueError};
pub use events::{EventBus, JobQueueEvent};
pub use job::{Job, JobId, JobOptions, JobStatus, Stopwatches};
pub use queue::{CancelRegistrar, HandlerResult, JobHandle, JobProxy, JobQueue, JobQueueConfig, JobQueueConfigBuilder};
pub use storage::{JobLog, JobPatch, JobResult, JobSelector, LeaseRef, LogLevel, Storage};
