use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::JobQueueError;
use crate::job::Job;

/// Everything observable about the engine's operation, fanned out to any number of subscribers.
/// Mirrors the lifecycle in [`crate::queue::JobQueue`]: registration, the run/pause/stop
/// transitions, and the before/after/timeout/error triad around every attempt.
#[derive(Debug, Clone)]
pub enum JobQueueEvent {
    /// A job was accepted by [`crate::queue::JobQueue::push`].
    Push(Job),
    /// A handler was registered for a job type.
    Handle(String),
    Start,
    Pause,
    Stop,
    Connect,
    Disconnect,
    /// A job is about to run, already marked `Running` with a fresh lease.
    BeforeRun(Job),
    /// A job finished an attempt, however it resolved.
    AfterRun(Job),
    /// The lease supervisor reclaimed a job whose lease expired mid-run.
    Timeout(Job),
    /// A job was canceled, whether or not it was currently running.
    Cancel(Job),
    /// A handler returned `Err`. Raised before the corresponding [`JobQueueEvent::AfterRun`].
    HandlerError { job: Job, error: Arc<anyhow::Error> },
    /// Something went wrong in the engine or storage layer itself, not in a handler.
    Error(Arc<JobQueueError>),
}

/// A thin wrapper over [`tokio::sync::broadcast`] so subscribers don't need to depend on tokio's
/// channel types directly. Events are best-effort: if nobody is listening, `emit` silently drops
/// them, same as the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<JobQueueEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobQueueEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: JobQueueEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new()
    }
}
