use crate::job::JobId;
use thiserror::Error;

/// Configuration and registration mistakes, detected before anything touches storage.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("storage uri is missing a scheme (expected `scheme://...`)")]
    MissingUri,

    #[error("no backend registered for scheme `{0}`")]
    UnknownScheme(String),

    #[error("a handler is already registered for job type `{0}`")]
    HandlerExists(String),

    #[error("cancel requires either an id or a unique_id")]
    MissingSelector,
}

/// Top-level error type returned by the engine and the storage contract.
///
/// Handler failures are deliberately excluded from this type: a handler returning
/// `Err` is ordinary job failure, reported through [`crate::events::JobQueueEvent::HandlerError`],
/// not a queue malfunction.
#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// Never constructed by this crate: a `unique_id` collision is surfaced through
    /// [`crate::queue::JobQueue::push`] returning `Ok(false)`, not through this variant. It stays
    /// part of the taxonomy so a backend that can only detect the collision as a thrown error
    /// (rather than an `Ok(false)`) has somewhere to put it.
    #[error("job `{job_id}` already has a unique_id collision")]
    DuplicateKey { job_id: JobId },

    #[error("lease for job `{job_id}` was lost (superseded or expired)")]
    LeaseLost { job_id: JobId },

    #[error("job `{job_id}` is in an invalid state for this operation: {reason}")]
    State { job_id: JobId, reason: String },
}

impl JobQueueError {
    pub fn storage(err: impl Into<anyhow::Error>) -> Self {
        JobQueueError::Storage(err.into())
    }
}
