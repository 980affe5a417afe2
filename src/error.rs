use thiserror::Error;

use crate::job::JobStatus;

/// Failures surfaced by [`crate::job::JobStore`] implementations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job not found")]
    NotFound,

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("invalid status transition: cannot transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

/// Failures surfaced by [`crate::queue::PendingQueue`] implementations.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("job_id cannot be empty")]
    EmptyJobId,

    #[error("job not in queue")]
    NotInQueue,

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Failures surfaced by [`crate::storage::StorageSigner`] implementations.
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("object key cannot be empty")]
    EmptyKey,

    #[error("no bucket configured for signing")]
    MissingBucket,

    #[error("signer backend error: {0}")]
    Backend(String),
}
