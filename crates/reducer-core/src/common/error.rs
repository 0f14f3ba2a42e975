//! Error types for the image worker pool.
//!
//! This module defines the central `Error` enum, which captures every failure
//! a caller of the pool can observe. Errors are `Clone` so the dispatcher can
//! fan a single failure out to several waiting slots during teardown.
//!
//! ## Error Cases
//! - `InvalidArgument`: The request (or a resize count) was malformed.
//! - `CodecFailure`: The codec faulted while transcoding.
//! - `WorkerStartup`: A worker unit could not be started.
//! - `WorkerLost`: A worker exited while it owned an in-flight task.
//! - `PoolShutdown`: The task was rejected by a forced teardown.
//! - `ChannelError`: An internal communication failure between tasks or
//!   workers.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the image worker pool.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The request was invalid and was rejected before dispatch.
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    /// The underlying codec failed to transcode the image.
    #[error("Codec failure: {message}")]
    CodecFailure { message: String },

    /// A worker unit could not be created.
    #[error("Worker {worker_id} failed to start: {reason}")]
    WorkerStartup { worker_id: usize, reason: String },

    /// The worker owning the task exited before responding.
    #[error("Worker {worker_id} exited before completing the task")]
    WorkerLost { worker_id: usize },

    /// The pool was force-terminated before the task completed.
    #[error("Worker pool is shutting down")]
    PoolShutdown,

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

impl Error {
    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Returns `true` if resubmitting the same request could succeed.
    ///
    /// Only failures of the pool itself qualify; a bad request or a codec
    /// fault will fail the same way again.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::WorkerLost { .. } | Self::PoolShutdown | Self::ChannelError { .. }
        )
    }
}
