use reducer_core::{CorrelationId, Error, TranscodeRequest, TranscodeResult};
use std::time::Instant;
use tokio::sync::oneshot;

/// Write side of a [`PendingResponse`](super::PendingResponse).
///
/// Only the dispatcher holds one; sending consumes it, so a slot resolves at
/// most once.
pub(crate) type ResponseSlot = oneshot::Sender<Result<TranscodeResult, Error>>;

/// A [`TranscodeRequest`] tagged with its correlation id.
///
/// Owned by the dispatcher while queued, then moved to exactly one worker.
#[derive(Debug)]
pub(crate) struct TaskEnvelope {
    pub id: CorrelationId,
    pub request: TranscodeRequest,
    pub submitted_at: Instant,
}

impl TaskEnvelope {
    pub fn new(id: CorrelationId, request: TranscodeRequest) -> Self {
        Self {
            id,
            request,
            submitted_at: Instant::now(),
        }
    }
}

/// A message sent from the dispatcher to an individual worker unit.
///
/// [`WorkRequest`]s travel over a capacity-1 channel, so a worker never has
/// more than one message waiting.
#[derive(Debug)]
pub(crate) enum WorkRequest {
    /// Transcode one image and answer with a single
    /// [`WorkerEvent::Completed`].
    Transcode(TaskEnvelope),

    /// Request the worker to shut down gracefully.
    ///
    /// - `response`: One-shot channel for acknowledging that the worker has
    ///   left its receive loop.
    Shutdown { response: oneshot::Sender<()> },
}

/// A message sent from a worker unit back to the dispatcher.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// The worker created its codec and is waiting for work.
    Ready { worker_id: usize },

    /// The worker could not create its codec and has exited.
    StartupFailed { worker_id: usize, reason: String },

    /// Exactly one per dispatched [`TaskEnvelope`].
    Completed {
        worker_id: usize,
        id: CorrelationId,
        outcome: Result<TranscodeResult, Error>,
    },

    /// The worker thread is exiting, normally or by panic.
    Exited { worker_id: usize, panicked: bool },
}
