use core::{
    future::Future,
    pin::Pin,
    task::{Context, Poll, ready},
};
use pin_project_lite::pin_project;
use reducer_core::{CorrelationId, Error, TranscodeResult};
use tokio::sync::oneshot;

pin_project! {
    /// Single-resolution handle for a submitted task.
    ///
    /// Resolves exactly once, with the [`TranscodeResult`] or the [`Error`]
    /// recorded by the dispatcher. Dropping it abandons the task: a queued
    /// task is discarded before dispatch, a dispatched one still runs and its
    /// response is dropped.
    ///
    /// There is no built-in deadline. Race it against a timer (for example
    /// with [`tokio::time::timeout`]) to impose one; the worker keeps running
    /// the task either way.
    #[must_use = "dropping a PendingResponse abandons the task"]
    #[derive(Debug)]
    pub struct PendingResponse {
        id: CorrelationId,
        #[pin]
        rx: oneshot::Receiver<Result<TranscodeResult, Error>>,
    }
}

impl PendingResponse {
    pub(crate) const fn new(
        id: CorrelationId,
        rx: oneshot::Receiver<Result<TranscodeResult, Error>>,
    ) -> Self {
        Self { id, rx }
    }

    /// Correlation id assigned to the task at submission.
    pub const fn id(&self) -> CorrelationId {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<TranscodeResult, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match ready!(this.rx.poll(cx)) {
            Ok(outcome) => Poll::Ready(outcome),
            // The dispatcher went away without recording an outcome.
            Err(_) => Poll::Ready(Err(Error::ChannelError {
                context: format!("task {} was dropped without a response", this.id),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn resolves_with_sent_outcome() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingResponse::new(CorrelationId::new(3), rx);
        assert_eq!(pending.id(), CorrelationId::new(3));

        let result = TranscodeResult {
            data: Bytes::from_static(b"ok"),
            original_width: 2,
            original_height: 2,
            output_width: 1,
            output_height: 1,
        };
        tx.send(Ok(result.clone())).unwrap();
        assert_eq!(pending.await, Ok(result));
    }

    #[tokio::test]
    async fn dropped_sender_is_a_channel_error() {
        let (tx, rx) = oneshot::channel();
        let pending = PendingResponse::new(CorrelationId::new(4), rx);
        drop(tx);
        assert!(matches!(pending.await, Err(Error::ChannelError { .. })));
    }
}
