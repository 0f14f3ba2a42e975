use crate::{
    config::PoolConfig,
    pool::request::{WorkRequest, WorkerEvent},
    telemetry::record_transcode_duration,
};
use reducer_core::{
    Error,
    codec::{Codec, CodecFactory, transcode},
};
use std::{sync::Arc, thread, time::Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Dispatcher-side endpoint of a running worker unit.
pub(crate) struct WorkerHandle {
    pub id: usize,
    pub tx: mpsc::Sender<WorkRequest>,
}

/// Starts worker unit `worker_id` on its own OS thread.
///
/// The worker creates its codec on the new thread and reports
/// [`WorkerEvent::Ready`] or [`WorkerEvent::StartupFailed`] over `events`.
/// Until it is ready the dispatcher must not send it work.
///
/// # Errors
///
/// Returns [`Error::WorkerStartup`] if the thread cannot be spawned.
pub(crate) fn spawn_worker(
    worker_id: usize,
    factory: Arc<dyn CodecFactory>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancelled: CancellationToken,
    config: &PoolConfig,
) -> Result<WorkerHandle, Error> {
    // Capacity 1: the dispatcher only sends a worker its next task once the
    // previous response was recorded, so a single slot always suffices.
    let (tx, rx) = mpsc::channel(1);

    let mut builder = thread::Builder::new().name(format!("{}-{worker_id}", config.thread_name));
    if let Some(stack_size) = config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    builder
        .spawn(move || worker_main(worker_id, rx, &*factory, events, &cancelled))
        .map_err(|e| Error::WorkerStartup {
            worker_id,
            reason: e.to_string(),
        })?;

    Ok(WorkerHandle { id: worker_id, tx })
}

/// Reports [`WorkerEvent::Exited`] when the worker thread unwinds or returns.
struct ExitGuard {
    worker_id: usize,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let _ = self.events.send(WorkerEvent::Exited {
            worker_id: self.worker_id,
            panicked: thread::panicking(),
        });
    }
}

fn worker_main(
    worker_id: usize,
    rx: mpsc::Receiver<WorkRequest>,
    factory: &dyn CodecFactory,
    events: mpsc::UnboundedSender<WorkerEvent>,
    cancelled: &CancellationToken,
) {
    let _exit = ExitGuard {
        worker_id,
        events: events.clone(),
    };

    let mut codec = match factory.create(worker_id) {
        Ok(codec) => codec,
        Err(e) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {worker_id} failed to create codec: {e}");
            let _ = events.send(WorkerEvent::StartupFailed {
                worker_id,
                reason: e.to_string(),
            });
            return;
        }
    };

    if events.send(WorkerEvent::Ready { worker_id }).is_err() {
        return;
    }

    worker_loop(worker_id, rx, codec.as_mut(), &events, cancelled);
}

/// Receive loop of a worker unit.
///
/// Blocks for one [`WorkRequest`] at a time and processes it to completion
/// before receiving the next one. Runs until a shutdown request arrives, the
/// request channel closes, or the dispatcher stops listening for events.
///
/// # Request Types
///
/// - [`WorkRequest::Transcode`] - Runs the codec adapter and answers with one
///   [`WorkerEvent::Completed`]. If the pool was force-terminated the task is
///   answered with [`Error::PoolShutdown`] without touching the codec.
/// - [`WorkRequest::Shutdown`] - Acknowledges and stops the worker.
pub(crate) fn worker_loop(
    worker_id: usize,
    mut rx: mpsc::Receiver<WorkRequest>,
    codec: &mut dyn Codec,
    events: &mpsc::UnboundedSender<WorkerEvent>,
    cancelled: &CancellationToken,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    while let Some(work) = rx.blocking_recv() {
        match work {
            WorkRequest::Transcode(envelope) => {
                let outcome = if cancelled.is_cancelled() {
                    Err(Error::PoolShutdown)
                } else {
                    let started = Instant::now();
                    let outcome = transcode(codec, &envelope.request);
                    record_transcode_duration(started.elapsed().as_secs_f64() * 1000.0);
                    outcome
                };

                #[cfg(feature = "tracing")]
                tracing::trace!(
                    "Worker {worker_id} finished task {} after {:?}",
                    envelope.id,
                    envelope.submitted_at.elapsed()
                );

                let event = WorkerEvent::Completed {
                    worker_id,
                    id: envelope.id,
                    outcome,
                };
                if events.send(event).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker {worker_id} lost its dispatcher, exiting");
                    break;
                }
            }
            WorkRequest::Shutdown { response } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");

                if response.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Worker {worker_id} failed to acknowledge shutdown");
                }
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}
