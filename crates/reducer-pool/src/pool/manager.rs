//! Pool lifecycle.
//!
//! [`WorkerPool`] is the public face of the pool. It owns the target size,
//! allocates correlation ids and drives one dispatcher "generation" at a
//! time: a generation starts on the first [`WorkerPool::initialize`] (or
//! lazily on the first [`WorkerPool::submit`]) and ends on
//! [`WorkerPool::destroy`] or [`WorkerPool::terminate`], or when the
//! dispatcher loses its last worker and cannot replace it. A later submission
//! starts a fresh generation.
//!
//! Lifecycle operations (initialize, resize, destroy, terminate) are
//! serialized by an async gate. Submissions only take a read lock on the
//! current dispatcher handle, so they run concurrently with each other and
//! any submission that got its task to the dispatcher does so before a
//! destroy's drain request.

use crate::{
    config::PoolConfig,
    pool::{
        dispatcher::{Dispatcher, DispatcherHandle, PoolStats, SpawnReport},
        pending::PendingResponse,
        request::TaskEnvelope,
    },
    telemetry::increment_tasks_submitted,
};
use portable_atomic::{AtomicU64, AtomicUsize, Ordering};
use reducer_core::{
    CorrelationId, Error, TranscodeRequest,
    codec::{CodecFactory, ImageCodecFactory},
};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio_util::sync::CancellationToken;

struct Shared {
    config: PoolConfig,
    factory: Arc<dyn CodecFactory>,
    target: AtomicUsize,
    next_id: AtomicU64,
    live: Arc<AtomicUsize>,
    lifecycle: Mutex<()>,
    dispatcher: RwLock<Option<DispatcherHandle>>,
    cancel: parking_lot::Mutex<Option<CancellationToken>>,
}

/// A resizable pool of codec workers behind a FIFO task queue.
///
/// Cloning is cheap; clones share the same pool. When the last clone is
/// dropped the pool finishes accepted work and stops its workers in the
/// background.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<Shared>,
}

fn validate_count(count: usize) -> Result<(), Error> {
    if count == 0 {
        return Err(Error::InvalidArgument {
            reason: "worker count must be at least 1".to_string(),
        });
    }
    Ok(())
}

impl WorkerPool {
    /// Creates an uninitialized pool. No threads are started until the first
    /// [`initialize`](Self::initialize) or [`submit`](Self::submit).
    pub fn new(config: PoolConfig, factory: impl CodecFactory) -> Self {
        let target = config.num_workers.max(1);
        Self {
            shared: Arc::new(Shared {
                config,
                factory: Arc::new(factory),
                target: AtomicUsize::new(target),
                next_id: AtomicU64::new(0),
                live: Arc::new(AtomicUsize::new(0)),
                lifecycle: Mutex::new(()),
                dispatcher: RwLock::new(None),
                cancel: parking_lot::Mutex::new(None),
            }),
        }
    }

    /// Creates a pool whose workers each run an [`ImageCodec`](reducer_core::codec::ImageCodec).
    pub fn with_image_codec(config: PoolConfig) -> Self {
        Self::new(config, ImageCodecFactory::default())
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Target pool size: the workers the pool starts with or resizes to.
    pub fn worker_count(&self) -> usize {
        self.shared.target.load(Ordering::Relaxed)
    }

    /// Workers currently ready to take tasks, excluding ones still starting
    /// and ones being retired.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Relaxed)
    }

    pub async fn is_initialized(&self) -> bool {
        self.running_handle().await.is_some()
    }

    /// Handle of the current generation, unless its dispatcher has stopped.
    async fn running_handle(&self) -> Option<DispatcherHandle> {
        self.shared
            .dispatcher
            .read()
            .await
            .as_ref()
            .filter(|handle| !handle.is_closed())
            .cloned()
    }

    /// Starts `num_workers` workers and waits until each one is ready or has
    /// failed. Does nothing if the pool is already running.
    ///
    /// Workers that fail to create their codec are logged and left out.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `num_workers` is zero.
    /// - [`Error::WorkerStartup`] if not a single worker could start.
    pub async fn initialize(&self, num_workers: usize) -> Result<(), Error> {
        validate_count(num_workers)?;
        let _gate = self.shared.lifecycle.lock().await;
        if self.running_handle().await.is_some() {
            return Ok(());
        }
        self.start_locked(num_workers).await
    }

    /// Starts a new generation, replacing one whose dispatcher has stopped.
    /// The caller holds the lifecycle gate.
    async fn start_locked(&self, num_workers: usize) -> Result<(), Error> {
        let cancelled = CancellationToken::new();
        let handle = Dispatcher::start(
            self.shared.config.clone(),
            Arc::clone(&self.shared.factory),
            cancelled.clone(),
            Arc::clone(&self.shared.live),
        );

        let report = handle.spawn_workers(num_workers).await?;
        if report.started == 0 {
            cancelled.cancel();
            handle.closed().await;
            return Err(report.failures.into_iter().next().unwrap_or_else(|| {
                Error::WorkerStartup {
                    worker_id: 0,
                    reason: "no worker started".to_string(),
                }
            }));
        }
        log_spawn_report(&report, num_workers);

        self.shared.target.store(num_workers, Ordering::Relaxed);
        *self.shared.cancel.lock() = Some(cancelled);
        *self.shared.dispatcher.write().await = Some(handle);
        Ok(())
    }

    /// Grows or shrinks the pool to `count` workers.
    ///
    /// Growing waits until the new workers are ready. Shrinking retires idle
    /// workers first; busy ones finish their current task and are removed
    /// after, so no accepted task is lost. An uninitialized pool is
    /// initialized with `count` workers.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if `count` is zero.
    /// - [`Error::WorkerStartup`] if the pool had to be initialized and no
    ///   worker started.
    pub async fn set_worker_count(&self, count: usize) -> Result<(), Error> {
        validate_count(count)?;
        let _gate = self.shared.lifecycle.lock().await;
        self.shared.target.store(count, Ordering::Relaxed);

        let Some(handle) = self.running_handle().await else {
            return self.start_locked(count).await;
        };

        let stats = handle.stats().await?;
        let current = stats.workers + stats.starting;

        #[cfg(feature = "tracing")]
        tracing::info!("Resizing worker pool from {current} to {count} workers");

        match count.cmp(&current) {
            core::cmp::Ordering::Equal => Ok(()),
            core::cmp::Ordering::Greater => {
                let report = handle.spawn_workers(count - current).await?;
                log_spawn_report(&report, count - current);
                Ok(())
            }
            core::cmp::Ordering::Less => handle.retire_workers(current - count).await,
        }
    }

    /// Queues `request` and returns a handle that resolves with its result.
    ///
    /// The request is validated first; an invalid one never reaches a worker.
    /// Submitting to an uninitialized pool, or one that lost all of its
    /// workers, initializes it with [`worker_count`](Self::worker_count)
    /// workers. Tasks are dispatched in submission order. When the queue is
    /// full this waits for room.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidArgument`] if the request is invalid.
    /// - [`Error::WorkerStartup`] if lazy initialization fails.
    pub async fn submit(&self, mut request: TranscodeRequest) -> Result<PendingResponse, Error> {
        request.validate()?;

        loop {
            {
                let dispatcher = self.shared.dispatcher.read().await;
                if let Some(handle) = dispatcher.as_ref().filter(|h| !h.is_closed()) {
                    let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
                    let id = CorrelationId::new(id);
                    let (slot, rx) = oneshot::channel();
                    match handle.submit(TaskEnvelope::new(id, request), slot).await {
                        Ok(()) => {
                            increment_tasks_submitted();
                            return Ok(PendingResponse::new(id, rx));
                        }
                        // The generation ended while we waited for room.
                        Err(envelope) => request = envelope.request,
                    }
                }
            }
            self.initialize(self.worker_count()).await?;
        }
    }

    /// Submits `request` and waits for its result.
    ///
    /// # Errors
    ///
    /// Any error from [`submit`](Self::submit) or from the task itself.
    pub async fn transcode(
        &self,
        request: TranscodeRequest,
    ) -> Result<reducer_core::TranscodeResult, Error> {
        self.submit(request).await?.await
    }

    /// Snapshot of queue and worker counters. All zero when uninitialized.
    pub async fn stats(&self) -> PoolStats {
        let handle = self.shared.dispatcher.read().await.clone();
        match handle {
            Some(handle) => handle.stats().await.unwrap_or_default(),
            None => PoolStats::default(),
        }
    }

    /// Graceful teardown: waits for every accepted task to resolve, then stops
    /// all workers (waiting up to the configured shutdown timeout for each).
    ///
    /// The pool can be used again afterwards; the next submission starts a
    /// new set of workers.
    pub async fn destroy(&self) {
        let _gate = self.shared.lifecycle.lock().await;
        let handle = self.shared.dispatcher.write().await.take();
        let Some(handle) = handle else {
            return;
        };

        handle.drain().await;
        self.shared.cancel.lock().take();

        #[cfg(feature = "tracing")]
        tracing::info!("Worker pool destroyed");
    }

    /// Forced teardown: every queued and in-flight task resolves with
    /// [`Error::PoolShutdown`] and workers are told to stop without waiting
    /// for their current task to be reported.
    ///
    /// Interrupts a [`destroy`](Self::destroy) that is still draining.
    pub async fn terminate(&self) {
        let token = self.shared.cancel.lock().clone();
        if let Some(token) = token {
            token.cancel();
        }

        let _gate = self.shared.lifecycle.lock().await;
        let handle = self.shared.dispatcher.write().await.take();
        let token = self.shared.cancel.lock().take();
        if let Some(token) = token {
            token.cancel();
        }
        if let Some(handle) = handle {
            handle.closed().await;

            #[cfg(feature = "tracing")]
            tracing::warn!("Worker pool terminated");
        }
    }
}

fn log_spawn_report(report: &SpawnReport, requested: usize) {
    #[cfg(feature = "tracing")]
    {
        if report.failures.is_empty() {
            tracing::info!("Started {} workers", report.started);
        } else {
            tracing::warn!(
                "Started {}/{requested} workers; {} failed",
                report.started,
                report.failures.len()
            );
        }
    }
    #[cfg(not(feature = "tracing"))]
    let _ = (report, requested);
}
