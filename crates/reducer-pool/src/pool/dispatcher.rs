//! Task queue and dispatcher.
//!
//! The [`Dispatcher`] is a single Tokio task that exclusively owns the FIFO of
//! queued tasks, the correlation table of in-flight tasks and the membership
//! of the worker set. Everything else talks to it through messages: the pool
//! manager over a bounded [`Command`] channel, worker units over an unbounded
//! [`WorkerEvent`] channel (each worker has at most one event outstanding, so
//! it cannot grow past the worker count).
//!
//! Because only this task mutates its state, no locks are involved and every
//! transition (dispatch, response, retirement, crash) is atomic with respect
//! to the others.

use crate::{
    config::PoolConfig,
    pool::{
        request::{ResponseSlot, TaskEnvelope, WorkRequest, WorkerEvent},
        worker::{WorkerHandle, spawn_worker},
    },
    telemetry::{
        decrement_tasks_inflight, increment_tasks_failed, increment_tasks_inflight,
        record_queue_wait,
    },
};
use core::{cmp::Reverse, time::Duration};
use portable_atomic::{AtomicUsize, Ordering};
use reducer_core::{CorrelationId, Error, codec::CodecFactory};
use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Requests from the pool manager to the dispatcher.
pub(crate) enum Command {
    /// Queue a task and dispatch it as soon as a worker is idle.
    Submit {
        envelope: TaskEnvelope,
        slot: ResponseSlot,
    },
    /// Start `count` workers; answered once each one is ready or failed.
    Spawn {
        count: usize,
        done: oneshot::Sender<SpawnReport>,
    },
    /// Remove `count` workers; answered once all of them have stopped.
    Retire {
        count: usize,
        done: oneshot::Sender<()>,
    },
    /// Finish all queued and in-flight work, then stop every worker.
    Drain { done: oneshot::Sender<()> },
    Stats { reply: oneshot::Sender<PoolStats> },
}

/// Outcome of a [`Command::Spawn`].
#[derive(Debug, Default)]
pub(crate) struct SpawnReport {
    pub started: usize,
    pub failures: Vec<Error>,
}

/// Point-in-time view of the pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Ready workers that accept new tasks (idle + busy, excluding retiring).
    pub workers: usize,
    pub idle: usize,
    pub busy: usize,
    /// Workers still creating their codec.
    pub starting: usize,
    /// Workers finishing their last task before removal.
    pub retiring: usize,
    /// Tasks waiting for an idle worker.
    pub queued: usize,
    /// Tasks dispatched and awaiting a response.
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    /// Time since the least recently active worker last reported in.
    pub stalest_heartbeat: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Idle,
    Busy(CorrelationId),
}

struct WorkerSlot {
    handle: WorkerHandle,
    state: WorkerState,
    retiring: bool,
    last_heartbeat: Instant,
}

struct Queued {
    envelope: TaskEnvelope,
    slot: ResponseSlot,
}

struct InFlight {
    slot: ResponseSlot,
    worker_id: usize,
}

struct SpawnBatch {
    waiting: HashSet<usize>,
    report: SpawnReport,
    done: oneshot::Sender<SpawnReport>,
}

/// Manager-side endpoint of a running [`Dispatcher`].
#[derive(Clone)]
pub(crate) struct DispatcherHandle {
    commands: mpsc::Sender<Command>,
}

fn dispatcher_stopped() -> Error {
    Error::ChannelError {
        context: "dispatcher has stopped".to_string(),
    }
}

impl DispatcherHandle {
    /// Queues a task. Hands the envelope back if the dispatcher has stopped.
    pub async fn submit(
        &self,
        envelope: TaskEnvelope,
        slot: ResponseSlot,
    ) -> Result<(), TaskEnvelope> {
        let sent = self.commands.send(Command::Submit { envelope, slot }).await;
        if let Err(mpsc::error::SendError(Command::Submit { envelope, .. })) = sent {
            return Err(envelope);
        }
        Ok(())
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| dispatcher_stopped())?;
        rx.await.map_err(|_| dispatcher_stopped())
    }

    pub async fn spawn_workers(&self, count: usize) -> Result<SpawnReport, Error> {
        self.call(|done| Command::Spawn { count, done }).await
    }

    pub async fn retire_workers(&self, count: usize) -> Result<(), Error> {
        self.call(|done| Command::Retire { count, done }).await
    }

    pub async fn stats(&self) -> Result<PoolStats, Error> {
        self.call(|reply| Command::Stats { reply }).await
    }

    /// Waits for all work to finish and every worker to stop, then for the
    /// dispatcher task to exit.
    pub async fn drain(&self) {
        if let Err(_e) = self.call(|done| Command::Drain { done }).await {
            #[cfg(feature = "tracing")]
            tracing::debug!("Drain request not acknowledged: {_e}");
        }
        self.closed().await;
    }

    /// Resolves once the dispatcher task has exited.
    pub async fn closed(&self) {
        self.commands.closed().await;
    }

    /// True once the dispatcher task has exited, whether it was torn down or
    /// ran out of workers.
    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

/// Single owner of the queue, the correlation table and the worker set.
pub(crate) struct Dispatcher {
    config: PoolConfig,
    factory: Arc<dyn CodecFactory>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    cancelled: CancellationToken,
    live: Arc<AtomicUsize>,
    workers: BTreeMap<usize, WorkerSlot>,
    queue: VecDeque<Queued>,
    in_flight: HashMap<CorrelationId, InFlight>,
    next_worker_id: usize,
    spawning: Option<SpawnBatch>,
    retire_waiter: Option<oneshot::Sender<()>>,
    drain_waiters: Vec<oneshot::Sender<()>>,
    draining: bool,
    commands_closed: bool,
    stopped: bool,
    /// Most recent codec startup failure, reported if the worker set empties.
    last_startup_failure: Option<Error>,
    /// Outcome for submissions that arrive after the dispatcher stopped.
    exit_error: Error,
    completed: u64,
    failed: u64,
}

impl Dispatcher {
    /// Spawns a dispatcher task with no workers and returns its handle.
    ///
    /// Cancelling `cancelled` force-terminates the dispatcher. `live` is kept
    /// up to date with the number of ready, non-retiring workers.
    pub fn start(
        config: PoolConfig,
        factory: Arc<dyn CodecFactory>,
        cancelled: CancellationToken,
        live: Arc<AtomicUsize>,
    ) -> DispatcherHandle {
        let (commands_tx, commands_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (dispatcher, events_rx) = Self::new(config, factory, cancelled, live);
        tokio::spawn(dispatcher.run(commands_rx, events_rx));

        DispatcherHandle {
            commands: commands_tx,
        }
    }

    fn new(
        config: PoolConfig,
        factory: Arc<dyn CodecFactory>,
        cancelled: CancellationToken,
        live: Arc<AtomicUsize>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            config,
            factory,
            events_tx,
            cancelled,
            live,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            next_worker_id: 0,
            spawning: None,
            retire_waiter: None,
            drain_waiters: Vec::new(),
            draining: false,
            commands_closed: false,
            stopped: false,
            last_startup_failure: None,
            exit_error: Error::PoolShutdown,
            completed: 0,
            failed: 0,
        };
        (dispatcher, events_rx)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    ) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatcher started");

        let cancelled = self.cancelled.clone();
        while !self.stopped {
            tokio::select! {
                biased;
                () = cancelled.cancelled() => self.terminate(),
                Some(event) = events.recv() => self.on_event(event),
                command = commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        // Every manager handle is gone; finish what was accepted.
                        self.commands_closed = true;
                        self.begin_drain(None);
                    }
                },
            }
        }

        // Reject submissions that raced with the stop instead of dropping them.
        commands.close();
        while let Ok(command) = commands.try_recv() {
            if let Command::Submit { slot, .. } = command {
                let _ = slot.send(Err(self.exit_error.clone()));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Dispatcher stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit { envelope, slot } => {
                self.queue.push_back(Queued { envelope, slot });
                self.pump();
            }
            Command::Spawn { count, done } => self.spawn_batch(count, done),
            Command::Retire { count, done } => self.retire(count, done),
            Command::Drain { done } => self.begin_drain(Some(done)),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
        self.check_exhausted();
    }

    fn on_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Ready { worker_id } => {
                if let Some(worker) = self.workers.get_mut(&worker_id) {
                    worker.state = WorkerState::Idle;
                    worker.last_heartbeat = Instant::now();

                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {worker_id} ready");
                }
                if let Some(batch) = self.spawning.as_mut() {
                    if batch.waiting.remove(&worker_id) {
                        batch.report.started += 1;
                    }
                }
                self.settle_spawn_batch();
                self.pump();
            }
            WorkerEvent::StartupFailed { worker_id, reason } => {
                self.workers.remove(&worker_id);
                let error = Error::WorkerStartup { worker_id, reason };

                #[cfg(feature = "tracing")]
                tracing::warn!("Excluding worker from pool: {error}");

                if let Some(batch) = self.spawning.as_mut() {
                    if batch.waiting.remove(&worker_id) {
                        batch.report.failures.push(error.clone());
                    }
                }
                self.last_startup_failure = Some(error);
                self.settle_spawn_batch();
            }
            WorkerEvent::Completed {
                worker_id,
                id,
                outcome,
            } => self.on_response(worker_id, id, outcome),
            WorkerEvent::Exited {
                worker_id,
                panicked,
            } => self.on_exit(worker_id, panicked),
        }

        self.publish();
        self.check_drained();
        self.check_exhausted();
    }

    /// Records a worker's response and hands the worker its next task.
    ///
    /// Only a response from the worker the task was dispatched to counts.
    /// Anything else (an unknown, already resolved or misattributed id) is
    /// logged and ignored.
    fn on_response(
        &mut self,
        worker_id: usize,
        id: CorrelationId,
        outcome: Result<reducer_core::TranscodeResult, Error>,
    ) {
        let owned = self.in_flight.get(&id).is_some_and(|task| task.worker_id == worker_id);
        let worker = match self.workers.get_mut(&worker_id) {
            Some(worker) if owned && worker.state == WorkerState::Busy(id) => worker,
            _ => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Dropping unmatched response for task {id} from worker {worker_id}");
                return;
            }
        };
        worker.state = WorkerState::Idle;
        worker.last_heartbeat = Instant::now();
        let retire = worker.retiring;

        if let Some(task) = self.in_flight.remove(&id) {
            decrement_tasks_inflight();
            if outcome.is_ok() {
                self.completed += 1;
            } else {
                self.failed += 1;
                increment_tasks_failed();
            }
            if task.slot.send(outcome).is_err() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Caller of task {id} stopped waiting, response discarded");
            }
        }

        if retire {
            let _ = self.stop_worker(worker_id);
            self.settle_retirement();
        }
        self.pump();
    }

    /// Handles a worker thread exit. Workers removed by the dispatcher are
    /// expected to exit; any other exit is a crash.
    fn on_exit(&mut self, worker_id: usize, panicked: bool) {
        let Some(worker) = self.workers.remove(&worker_id) else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::error!("Worker {worker_id} exited unexpectedly (panicked: {panicked})");
        #[cfg(not(feature = "tracing"))]
        let _ = panicked;

        match worker.state {
            WorkerState::Busy(id) => {
                if let Some(task) = self.in_flight.remove(&id) {
                    decrement_tasks_inflight();
                    increment_tasks_failed();
                    self.failed += 1;
                    let _ = task.slot.send(Err(Error::WorkerLost { worker_id }));
                }
            }
            WorkerState::Starting => {
                if let Some(batch) = self.spawning.as_mut() {
                    if batch.waiting.remove(&worker_id) {
                        batch.report.failures.push(Error::WorkerStartup {
                            worker_id,
                            reason: "worker exited during startup".to_string(),
                        });
                    }
                }
                self.settle_spawn_batch();
                return;
            }
            WorkerState::Idle => {}
        }

        if worker.retiring {
            self.settle_retirement();
        } else if !self.draining {
            self.replace_worker();
        }
        self.pump();
    }

    /// Dispatches queued tasks, oldest first, to the lowest-numbered idle
    /// workers until either runs out.
    fn pump(&mut self) {
        while !self.queue.is_empty() {
            let Some(worker_id) = self.next_idle_worker() else {
                break;
            };
            let Some(Queued { envelope, slot }) = self.queue.pop_front() else {
                break;
            };

            if slot.is_closed() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Discarding task {} abandoned before dispatch", envelope.id);
                continue;
            }

            let id = envelope.id;
            let submitted_at = envelope.submitted_at;
            let Some(worker) = self.workers.get_mut(&worker_id) else {
                break;
            };

            match worker.handle.tx.try_send(WorkRequest::Transcode(envelope)) {
                Ok(()) => {
                    worker.state = WorkerState::Busy(id);
                    self.in_flight.insert(id, InFlight { slot, worker_id });
                    increment_tasks_inflight();
                    record_queue_wait(submitted_at.elapsed().as_secs_f64() * 1000.0);

                    #[cfg(feature = "tracing")]
                    tracing::trace!("Dispatched task {id} to worker {worker_id}");
                }
                Err(err) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Worker {worker_id} rejected task {id}: {err}");

                    // Put the task back at the head of the queue and swap the
                    // unreachable worker for a fresh one.
                    if let WorkRequest::Transcode(envelope) = err.into_inner() {
                        self.queue.push_front(Queued { envelope, slot });
                    }
                    self.workers.remove(&worker_id);
                    if !self.draining {
                        self.replace_worker();
                    }
                }
            }
        }
    }

    fn next_idle_worker(&self) -> Option<usize> {
        self.workers
            .iter()
            .find(|(_, w)| w.state == WorkerState::Idle && !w.retiring)
            .map(|(id, _)| *id)
    }

    fn spawn_one(&mut self) -> Result<usize, Error> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        let handle = spawn_worker(
            worker_id,
            Arc::clone(&self.factory),
            self.events_tx.clone(),
            self.cancelled.clone(),
            &self.config,
        )?;
        self.workers.insert(
            worker_id,
            WorkerSlot {
                handle,
                state: WorkerState::Starting,
                retiring: false,
                last_heartbeat: Instant::now(),
            },
        );
        Ok(worker_id)
    }

    fn replace_worker(&mut self) {
        match self.spawn_one() {
            Ok(_worker_id) => {
                #[cfg(feature = "tracing")]
                tracing::info!("Spawned replacement worker {_worker_id}");
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to replace worker: {_e}");
            }
        }
    }

    fn spawn_batch(&mut self, count: usize, done: oneshot::Sender<SpawnReport>) {
        debug_assert!(self.spawning.is_none(), "spawn batches are serialized");

        let mut batch = SpawnBatch {
            waiting: HashSet::with_capacity(count),
            report: SpawnReport::default(),
            done,
        };
        for _ in 0..count {
            match self.spawn_one() {
                Ok(worker_id) => {
                    batch.waiting.insert(worker_id);
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!("Excluding worker from pool: {e}");
                    batch.report.failures.push(e);
                }
            }
        }

        self.spawning = Some(batch);
        self.settle_spawn_batch();
    }

    fn settle_spawn_batch(&mut self) {
        if self.spawning.as_ref().is_some_and(|b| b.waiting.is_empty()) {
            self.publish();
            if let Some(batch) = self.spawning.take() {
                let _ = batch.done.send(batch.report);
            }
        }
    }

    /// Marks `count` workers for removal: idle ones first, then starting
    /// ones, then busy ones, which leave after their current task.
    fn retire(&mut self, count: usize, done: oneshot::Sender<()>) {
        let mut candidates: Vec<(u8, Reverse<usize>)> = self
            .workers
            .iter()
            .filter(|(_, w)| !w.retiring)
            .map(|(id, w)| {
                let rank = match w.state {
                    WorkerState::Idle => 0,
                    WorkerState::Starting => 1,
                    WorkerState::Busy(_) => 2,
                };
                (rank, Reverse(*id))
            })
            .collect();
        candidates.sort_unstable();

        for (_, Reverse(worker_id)) in candidates.into_iter().take(count) {
            let Some(worker) = self.workers.get_mut(&worker_id) else {
                continue;
            };
            worker.retiring = true;
            if !matches!(worker.state, WorkerState::Busy(_)) {
                let _ = self.stop_worker(worker_id);
            }

            #[cfg(feature = "tracing")]
            tracing::debug!("Retiring worker {worker_id}");
        }

        self.retire_waiter = Some(done);
        self.settle_retirement();
        self.publish();
    }

    fn settle_retirement(&mut self) {
        if self.workers.values().any(|w| w.retiring) {
            return;
        }
        self.publish();
        if let Some(done) = self.retire_waiter.take() {
            let _ = done.send(());
        }
    }

    /// Removes a worker and asks it to exit after its current task.
    ///
    /// Returns the acknowledgement receiver if the request was delivered.
    fn stop_worker(&mut self, worker_id: usize) -> Option<(usize, oneshot::Receiver<()>)> {
        let worker = self.workers.remove(&worker_id)?;
        let (tx, rx) = oneshot::channel();

        match worker.handle.tx.try_send(WorkRequest::Shutdown { response: tx }) {
            Ok(()) => Some((worker.handle.id, rx)),
            Err(_e) => {
                // Dropping the sender closes the channel, which also ends the
                // worker's receive loop.
                #[cfg(feature = "tracing")]
                tracing::debug!("Failed to send shutdown to worker {worker_id}: {_e}");
                None
            }
        }
    }

    fn begin_drain(&mut self, done: Option<oneshot::Sender<()>>) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Draining worker pool ({} queued, {} in flight)",
            self.queue.len(),
            self.in_flight.len()
        );

        self.draining = true;
        self.drain_waiters.extend(done);
        self.check_drained();
    }

    /// Stops every worker once a drain was requested and no work remains.
    fn check_drained(&mut self) {
        if !self.draining || self.stopped || !self.in_flight.is_empty() {
            return;
        }
        if !self.queue.is_empty() {
            if !self.workers.is_empty() {
                return;
            }
            // Nobody is left to run these.
            for Queued { slot, .. } in self.queue.drain(..) {
                let _ = slot.send(Err(Error::PoolShutdown));
            }
        }

        let worker_ids: Vec<usize> = self.workers.keys().copied().collect();
        let acks: Vec<_> = worker_ids
            .into_iter()
            .filter_map(|worker_id| self.stop_worker(worker_id))
            .collect();
        let waiters = core::mem::take(&mut self.drain_waiters);
        let limit = self.config.shutdown_timeout;

        tokio::spawn(async move {
            await_acknowledgements(acks, limit).await;
            for waiter in waiters {
                let _ = waiter.send(());
            }
        });

        self.finish();
    }

    /// Ends the generation once no worker is running or starting and none is
    /// on its way through a spawn batch. Queued tasks are rejected with the
    /// last startup failure; the pool manager starts a fresh generation on
    /// the next submission.
    fn check_exhausted(&mut self) {
        if self.stopped || self.draining || self.spawning.is_some() || !self.workers.is_empty() {
            return;
        }

        let error = self
            .last_startup_failure
            .take()
            .unwrap_or_else(|| Error::WorkerStartup {
                worker_id: self.next_worker_id,
                reason: "no worker left to replace the lost ones".to_string(),
            });

        #[cfg(feature = "tracing")]
        tracing::error!(
            "Worker pool has no workers left, rejecting {} queued tasks: {error}",
            self.queue.len()
        );

        for Queued { slot, .. } in self.queue.drain(..) {
            let _ = slot.send(Err(error.clone()));
        }
        for (_, task) in self.in_flight.drain() {
            decrement_tasks_inflight();
            increment_tasks_failed();
            self.failed += 1;
            let _ = task.slot.send(Err(error.clone()));
        }
        self.exit_error = error;
        self.finish();
    }

    /// Forced teardown: rejects everything outstanding and stops workers
    /// without waiting for their current task.
    fn terminate(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Force-terminating worker pool ({} queued, {} in flight)",
            self.queue.len(),
            self.in_flight.len()
        );

        for Queued { slot, .. } in self.queue.drain(..) {
            let _ = slot.send(Err(Error::PoolShutdown));
        }
        for (_, task) in self.in_flight.drain() {
            decrement_tasks_inflight();
            increment_tasks_failed();
            self.failed += 1;
            let _ = task.slot.send(Err(Error::PoolShutdown));
        }

        let worker_ids: Vec<usize> = self.workers.keys().copied().collect();
        for worker_id in worker_ids {
            let _ = self.stop_worker(worker_id);
        }

        for waiter in self.drain_waiters.drain(..) {
            let _ = waiter.send(());
        }
        if let Some(done) = self.retire_waiter.take() {
            let _ = done.send(());
        }
        if let Some(batch) = self.spawning.take() {
            let _ = batch.done.send(batch.report);
        }

        self.finish();
    }

    fn finish(&mut self) {
        self.stopped = true;
        self.workers.clear();
        self.live.store(0, Ordering::Relaxed);
    }

    fn publish(&self) {
        if self.stopped {
            return;
        }
        let live = self
            .workers
            .values()
            .filter(|w| !w.retiring && w.state != WorkerState::Starting)
            .count();
        self.live.store(live, Ordering::Relaxed);
    }

    fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            queued: self.queue.len(),
            in_flight: self.in_flight.len(),
            completed: self.completed,
            failed: self.failed,
            ..PoolStats::default()
        };
        for worker in self.workers.values() {
            if worker.retiring {
                stats.retiring += 1;
                continue;
            }
            match worker.state {
                WorkerState::Starting => stats.starting += 1,
                WorkerState::Idle => stats.idle += 1,
                WorkerState::Busy(_) => stats.busy += 1,
            }
        }
        stats.workers = stats.idle + stats.busy;
        stats.stalest_heartbeat = self
            .workers
            .values()
            .map(|w| w.last_heartbeat)
            .min()
            .map(|at| at.elapsed());

        stats
    }
}

/// Waits (up to `limit` per worker) for shutdown acknowledgements.
async fn await_acknowledgements(acks: Vec<(usize, oneshot::Receiver<()>)>, limit: Duration) {
    let waits = acks.into_iter().map(|(_worker_id, rx)| async move {
        match timeout(limit, rx).await {
            Ok(Ok(())) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Worker {_worker_id} shutdown acknowledged");
            }
            Ok(Err(_e)) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Worker {_worker_id} dropped its acknowledgement: {_e}");
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Worker {_worker_id} shutdown timed out");
            }
        }
    });

    futures::future::join_all(waits).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use reducer_core::{OutputFormat, TranscodeRequest, TranscodeResult, codec::ImageCodecFactory};

    fn dispatcher() -> Dispatcher {
        let (dispatcher, _events) = Dispatcher::new(
            PoolConfig::default(),
            Arc::new(ImageCodecFactory::default()),
            CancellationToken::new(),
            Arc::new(AtomicUsize::new(0)),
        );
        dispatcher
    }

    /// Registers an idle worker whose requests land in the returned receiver.
    fn idle_worker(
        dispatcher: &mut Dispatcher,
        worker_id: usize,
    ) -> mpsc::Receiver<WorkRequest> {
        let (tx, rx) = mpsc::channel(1);
        dispatcher.workers.insert(
            worker_id,
            WorkerSlot {
                handle: WorkerHandle { id: worker_id, tx },
                state: WorkerState::Idle,
                retiring: false,
                last_heartbeat: Instant::now(),
            },
        );
        rx
    }

    fn submit(
        dispatcher: &mut Dispatcher,
        id: u64,
    ) -> oneshot::Receiver<Result<TranscodeResult, Error>> {
        let (slot, rx) = oneshot::channel();
        let request = TranscodeRequest::new(vec![1_u8, 2, 3], OutputFormat::Webp, 80);
        dispatcher.on_command(Command::Submit {
            envelope: TaskEnvelope::new(CorrelationId::new(id), request),
            slot,
        });
        rx
    }

    fn completed(worker_id: usize, id: u64) -> WorkerEvent {
        WorkerEvent::Completed {
            worker_id,
            id: CorrelationId::new(id),
            outcome: Ok(TranscodeResult {
                data: Bytes::from_static(b"done"),
                original_width: 4,
                original_height: 4,
                output_width: 2,
                output_height: 2,
            }),
        }
    }

    fn dispatched_id(rx: &mut mpsc::Receiver<WorkRequest>) -> CorrelationId {
        match rx.try_recv() {
            Ok(WorkRequest::Transcode(envelope)) => envelope.id,
            other => panic!("expected a transcode request, got {other:?}"),
        }
    }

    /// Stats without the time-dependent heartbeat.
    fn counters(dispatcher: &Dispatcher) -> PoolStats {
        PoolStats {
            stalest_heartbeat: None,
            ..dispatcher.stats()
        }
    }

    #[tokio::test]
    async fn stray_responses_leave_state_untouched() {
        let mut dispatcher = dispatcher();
        let mut first = idle_worker(&mut dispatcher, 0);
        let _second = idle_worker(&mut dispatcher, 1);

        let mut slot = submit(&mut dispatcher, 0);
        assert_eq!(dispatched_id(&mut first), CorrelationId::new(0));
        let before = counters(&dispatcher);
        assert_eq!((before.busy, before.idle, before.in_flight), (1, 1, 1));

        // Unknown id.
        dispatcher.on_event(completed(0, 42));
        assert_eq!(counters(&dispatcher), before);
        // Known id reported by a worker it was never dispatched to.
        dispatcher.on_event(completed(1, 0));
        assert_eq!(counters(&dispatcher), before);
        assert!(slot.try_recv().is_err());

        dispatcher.on_event(completed(0, 0));
        assert_eq!(slot.await.unwrap().unwrap().data.as_ref(), b"done");
        let after = counters(&dispatcher);
        assert_eq!((after.idle, after.in_flight, after.completed), (2, 0, 1));

        // Already resolved.
        dispatcher.on_event(completed(0, 0));
        assert_eq!(counters(&dispatcher), after);
    }

    #[tokio::test]
    async fn dispatch_continues_after_stray_responses() {
        let mut dispatcher = dispatcher();
        let mut worker = idle_worker(&mut dispatcher, 0);

        dispatcher.on_event(completed(0, 7));
        dispatcher.on_event(completed(3, 8));

        let slot = submit(&mut dispatcher, 1);
        assert_eq!(dispatched_id(&mut worker), CorrelationId::new(1));
        dispatcher.on_event(completed(0, 1));
        assert!(slot.await.unwrap().is_ok());

        let slot = submit(&mut dispatcher, 2);
        assert_eq!(dispatched_id(&mut worker), CorrelationId::new(2));
        dispatcher.on_event(completed(0, 2));
        assert!(slot.await.unwrap().is_ok());

        let stats = counters(&dispatcher);
        assert_eq!((stats.completed, stats.failed, stats.in_flight), (2, 0, 0));
        assert!(!dispatcher.stopped);
    }

    #[tokio::test]
    async fn losing_the_last_worker_rejects_queued_tasks() {
        let mut dispatcher = dispatcher();
        let _worker = idle_worker(&mut dispatcher, 0);
        let _busy = submit(&mut dispatcher, 0);
        let queued = submit(&mut dispatcher, 1);

        dispatcher.workers.remove(&0);
        dispatcher.in_flight.clear();
        dispatcher.on_event(WorkerEvent::StartupFailed {
            worker_id: 1,
            reason: "no codec".to_string(),
        });

        assert!(dispatcher.stopped);
        assert_eq!(
            queued.await.unwrap(),
            Err(Error::WorkerStartup {
                worker_id: 1,
                reason: "no codec".to_string(),
            })
        );
    }
}
