use crate::{PoolConfig, PoolStats, WorkerPool};
use core::time::Duration;
use futures::future::join_all;
use parking_lot::{Condvar, Mutex};
use reducer_core::{
    Error, OutputFormat, TranscodeRequest,
    codec::{Codec, CodecError, CodecFactory, CodecOutput},
};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Blocks codec calls until opened. Stays open once opened.
#[derive(Default)]
struct Latch {
    open: Mutex<bool>,
    cv: Condvar,
}

impl Latch {
    fn wait(&self) {
        let mut open = self.open.lock();
        while !*open {
            self.cv.wait(&mut open);
        }
    }

    fn open(&self) {
        *self.open.lock() = true;
        self.cv.notify_all();
    }
}

/// Shared observations of every codec created by a [`MockFactory`].
#[derive(Default)]
struct Probe {
    created: AtomicUsize,
    optimized: AtomicUsize,
    released: AtomicUsize,
    seen: Mutex<Vec<Vec<u8>>>,
    latch: Latch,
}

/// Behaves according to the payload:
///
/// - `fail`: codec error
/// - `unsupported`: unreadable input
/// - `panic`: panics inside `optimize`
/// - `crash`: succeeds, then panics in `release_result`, killing the worker
/// - `wait`: blocks until the probe's latch opens
/// - `wait then crash`: both of the above
/// - anything else: echoes the payload
struct MockCodec {
    probe: Arc<Probe>,
    buf: Vec<u8>,
    crash_on_release: bool,
}

impl Codec for MockCodec {
    fn optimize(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
        _quality: u8,
        _format: OutputFormat,
    ) -> Result<CodecOutput<'_>, CodecError> {
        self.probe.optimized.fetch_add(1, Ordering::SeqCst);
        self.probe.seen.lock().push(image.to_vec());

        match image {
            b"fail" => return Err(CodecError::Failed("boom".to_string())),
            b"unsupported" => return Err(CodecError::Unsupported),
            b"panic" => panic!("codec exploded"),
            b"crash" => self.crash_on_release = true,
            b"wait" => self.probe.latch.wait(),
            b"wait then crash" => {
                self.probe.latch.wait();
                self.crash_on_release = true;
            }
            _ => {}
        }

        self.buf = image.to_vec();
        Ok(CodecOutput {
            data: &self.buf,
            original_width: 10,
            original_height: 20,
            width,
            height,
        })
    }

    fn release_result(&mut self) {
        self.probe.released.fetch_add(1, Ordering::SeqCst);
        self.buf.clear();
        if core::mem::take(&mut self.crash_on_release) {
            panic!("release crashed");
        }
    }
}

struct MockFactory {
    probe: Arc<Probe>,
    failing: fn(usize) -> bool,
}

impl CodecFactory for MockFactory {
    fn create(&self, worker_id: usize) -> Result<Box<dyn Codec>, CodecError> {
        self.probe.created.fetch_add(1, Ordering::SeqCst);
        if (self.failing)(worker_id) {
            return Err(CodecError::Failed(format!("no codec for worker {worker_id}")));
        }
        Ok(Box::new(MockCodec {
            probe: Arc::clone(&self.probe),
            buf: Vec::new(),
            crash_on_release: false,
        }))
    }
}

fn config(num_workers: usize) -> PoolConfig {
    PoolConfig {
        num_workers,
        shutdown_timeout: Duration::from_secs(1),
        thread_name: "test-worker".to_string(),
        ..PoolConfig::default()
    }
}

fn pool_with(num_workers: usize, failing: fn(usize) -> bool) -> (WorkerPool, Arc<Probe>) {
    let probe = Arc::new(Probe::default());
    let factory = MockFactory {
        probe: Arc::clone(&probe),
        failing,
    };
    (WorkerPool::new(config(num_workers), factory), probe)
}

fn pool(num_workers: usize) -> (WorkerPool, Arc<Probe>) {
    pool_with(num_workers, |_| false)
}

fn request(payload: &[u8]) -> TranscodeRequest {
    TranscodeRequest::new(payload.to_vec(), OutputFormat::Webp, 80)
}

async fn wait_for_stats(pool: &WorkerPool, cond: impl Fn(&PoolStats) -> bool) -> PoolStats {
    for _ in 0..500 {
        let stats = pool.stats().await;
        if cond(&stats) {
            return stats;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached expected state: {:?}", pool.stats().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn every_task_resolves_with_its_own_result() {
    let (pool, probe) = pool(4);

    let mut pending = Vec::new();
    for i in 0..32 {
        let payload = format!("image-{i}");
        pending.push((payload.clone(), pool.submit(request(payload.as_bytes())).await.unwrap()));
    }

    for (payload, response) in pending {
        let result = response.await.unwrap();
        assert_eq!(result.data.as_ref(), payload.as_bytes());
        assert_eq!((result.original_width, result.original_height), (10, 20));
    }

    let stats = pool.stats().await;
    assert_eq!(stats.completed, 32);
    assert_eq!(stats.in_flight, 0);
    assert_eq!(probe.optimized.load(Ordering::SeqCst), 32);
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn correlation_ids_match_responses_on_a_single_worker() {
    let (pool, _probe) = pool(1);

    let mut responses = Vec::new();
    for i in 0..10u32 {
        let response = pool
            .submit(request(&i.to_be_bytes()).with_width(i + 1))
            .await
            .unwrap();
        responses.push(response);
    }

    let ids: Vec<_> = responses.iter().map(|r| r.id()).collect();
    let mut unique = ids.clone();
    unique.sort_unstable();
    unique.dedup();
    assert_eq!(unique.len(), ids.len());

    let results = join_all(responses).await;
    for (i, result) in (0..10u32).zip(results) {
        let result = result.unwrap();
        assert_eq!(result.data.as_ref(), i.to_be_bytes());
        assert_eq!(result.output_width, i + 1);
    }
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn submit_initializes_lazily_with_the_configured_size() {
    let (pool, probe) = pool(3);
    assert!(!pool.is_initialized().await);
    assert_eq!(pool.worker_count(), 3);
    assert_eq!(pool.live_workers(), 0);

    pool.submit(request(b"first")).await.unwrap().await.unwrap();

    assert!(pool.is_initialized().await);
    assert_eq!(pool.live_workers(), 3);
    assert_eq!(probe.created.load(Ordering::SeqCst), 3);
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resizing_tracks_the_requested_count() {
    let (pool, _probe) = pool(2);
    pool.initialize(2).await.unwrap();

    pool.set_worker_count(5).await.unwrap();
    assert_eq!(pool.worker_count(), 5);
    assert_eq!(pool.live_workers(), 5);

    pool.set_worker_count(1).await.unwrap();
    assert_eq!(pool.worker_count(), 1);
    assert_eq!(pool.live_workers(), 1);
    assert_eq!(pool.stats().await.workers, 1);

    pool.set_worker_count(1).await.unwrap();
    assert_eq!(pool.live_workers(), 1);

    let result = pool.transcode(request(b"still works")).await.unwrap();
    assert_eq!(result.data.as_ref(), b"still works");
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resizing_an_uninitialized_pool_initializes_it() {
    let (pool, probe) = pool(8);
    pool.set_worker_count(2).await.unwrap();
    assert!(pool.is_initialized().await);
    assert_eq!(pool.live_workers(), 2);
    assert_eq!(probe.created.load(Ordering::SeqCst), 2);
    pool.destroy().await;
}

#[tokio::test]
async fn zero_workers_is_invalid() {
    let (pool, probe) = pool(2);
    assert!(matches!(pool.set_worker_count(0).await, Err(Error::InvalidArgument { .. })));
    assert!(matches!(pool.initialize(0).await, Err(Error::InvalidArgument { .. })));
    assert_eq!(pool.worker_count(), 2);
    assert_eq!(probe.created.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shrinking_waits_for_in_flight_tasks() {
    let (pool, probe) = pool(3);
    pool.initialize(3).await.unwrap();

    let mut responses = Vec::new();
    for _ in 0..3 {
        responses.push(pool.submit(request(b"wait")).await.unwrap());
    }
    wait_for_stats(&pool, |s| s.busy == 3).await;

    let resizer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.set_worker_count(1).await })
    };
    let stats = wait_for_stats(&pool, |s| s.retiring == 2).await;
    assert_eq!(stats.in_flight, 3);
    assert!(!resizer.is_finished());

    probe.latch.open();
    for result in join_all(responses).await {
        assert_eq!(result.unwrap().data.as_ref(), b"wait");
    }
    resizer.await.unwrap().unwrap();

    assert_eq!(pool.live_workers(), 1);
    assert_eq!(pool.worker_count(), 1);
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_requests_never_reach_a_worker() {
    let (pool, probe) = pool(2);

    let mut bad_quality = request(b"data");
    bad_quality.quality = 150;
    assert!(matches!(pool.submit(bad_quality).await, Err(Error::InvalidArgument { .. })));
    assert!(matches!(pool.submit(request(b"")).await, Err(Error::InvalidArgument { .. })));
    assert!(matches!(
        pool.submit(request(b"data").with_height(0)).await,
        Err(Error::InvalidArgument { .. })
    ));

    assert!(!pool.is_initialized().await);
    assert_eq!(probe.created.load(Ordering::SeqCst), 0);
    assert_eq!(probe.optimized.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_input_comes_back_unchanged() {
    let (pool, _probe) = pool(1);

    let result = pool
        .transcode(request(b"unsupported").with_width(50))
        .await
        .unwrap();
    assert_eq!(result.data.as_ref(), b"unsupported");
    assert_eq!((result.original_width, result.original_height), (0, 0));
    assert_eq!((result.output_width, result.output_height), (50, 0));
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn codec_faults_resolve_as_failures_and_release_the_buffer() {
    let (pool, probe) = pool(1);

    assert_eq!(
        pool.transcode(request(b"fail")).await,
        Err(Error::CodecFailure {
            message: "boom".to_string()
        })
    );
    match pool.transcode(request(b"panic")).await {
        Err(Error::CodecFailure { message }) => assert!(message.contains("codec exploded")),
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(pool.transcode(request(b"fine")).await.is_ok());
    assert!(pool.transcode(request(b"unsupported")).await.is_ok());

    assert_eq!(probe.optimized.load(Ordering::SeqCst), 4);
    assert_eq!(probe.released.load(Ordering::SeqCst), 4);
    assert_eq!(probe.created.load(Ordering::SeqCst), 1);

    let stats = pool.stats().await;
    assert_eq!((stats.completed, stats.failed), (2, 2));
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn destroy_finishes_queued_work_and_allows_reuse() {
    let (pool, probe) = pool(1);

    let mut responses = Vec::new();
    for i in 0..5u8 {
        responses.push(pool.submit(request(&[i + 1])).await.unwrap());
    }
    pool.destroy().await;

    assert!(!pool.is_initialized().await);
    assert_eq!(pool.live_workers(), 0);
    for (i, result) in (0..5u8).zip(join_all(responses).await) {
        assert_eq!(result.unwrap().data.as_ref(), [i + 1]);
    }

    // A destroyed pool starts over on the next submission.
    assert!(pool.transcode(request(b"again")).await.is_ok());
    assert_eq!(probe.created.load(Ordering::SeqCst), 2);
    assert_eq!(pool.live_workers(), 1);
    pool.destroy().await;

    // Destroying twice is harmless.
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_initialization_creates_one_worker_set() {
    let (pool, probe) = pool(3);

    let calls = (0..8).map(|_| {
        let pool = pool.clone();
        async move { pool.initialize(3).await }
    });
    for result in join_all(calls).await {
        result.unwrap();
    }

    assert_eq!(probe.created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.live_workers(), 3);
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn workers_that_fail_to_start_are_excluded() {
    let (pool, probe) = pool_with(3, |worker_id| worker_id == 1);

    pool.initialize(3).await.unwrap();
    assert_eq!(probe.created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.live_workers(), 2);
    assert!(pool.transcode(request(b"ok")).await.is_ok());
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initialization_fails_when_no_worker_starts() {
    let (pool, _probe) = pool_with(2, |_| true);

    assert!(matches!(pool.initialize(2).await, Err(Error::WorkerStartup { .. })));
    assert!(!pool.is_initialized().await);
    assert!(matches!(
        pool.submit(request(b"data")).await,
        Err(Error::WorkerStartup { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn crashed_worker_rejects_its_task_and_is_replaced() {
    let (pool, probe) = pool(2);
    pool.initialize(2).await.unwrap();

    assert!(matches!(
        pool.transcode(request(b"crash")).await,
        Err(Error::WorkerLost { .. })
    ));

    wait_for_stats(&pool, |s| s.workers == 2).await;
    assert_eq!(probe.created.load(Ordering::SeqCst), 3);
    assert_eq!(pool.live_workers(), 2);
    assert!(pool.transcode(request(b"after crash")).await.is_ok());
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pool_restarts_after_its_last_worker_cannot_be_replaced() {
    let (pool, probe) = pool_with(1, |worker_id| worker_id >= 1);
    pool.initialize(1).await.unwrap();

    assert_eq!(
        pool.transcode(request(b"crash")).await,
        Err(Error::WorkerLost { worker_id: 0 })
    );
    for _ in 0..500 {
        if !pool.is_initialized().await {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!pool.is_initialized().await);
    assert_eq!(pool.live_workers(), 0);

    let result = tokio::time::timeout(Duration::from_secs(5), pool.transcode(request(b"after")))
        .await
        .expect("task after the lost worker never resolved");
    assert_eq!(result.unwrap().data.as_ref(), b"after");
    // Worker 0, its failed replacement, then worker 0 of the new generation.
    assert_eq!(probe.created.load(Ordering::SeqCst), 3);
    assert!(pool.is_initialized().await);
    assert_eq!(pool.live_workers(), 1);
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queued_tasks_are_rejected_when_no_worker_is_left() {
    let (pool, probe) = pool_with(1, |worker_id| worker_id >= 1);
    pool.initialize(1).await.unwrap();

    let doomed = pool.submit(request(b"wait then crash")).await.unwrap();
    wait_for_stats(&pool, |s| s.busy == 1).await;
    let queued = pool.submit(request(b"queued")).await.unwrap();
    wait_for_stats(&pool, |s| s.queued == 1).await;

    probe.latch.open();
    assert_eq!(doomed.await, Err(Error::WorkerLost { worker_id: 0 }));
    let outcome = tokio::time::timeout(Duration::from_secs(5), queued)
        .await
        .expect("queued task never resolved");
    assert!(matches!(outcome, Err(Error::WorkerStartup { worker_id: 1, .. })));
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_rejects_queued_and_in_flight_work() {
    let (pool, probe) = pool(1);
    pool.initialize(1).await.unwrap();

    let blocked = pool.submit(request(b"wait")).await.unwrap();
    wait_for_stats(&pool, |s| s.busy == 1).await;

    let mut queued = Vec::new();
    for _ in 0..3 {
        queued.push(pool.submit(request(b"queued")).await.unwrap());
    }
    wait_for_stats(&pool, |s| s.queued == 3).await;

    pool.terminate().await;
    assert!(!pool.is_initialized().await);
    assert_eq!(pool.live_workers(), 0);
    assert_eq!(blocked.await, Err(Error::PoolShutdown));
    for result in join_all(queued).await {
        assert_eq!(result, Err(Error::PoolShutdown));
    }

    probe.latch.open();
    assert!(pool.transcode(request(b"fresh start")).await.is_ok());
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn terminate_releases_a_pending_destroy() {
    let (pool, probe) = pool(1);
    let blocked = pool.submit(request(b"wait")).await.unwrap();
    wait_for_stats(&pool, |s| s.busy == 1).await;

    let destroyer = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.destroy().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!destroyer.is_finished());

    pool.terminate().await;
    destroyer.await.unwrap();
    assert_eq!(blocked.await, Err(Error::PoolShutdown));
    probe.latch.open();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_queued_tasks_are_skipped() {
    let (pool, probe) = pool(1);
    pool.initialize(1).await.unwrap();

    let blocked = pool.submit(request(b"wait")).await.unwrap();
    wait_for_stats(&pool, |s| s.busy == 1).await;

    let abandoned = pool.submit(request(b"abandoned")).await.unwrap();
    let kept = pool.submit(request(b"kept")).await.unwrap();
    drop(abandoned);

    probe.latch.open();
    assert!(blocked.await.is_ok());
    assert_eq!(kept.await.unwrap().data.as_ref(), b"kept");

    let seen = probe.seen.lock().clone();
    assert_eq!(seen, vec![b"wait".to_vec(), b"kept".to_vec()]);
    pool.destroy().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn callers_can_stop_waiting_without_disturbing_the_pool() {
    let (pool, probe) = pool(1);

    let slow = pool.submit(request(b"wait")).await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(50), slow)
            .await
            .is_err()
    );

    probe.latch.open();
    // The worker finishes the abandoned task and moves on.
    assert!(pool.transcode(request(b"next")).await.is_ok());
    let stats = wait_for_stats(&pool, |s| s.in_flight == 0).await;
    assert_eq!(stats.completed, 2);
    pool.destroy().await;
}
