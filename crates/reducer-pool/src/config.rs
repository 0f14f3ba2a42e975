use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use reducer_core::{MAX_QUALITY, OutputFormat, TranscodeRequest};
use std::path::PathBuf;

/// Tuning knobs for a [`WorkerPool`](crate::WorkerPool).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers started by lazy initialization.
    pub num_workers: usize,
    /// Capacity of the command channel into the dispatcher. Submissions
    /// wait for room once this many commands are pending.
    pub queue_capacity: usize,
    /// How long teardown waits for each worker to acknowledge shutdown.
    pub shutdown_timeout: Duration,
    /// Worker threads are named `{thread_name}-{worker_id}`.
    pub thread_name: String,
    /// Stack size for worker threads; the platform default when `None`.
    pub stack_size: Option<usize>,
}

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// One worker per logical CPU.
pub fn default_num_workers() -> usize {
    num_cpus::get().max(1)
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            thread_name: "reducer-worker".to_string(),
            stack_size: None,
        }
    }
}

/// Runtime configuration for the `reducer` binary.
///
/// Every pool setting can also come from the environment (or a `.env` file
/// in the working directory).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "reducer",
    version,
    about = "Resize and recompress images on a pool of worker threads"
)]
pub struct CliArgs {
    /// Images to transcode.
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Directory that receives the transcoded images. Created if missing.
    ///
    /// Environment variable: `REDUCER_OUT_DIR`
    #[arg(short, long, env = "REDUCER_OUT_DIR", default_value = "reduced")]
    pub out_dir: PathBuf,

    /// Output format: `webp`, `jpeg` or `none` (keep the original bytes).
    ///
    /// Environment variable: `REDUCER_FORMAT`
    #[arg(short, long, env = "REDUCER_FORMAT", default_value_t = OutputFormat::Webp)]
    pub format: OutputFormat,

    /// Encoder quality, 0-100. Only JPEG output uses it.
    ///
    /// Environment variable: `REDUCER_QUALITY`
    #[arg(short, long, env = "REDUCER_QUALITY", default_value_t = reducer_core::DEFAULT_QUALITY)]
    pub quality: u8,

    /// Maximum output width in pixels. Images are never upscaled.
    #[arg(long)]
    pub width: Option<u32>,

    /// Maximum output height in pixels. Images are never upscaled.
    #[arg(long)]
    pub height: Option<u32>,

    /// Number of worker threads.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = default_num_workers())]
    pub num_workers: usize,

    /// Number of submissions the dispatcher buffers before callers wait.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Seconds to wait for each worker to stop during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Stack size of each worker thread in bytes.
    ///
    /// Environment variable: `WORKER_STACK_SIZE`
    #[arg(long, env = "WORKER_STACK_SIZE")]
    pub worker_stack_size: Option<usize>,
}

/// What the binary transcodes and where the results go.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub inputs: Vec<PathBuf>,
    pub out_dir: PathBuf,
    pub format: OutputFormat,
    pub quality: u8,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl BatchConfig {
    /// Builds the request for one input image.
    pub fn request(&self, image: impl Into<bytes::Bytes>) -> TranscodeRequest {
        let mut request = TranscodeRequest::new(image, self.format, self.quality);
        request.width = self.width;
        request.height = self.height;
        request
    }
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub pool: PoolConfig,
    pub batch: BatchConfig,
}

impl TryFrom<CliArgs> for RunConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }
        if args.queue_capacity == 0 {
            bail!("QUEUE_CAPACITY must be greater than 0");
        }
        if args.quality > MAX_QUALITY {
            bail!("QUALITY ({}) must be between 0 and {MAX_QUALITY}", args.quality);
        }
        if args.width == Some(0) || args.height == Some(0) {
            bail!("--width and --height must be greater than 0");
        }
        if args.worker_stack_size == Some(0) {
            bail!("WORKER_STACK_SIZE must be greater than 0");
        }

        Ok(Self {
            pool: PoolConfig {
                num_workers: args.num_workers,
                queue_capacity: args.queue_capacity,
                shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
                stack_size: args.worker_stack_size,
                ..PoolConfig::default()
            },
            batch: BatchConfig {
                inputs: args.inputs,
                out_dir: args.out_dir,
                format: args.format,
                quality: args.quality,
                width: args.width,
                height: args.height,
            },
        })
    }
}
