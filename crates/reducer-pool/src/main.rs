use anyhow::bail;
use clap::Parser;
use reducer_pool::{
    WorkerPool,
    batch::run_batch,
    config::{CliArgs, RunConfig},
    telemetry::init_telemetry,
};
use tokio::signal;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = RunConfig::try_from(args)?;

    let providers = init_telemetry()?;
    log_startup_info(&config);

    let pool = WorkerPool::with_image_codec(config.pool.clone());
    pool.initialize(config.pool.num_workers).await?;

    let outcome = tokio::select! {
        summary = run_batch(&pool, &config.batch) => {
            pool.destroy().await;
            summary
        }
        () = shutdown_signal() => {
            #[cfg(feature = "tracing")]
            tracing::warn!("Interrupted, terminating worker pool");

            pool.terminate().await;
            Err(anyhow::anyhow!("interrupted"))
        }
    };

    if let Err(err) = providers.shutdown() {
        eprintln!("Error shutting down telemetry: {err:#}");
    }

    let summary = outcome?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        "Transcoded {} of {} images, {} -> {} bytes ({:.1}%)",
        summary.succeeded,
        summary.succeeded + summary.failed,
        summary.bytes_in,
        summary.bytes_out,
        summary.ratio() * 100.0
    );

    if summary.failed > 0 {
        bail!("{} of {} images failed", summary.failed, summary.succeeded + summary.failed);
    }
    Ok(())
}

fn log_startup_info(_config: &RunConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!("Starting reducer with full config: {:#?}", _config);
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Transcoding {} images to {} with {} workers",
            _config.batch.inputs.len(),
            _config.batch.format,
            _config.pool.num_workers
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }
}
