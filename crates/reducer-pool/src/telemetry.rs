//! # Telemetry Features
//!
//! Log output always goes through `tracing_subscriber::fmt`; the pool's own
//! log events exist only with the `tracing` feature. Metrics are recorded via
//! OpenTelemetry when `metrics` is enabled.
//!
//! ## Feature matrix
//!
//! - `tracing`: Emits pool, dispatcher and worker log events.
//! - `metrics`: Records OpenTelemetry counters and histograms.
//! - `stdout`: Periodically prints collected metrics to stdout.
//!
//! ## Metrics
//!
//! | Name               | Kind           | Meaning                                   |
//! |--------------------|----------------|-------------------------------------------|
//! | `tasks_submitted`  | counter        | Tasks accepted by [`WorkerPool::submit`]  |
//! | `tasks_inflight`   | up/down        | Tasks dispatched and not yet resolved     |
//! | `tasks_failed`     | counter        | Tasks resolved with an error              |
//! | `transcode_time`   | histogram (ms) | Time a worker spent in the codec          |
//! | `queue_wait`       | histogram (ms) | Time from submission to dispatch          |
//!
//! Every recording helper compiles to a no-op without `metrics`.
//!
//! ## Example usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --features metrics,stdout -- photos/*.png
//! ```
//!
//! [`WorkerPool::submit`]: crate::WorkerPool::submit

#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops any metric exporters.
    pub fn shutdown(self) -> anyhow::Result<()> {
        #[cfg(feature = "metrics")]
        self.meter_provider.shutdown()?;
        Ok(())
    }
}

/// Installs the global log subscriber and, with `metrics`, the meter provider.
///
/// The log level comes from `RUST_LOG` and defaults to `info`.
pub fn init_telemetry() -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true)
                .compact(),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        let scope = InstrumentationScope::builder("reducer")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
    }

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("reducer")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics() -> sdkmetrics::SdkMeterProvider {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    builder.build()
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static TASKS_SUBMITTED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_INFLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TASKS_FAILED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static TRANSCODE_TIME_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static QUEUE_WAIT_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = TASKS_SUBMITTED.set(
        meter
            .u64_counter("tasks_submitted")
            .with_description("Transcode tasks accepted by the pool")
            .build(),
    );

    let _ = TASKS_INFLIGHT.set(
        meter
            .i64_up_down_counter("tasks_inflight")
            .with_description("Tasks dispatched to a worker and awaiting a response")
            .build(),
    );

    let _ = TASKS_FAILED.set(
        meter
            .u64_counter("tasks_failed")
            .with_description("Tasks resolved with an error")
            .build(),
    );

    let _ = TRANSCODE_TIME_MS.set(
        meter
            .f64_histogram("transcode_time")
            .with_unit("ms")
            .with_description("Time spent inside the codec per task")
            .build(),
    );

    let _ = QUEUE_WAIT_MS.set(
        meter
            .f64_histogram("queue_wait")
            .with_unit("ms")
            .with_description("Time between submission and dispatch")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_tasks_submitted() {
    if let Some(counter) = TASKS_SUBMITTED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_submitted() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_inflight() {
    if let Some(counter) = TASKS_INFLIGHT.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_tasks_inflight() {
    if let Some(counter) = TASKS_INFLIGHT.get() {
        counter.add(-1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_tasks_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_tasks_failed() {
    if let Some(counter) = TASKS_FAILED.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_tasks_failed() {}

#[cfg(feature = "metrics")]
pub fn record_transcode_duration(duration_ms: f64) {
    if let Some(histogram) = TRANSCODE_TIME_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_transcode_duration(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn record_queue_wait(wait_ms: f64) {
    if let Some(histogram) = QUEUE_WAIT_MS.get() {
        histogram.record(wait_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_queue_wait(_wait_ms: f64) {}
