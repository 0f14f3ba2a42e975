//! Batch transcoding of files on disk, used by the `reducer` binary.

use crate::{config::BatchConfig, pool::WorkerPool};
use anyhow::Context;
use futures::stream::{FuturesUnordered, StreamExt};
use reducer_core::{OutputFormat, TranscodeResult};
use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

/// Totals for one [`run_batch`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl BatchSummary {
    /// Output size relative to input size across all successful files.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            return 1.0;
        }
        self.bytes_out as f64 / self.bytes_in as f64
    }
}

/// Where the transcoded copy of `input` is written.
///
/// The file stem is kept and the extension follows the output format;
/// [`OutputFormat::Passthrough`] keeps the input's extension.
pub fn output_path(input: &Path, out_dir: &Path, format: OutputFormat) -> PathBuf {
    let mut name = input.file_stem().unwrap_or(input.as_os_str()).to_os_string();
    let extension = format.extension().map(OsStr::new).or_else(|| input.extension());
    if let Some(extension) = extension {
        name.push(".");
        name.push(extension);
    }
    out_dir.join(name)
}

/// Submits every input to `pool` in order, then writes results as they
/// complete.
///
/// Per-file failures are logged and counted, not returned.
///
/// # Errors
///
/// Returns an error only if the output directory cannot be created.
pub async fn run_batch(pool: &WorkerPool, batch: &BatchConfig) -> anyhow::Result<BatchSummary> {
    tokio::fs::create_dir_all(&batch.out_dir)
        .await
        .with_context(|| format!("failed to create {}", batch.out_dir.display()))?;

    let mut summary = BatchSummary::default();
    let mut pending = FuturesUnordered::new();

    for input in &batch.inputs {
        let submitted = async {
            let image = tokio::fs::read(input)
                .await
                .with_context(|| format!("failed to read {}", input.display()))?;
            let size = image.len() as u64;
            let response = pool.submit(batch.request(image)).await?;
            anyhow::Ok((size, response))
        };

        match submitted.await {
            Ok((size, response)) => pending.push(async move {
                let outcome = match response.await {
                    Ok(result) => write_result(input, &batch.out_dir, batch.format, &result)
                        .await
                        .map(|written| (written, result)),
                    Err(e) => Err(e.into()),
                };
                (input, size, outcome)
            }),
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("{}: {_e:#}", input.display());
                summary.failed += 1;
            }
        }
    }

    while let Some((input, size, outcome)) = pending.next().await {
        match outcome {
            Ok((_written, result)) => {
                summary.succeeded += 1;
                summary.bytes_in += size;
                summary.bytes_out += result.data.len() as u64;

                #[cfg(feature = "tracing")]
                tracing::info!(
                    "{} -> {} ({}x{} -> {}x{}, {} -> {} bytes)",
                    input.display(),
                    _written.display(),
                    result.original_width,
                    result.original_height,
                    result.output_width,
                    result.output_height,
                    size,
                    result.data.len()
                );
            }
            Err(_e) => {
                summary.failed += 1;

                #[cfg(feature = "tracing")]
                tracing::error!("{}: {_e:#}", input.display());
            }
        }
        #[cfg(not(feature = "tracing"))]
        let _ = input;
    }

    Ok(summary)
}

async fn write_result(
    input: &Path,
    out_dir: &Path,
    format: OutputFormat,
    result: &TranscodeResult,
) -> anyhow::Result<PathBuf> {
    let output = output_path(input, out_dir, format);
    tokio::fs::write(&output, &result.data)
        .await
        .with_context(|| format!("failed to write {}", output.display()))?;
    Ok(output)
}
