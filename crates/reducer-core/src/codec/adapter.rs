//! Adapter between a [`TranscodeRequest`] and an opaque [`Codec`].
//!
//! The adapter validates the request, invokes the codec exactly once, copies
//! the result out of the codec's buffer and releases that buffer on every
//! exit path. Codec errors and panics become [`Error::CodecFailure`]; an
//! unsupported input format becomes a successful passthrough result.

use super::{Codec, CodecError};
use crate::{Error, TranscodeRequest, TranscodeResult};
use bytes::Bytes;
use core::any::Any;
use std::panic::{self, AssertUnwindSafe};

/// Calls [`Codec::release_result`] when dropped.
struct ReleaseGuard<'a> {
    codec: &'a mut dyn Codec,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        self.codec.release_result();
    }
}

/// Runs a single transcode through `codec`.
///
/// # Errors
///
/// - [`Error::InvalidArgument`] if the request fails validation. The codec
///   is not invoked.
/// - [`Error::CodecFailure`] if the codec fails or panics.
pub fn transcode(
    codec: &mut dyn Codec,
    request: &TranscodeRequest,
) -> Result<TranscodeResult, Error> {
    request.validate()?;

    let width = request.width.unwrap_or(0);
    let height = request.height.unwrap_or(0);

    let guard = ReleaseGuard { codec };
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        guard
            .codec
            .optimize(
                &request.image,
                width,
                height,
                request.quality,
                request.format,
            )
            .map(|output| TranscodeResult {
                data: Bytes::copy_from_slice(output.data),
                original_width: output.original_width,
                original_height: output.original_height,
                output_width: output.width,
                output_height: output.height,
            })
    }));
    drop(guard);

    match outcome {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(CodecError::Unsupported)) => {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                bytes = request.image.len(),
                "Unsupported image format, returning original data"
            );
            Ok(passthrough(request, width, height))
        }
        Ok(Err(CodecError::Failed(message))) => Err(Error::CodecFailure { message }),
        Err(payload) => Err(Error::CodecFailure {
            message: format!("codec panicked: {}", panic_message(payload.as_ref())),
        }),
    }
}

/// Result returned when the codec cannot read the input.
///
/// The original dimensions are unknown on this path and reported as zero.
fn passthrough(request: &TranscodeRequest, width: u32, height: u32) -> TranscodeResult {
    TranscodeResult {
        data: request.image.clone(),
        original_width: 0,
        original_height: 0,
        output_width: width,
        output_height: height,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
