//! The codec boundary consumed by worker units.
//!
//! A codec is an opaque, stateful transcoder. Each worker owns exactly one
//! instance, created through a shared [`CodecFactory`], so codec state is
//! never shared across workers.
//!
//! The contract mirrors a native codec that keeps its output in an internal
//! buffer:
//!
//! 1. [`Codec::optimize`] encodes and returns a [`CodecOutput`] borrowing that
//!    buffer.
//! 2. The caller copies the bytes out.
//! 3. [`Codec::release_result`] frees the buffer. It must run after every
//!    `optimize` call, whether it succeeded, failed or panicked.
//!
//! [`adapter::transcode`] enforces that sequence; nothing else in the
//! workspace should call a codec directly.

pub mod adapter;
mod image_codec;

pub use adapter::transcode;
pub use image_codec::{ImageCodec, ImageCodecFactory};

use crate::OutputFormat;

/// Raw output of a single [`Codec::optimize`] call.
///
/// `data` is only valid until [`Codec::release_result`] is called.
#[derive(Debug)]
pub struct CodecOutput<'a> {
    pub data: &'a [u8],
    pub original_width: u32,
    pub original_height: u32,
    pub width: u32,
    pub height: u32,
}

/// Failure reported by a codec.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The input is not an image format this codec can read.
    ///
    /// The adapter answers this with the original bytes instead of an error.
    #[error("unsupported image format")]
    Unsupported,

    /// Decoding, resizing or encoding failed.
    #[error("{0}")]
    Failed(String),
}

/// An opaque image transcoder.
///
/// `width` and `height` of `0` mean "not specified".
pub trait Codec: Send {
    /// Resizes and re-encodes `image` into the codec's result buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Unsupported`] when the input format cannot be
    /// read, or [`CodecError::Failed`] for any other fault.
    fn optimize(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
        quality: u8,
        format: OutputFormat,
    ) -> Result<CodecOutput<'_>, CodecError>;

    /// Releases the resources held for the last result.
    fn release_result(&mut self);
}

/// Creates one codec per worker unit.
///
/// Implemented for any `Fn(usize) -> Result<Box<dyn Codec>, CodecError>`, so
/// tests and embedders can pass a closure.
pub trait CodecFactory: Send + Sync + 'static {
    /// Creates the codec for `worker_id`.
    ///
    /// # Errors
    ///
    /// Any error is reported as a worker startup failure and the worker is
    /// excluded from the pool.
    fn create(&self, worker_id: usize) -> Result<Box<dyn Codec>, CodecError>;
}

impl<F> CodecFactory for F
where
    F: Fn(usize) -> Result<Box<dyn Codec>, CodecError> + Send + Sync + 'static,
{
    fn create(&self, worker_id: usize) -> Result<Box<dyn Codec>, CodecError> {
        self(worker_id)
    }
}
