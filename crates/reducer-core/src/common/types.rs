//! # Transcode request and result types
//!
//! These are the values that cross the boundary between a caller, the pool
//! dispatcher and the worker units. Requests and results own their byte
//! buffers as [`Bytes`], so handing an image to a worker (or returning the
//! original bytes in the unsupported-format fallback) never copies pixel data.
//!
//! ## Overview
//!
//! - [`OutputFormat`] - the target container, or `none` to keep the input
//! - [`TranscodeRequest`] - an immutable unit of work
//! - [`TranscodeResult`] - the encoded output plus source/target dimensions
//! - [`CorrelationId`] - the token linking a dispatched task to its caller

use crate::Error;
use bytes::Bytes;
use core::{fmt, str::FromStr};

/// Highest accepted encoder quality.
pub const MAX_QUALITY: u8 = 100;

/// Quality used when a caller does not pick one.
pub const DEFAULT_QUALITY: u8 = 80;

/// Output container requested from the codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum OutputFormat {
    /// Lossy or lossless WebP, depending on the codec.
    #[default]
    Webp,
    /// Baseline JPEG.
    Jpeg,
    /// Keep the input bytes as they are; the codec only reports dimensions.
    Passthrough,
}

impl OutputFormat {
    /// Name used on the codec boundary.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpeg",
            Self::Passthrough => "none",
        }
    }

    /// File extension for encoded output, if the format re-encodes.
    pub const fn extension(self) -> Option<&'static str> {
        match self {
            Self::Webp => Some("webp"),
            Self::Jpeg => Some("jpg"),
            Self::Passthrough => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "webp" => Ok(Self::Webp),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "none" => Ok(Self::Passthrough),
            other => Err(Error::invalid(format!(
                "unsupported format `{other}`: must be \"webp\", \"jpeg\" or \"none\""
            ))),
        }
    }
}

/// A single transcode job: resize (optional) and recompress one image.
///
/// Width and height are upper bounds. The codec preserves the aspect ratio
/// and never upscales.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodeRequest {
    pub image: Bytes,
    pub format: OutputFormat,
    pub quality: u8,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl TranscodeRequest {
    pub fn new(image: impl Into<Bytes>, format: OutputFormat, quality: u8) -> Self {
        Self {
            image: image.into(),
            format,
            quality,
            width: None,
            height: None,
        }
    }

    #[must_use]
    pub const fn with_width(mut self, width: u32) -> Self {
        self.width = Some(width);
        self
    }

    #[must_use]
    pub const fn with_height(mut self, height: u32) -> Self {
        self.height = Some(height);
        self
    }

    /// Checks the request shape without touching the codec.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the image is empty, the quality
    /// is above [`MAX_QUALITY`], or a target dimension is zero.
    pub fn validate(&self) -> Result<(), Error> {
        if self.image.is_empty() {
            return Err(Error::invalid("image is empty"));
        }
        if self.quality > MAX_QUALITY {
            return Err(Error::invalid(format!(
                "quality {} is out of range (0-{MAX_QUALITY})",
                self.quality
            )));
        }
        if self.width == Some(0) {
            return Err(Error::invalid("width must be a positive number"));
        }
        if self.height == Some(0) {
            return Err(Error::invalid("height must be a positive number"));
        }
        Ok(())
    }
}

/// Encoded output of a successful transcode.
///
/// `original_*` are zero when the codec could not report them (the
/// unsupported-format fallback).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TranscodeResult {
    pub data: Bytes,
    pub original_width: u32,
    pub original_height: u32,
    pub output_width: u32,
    pub output_height: u32,
}

/// Unique token linking a dispatched task to the caller awaiting it.
///
/// Allocated from a monotonic counter owned by the pool and never reused for
/// the lifetime of that pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
