//! Default [`Codec`] built on the `image` crate.
//!
//! Decodes JPEG, PNG and WebP input, resizes with Lanczos resampling while
//! preserving the aspect ratio (never upscaling) and re-encodes to JPEG at the
//! requested quality or to lossless WebP. The `image` WebP encoder is
//! lossless only, so `quality` has no effect on WebP output.

use super::{Codec, CodecError, CodecFactory, CodecOutput};
use crate::OutputFormat;
use image::{
    DynamicImage, ExtendedColorType, GenericImageView, ImageEncoder, ImageFormat, ImageReader,
    codecs::{jpeg::JpegEncoder, webp::WebPEncoder},
    imageops::FilterType,
};
use std::io::Cursor;

/// Encoder selected for a call.
#[derive(Clone, Copy)]
enum Encoder {
    Jpeg { quality: u8 },
    Webp,
}

/// `image`-backed codec. One instance per worker.
pub struct ImageCodec {
    filter: FilterType,
    result: Vec<u8>,
}

impl ImageCodec {
    pub const fn new() -> Self {
        Self::with_filter(FilterType::Lanczos3)
    }

    pub const fn with_filter(filter: FilterType) -> Self {
        Self {
            filter,
            result: Vec::new(),
        }
    }

    fn passthrough(
        &mut self,
        image: &[u8],
        source: ImageFormat,
    ) -> Result<CodecOutput<'_>, CodecError> {
        let (width, height) = ImageReader::with_format(Cursor::new(image), source)
            .into_dimensions()
            .map_err(|e| CodecError::Failed(format!("failed to read {source:?} header: {e}")))?;

        self.result.clear();
        self.result.extend_from_slice(image);

        Ok(CodecOutput {
            data: &self.result,
            original_width: width,
            original_height: height,
            width,
            height,
        })
    }
}

impl Default for ImageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for ImageCodec {
    fn optimize(
        &mut self,
        image: &[u8],
        width: u32,
        height: u32,
        quality: u8,
        format: OutputFormat,
    ) -> Result<CodecOutput<'_>, CodecError> {
        let source = image::guess_format(image).map_err(|_| CodecError::Unsupported)?;
        if !source.reading_enabled() {
            return Err(CodecError::Unsupported);
        }

        let encoder = match format {
            OutputFormat::Jpeg => Encoder::Jpeg { quality },
            OutputFormat::Webp => Encoder::Webp,
            OutputFormat::Passthrough => return self.passthrough(image, source),
        };

        let decoded = image::load_from_memory_with_format(image, source)
            .map_err(|e| CodecError::Failed(format!("failed to decode {source:?}: {e}")))?;
        let (original_width, original_height) = decoded.dimensions();

        let resized = match fit_dimensions(original_width, original_height, width, height) {
            Some((w, h)) => decoded.resize_exact(w, h, self.filter),
            None => decoded,
        };
        let (out_width, out_height) = resized.dimensions();

        self.result.clear();
        encode(&resized, encoder, &mut self.result)?;
        if self.result.is_empty() {
            return Err(CodecError::Failed("encoder produced no data".into()));
        }

        Ok(CodecOutput {
            data: &self.result,
            original_width,
            original_height,
            width: out_width,
            height: out_height,
        })
    }

    fn release_result(&mut self) {
        self.result = Vec::new();
    }
}

fn encode(image: &DynamicImage, encoder: Encoder, out: &mut Vec<u8>) -> Result<(), CodecError> {
    let (width, height) = image.dimensions();
    let written = match encoder {
        Encoder::Jpeg { quality } => {
            let rgb = image.to_rgb8();
            // Quality 0 is not accepted by the JPEG encoder.
            JpegEncoder::new_with_quality(&mut *out, quality.max(1)).write_image(
                rgb.as_raw(),
                width,
                height,
                ExtendedColorType::Rgb8,
            )
        }
        Encoder::Webp => {
            let rgba = image.to_rgba8();
            WebPEncoder::new_lossless(&mut *out).write_image(
                rgba.as_raw(),
                width,
                height,
                ExtendedColorType::Rgba8,
            )
        }
    };
    written.map_err(|e| CodecError::Failed(format!("encoding failed: {e}")))
}

/// Computes the output size for a bounding box of `max_width` x `max_height`.
///
/// A zero bound means "unconstrained". Returns `None` when the image already
/// fits and should be kept at its original size.
fn fit_dimensions(width: u32, height: u32, max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }

    let scale = match (max_width, max_height) {
        (0, 0) => return None,
        (w, 0) => f64::from(w) / f64::from(width),
        (0, h) => f64::from(h) / f64::from(height),
        (w, h) => (f64::from(w) / f64::from(width)).min(f64::from(h) / f64::from(height)),
    };
    if scale >= 1.0 {
        return None;
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let scaled = |v: u32| ((f64::from(v) * scale).round() as u32).max(1);
    Some((scaled(width), scaled(height)))
}

/// Factory producing an [`ImageCodec`] for every worker.
#[derive(Clone, Copy, Debug)]
pub struct ImageCodecFactory {
    pub filter: FilterType,
}

impl Default for ImageCodecFactory {
    fn default() -> Self {
        Self {
            filter: FilterType::Lanczos3,
        }
    }
}

impl CodecFactory for ImageCodecFactory {
    fn create(&self, _worker_id: usize) -> Result<Box<dyn Codec>, CodecError> {
        Ok(Box::new(ImageCodec::with_filter(self.filter)))
    }
}
