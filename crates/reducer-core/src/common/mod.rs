pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    CorrelationId, DEFAULT_QUALITY, MAX_QUALITY, OutputFormat, TranscodeRequest, TranscodeResult,
};
