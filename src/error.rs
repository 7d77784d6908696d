use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::capture::PixelFormat;

pub type ClipResult<T> = Result<T, ClipError>;

/// Errors surfaced by the clip recording engine.
#[derive(Debug, Error)]
pub enum ClipError {
    /// Invalid buffer capacity or sink parameters. Fatal at construction.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The sink for a new clip could not be opened; the recorder stays idle.
    #[error("failed to open clip sink {}: {source}", path.display())]
    SinkOpen {
        path: PathBuf,
        #[source]
        source: SinkError,
    },

    /// A single append failed inside the writer.
    #[error("failed to write frame #{sequence} to {}: {source}", path.display())]
    SinkWrite {
        path: PathBuf,
        sequence: u64,
        #[source]
        source: SinkError,
    },

    /// Joining the writer or releasing the sink failed while finishing a clip.
    #[error("failed to finish clip {}: {reason}", path.display())]
    Shutdown { path: PathBuf, reason: String },
}

impl ClipError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Errors raised by a [`FrameSink`](crate::pipeline::FrameSink) implementation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid sink parameters: {0}")]
    InvalidParams(String),

    #[error("frame is {got_width}x{got_height}, sink expects {width}x{height}")]
    GeometryMismatch {
        width: u32,
        height: u32,
        got_width: u32,
        got_height: u32,
    },

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("encode failed: {0}")]
    Encode(String),
}

impl From<CaptureError> for SinkError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::UnsupportedFormat(format) => SinkError::UnsupportedFormat(format),
            other => SinkError::Encode(other.to_string()),
        }
    }
}

/// Errors raised by frame sources and pixel decoding.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("capture device error: {0}")]
    Device(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported pixel format: {0:?}")]
    UnsupportedFormat(PixelFormat),

    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),
}
