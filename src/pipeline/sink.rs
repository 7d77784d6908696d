//! Persistence sinks: where a clip's frames end up

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::jpeg_seq::JpegSequenceSink;
use super::y4m::Y4mSink;
use crate::capture::Frame;
use crate::error::SinkError;

/// Geometry and rate a sink is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkParams {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl SinkParams {
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.width == 0 || self.height == 0 {
            return Err(SinkError::InvalidParams(format!(
                "zero frame geometry {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(SinkError::InvalidParams("zero frame rate".into()));
        }
        Ok(())
    }

    pub fn check_geometry(&self, frame: &Frame) -> Result<(), SinkError> {
        let (got_width, got_height) = frame.dimensions();
        if (got_width, got_height) != (self.width, self.height) {
            return Err(SinkError::GeometryMismatch {
                width: self.width,
                height: self.height,
                got_width,
                got_height,
            });
        }
        Ok(())
    }
}

/// An open, append-only clip destination.
///
/// `close` consumes the handle, so a sink is released exactly once.
pub trait FrameSink: Send {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError>;

    /// Flush and release; returns the number of frames persisted.
    fn close(self: Box<Self>) -> Result<u64, SinkError>;
}

/// Opens a sink per clip.
pub trait SinkFactory: Send + Sync {
    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn FrameSink>, SinkError>;

    /// File extension for clip paths, without the dot. Empty for directories.
    fn extension(&self) -> &str;
}

/// On-disk clip formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// YUV4MPEG2 stream, playable by ffmpeg/mpv
    #[default]
    Y4m,
    /// Directory of numbered JPEG files
    Jpeg,
}

/// Factory for the built-in file sinks.
#[derive(Debug, Clone)]
pub struct FileSinkFactory {
    format: OutputFormat,
    jpeg_quality: u8,
}

impl FileSinkFactory {
    pub fn new(format: OutputFormat, jpeg_quality: u8) -> Self {
        Self {
            format,
            jpeg_quality: jpeg_quality.clamp(1, 100),
        }
    }
}

impl SinkFactory for FileSinkFactory {
    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn FrameSink>, SinkError> {
        params.validate()?;
        match self.format {
            OutputFormat::Y4m => Ok(Box::new(Y4mSink::create(path, *params)?)),
            OutputFormat::Jpeg => Ok(Box::new(JpegSequenceSink::create(
                path,
                *params,
                self.jpeg_quality,
            )?)),
        }
    }

    fn extension(&self) -> &str {
        match self.format {
            OutputFormat::Y4m => "y4m",
            OutputFormat::Jpeg => "",
        }
    }
}

/// `<dir>/<prefix><stamp>[-N][.ext]`, skipping names that already exist.
pub fn clip_path(dir: &Path, prefix: &str, stamp: &str, extension: &str) -> PathBuf {
    let name = |n: u32| {
        let mut base = format!("{}{}", prefix, stamp);
        if n > 0 {
            base.push_str(&format!("-{}", n));
        }
        if !extension.is_empty() {
            base.push('.');
            base.push_str(extension);
        }
        dir.join(base)
    };

    let mut n = 0;
    loop {
        let candidate = name(n);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn params_reject_zero_rate_and_geometry() {
        let ok = SinkParams {
            width: 4,
            height: 4,
            fps: 10,
        };
        assert!(ok.validate().is_ok());
        assert!(SinkParams { fps: 0, ..ok }.validate().is_err());
        assert!(SinkParams { width: 0, ..ok }.validate().is_err());
    }

    #[test]
    fn geometry_mismatch_is_reported() {
        let params = SinkParams {
            width: 2,
            height: 2,
            fps: 10,
        };
        let frame = Frame::new(1, 3, 2, PixelFormat::Rgb24, vec![0u8; 18]);
        assert!(matches!(
            params.check_geometry(&frame),
            Err(SinkError::GeometryMismatch { got_width: 3, .. })
        ));
    }

    #[test]
    fn clip_path_avoids_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let first = clip_path(dir.path(), "clip-", "20240101-120000", "y4m");
        assert_eq!(first, dir.path().join("clip-20240101-120000.y4m"));
        std::fs::write(&first, b"x").unwrap();
        let second = clip_path(dir.path(), "clip-", "20240101-120000", "y4m");
        assert_eq!(second, dir.path().join("clip-20240101-120000-1.y4m"));
    }

    #[test]
    fn factory_rejects_zero_fps() {
        let dir = tempfile::tempdir().unwrap();
        let factory = FileSinkFactory::new(OutputFormat::Y4m, 90);
        let params = SinkParams {
            width: 2,
            height: 2,
            fps: 0,
        };
        assert!(matches!(
            factory.open(&dir.path().join("a.y4m"), &params),
            Err(SinkError::InvalidParams(_))
        ));
    }
}
