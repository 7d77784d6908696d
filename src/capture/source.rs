//! Frame sources feeding the ingestion loop

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::frame::{Frame, PixelFormat};
use crate::error::CaptureError;

/// Anything that yields frames in arrival order.
///
/// `Ok(None)` signals end of stream.
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;

    fn describe(&self) -> String;
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Sleeps between frames to hold a target rate.
#[derive(Debug)]
pub struct Pacer {
    interval: Option<Duration>,
    next_due: Option<Instant>,
}

impl Pacer {
    pub fn new(fps: u32, realtime: bool) -> Self {
        let interval = (realtime && fps > 0).then(|| Duration::from_secs(1) / fps);
        Self {
            interval,
            next_due: None,
        }
    }

    pub fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            thread::sleep(due - now);
        }
        self.next_due = Some(due.max(now) + interval);
    }
}

// ----------------------------------------------------------------------------
// Synthetic test-pattern source
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Stop after this many frames; `None` runs forever.
    pub frame_limit: Option<u64>,
    /// A bright block crosses the scene once per period.
    pub event_period: u64,
    /// Frames the block stays in view.
    pub event_length: u64,
    pub realtime: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            width: 320,
            height: 240,
            fps: 20,
            frame_limit: None,
            event_period: 200,
            event_length: 30,
            realtime: true,
        }
    }
}

/// Static grey background with a periodic moving block.
pub struct SyntheticSource {
    config: SyntheticConfig,
    sequence: u64,
    pacer: Pacer,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Result<Self, CaptureError> {
        if config.width == 0 || config.height == 0 {
            return Err(CaptureError::InvalidConfig(
                "synthetic source needs non-zero dimensions".into(),
            ));
        }
        if config.event_period == 0 {
            return Err(CaptureError::InvalidConfig(
                "synthetic event_period must be positive".into(),
            ));
        }
        let pacer = Pacer::new(config.fps, config.realtime);
        Ok(Self {
            config,
            sequence: 0,
            pacer,
        })
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let mut pixels = vec![64u8; w * h * 3];

        let phase = self.sequence % self.config.event_period;
        if phase < self.config.event_length {
            let block = (w.min(h) / 4).max(1);
            let span = w.saturating_sub(block).max(1) as u64;
            let left = ((phase * span) / self.config.event_length.max(1)) as usize;
            let top = h.saturating_sub(block) / 2;
            for row in top..(top + block).min(h) {
                for col in left..(left + block).min(w) {
                    let at = (row * w + col) * 3;
                    pixels[at..at + 3].copy_from_slice(&[230, 230, 230]);
                }
            }
        }
        pixels
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(limit) = self.config.frame_limit {
            if self.sequence >= limit {
                return Ok(None);
            }
        }
        self.pacer.wait();
        let pixels = self.render();
        self.sequence += 1;
        Ok(Some(Frame::new(
            self.sequence,
            self.config.width,
            self.config.height,
            PixelFormat::Rgb24,
            pixels,
        )))
    }

    fn describe(&self) -> String {
        format!(
            "synthetic {}x{}@{}",
            self.config.width, self.config.height, self.config.fps
        )
    }
}

// ----------------------------------------------------------------------------
// Raw file source
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawFileConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_raw_format")]
    pub format: PixelFormat,
    #[serde(default = "default_raw_fps")]
    pub fps: u32,
    /// Pace reads to `fps` instead of reading as fast as possible.
    #[serde(default)]
    pub realtime: bool,
}

fn default_raw_format() -> PixelFormat {
    PixelFormat::Rgb24
}

fn default_raw_fps() -> u32 {
    20
}

/// Reads back-to-back fixed-size frames from a file.
pub struct RawFileSource {
    config: RawFileConfig,
    reader: BufReader<File>,
    frame_len: usize,
    sequence: u64,
    pacer: Pacer,
}

impl RawFileSource {
    pub fn open(config: RawFileConfig) -> Result<Self, CaptureError> {
        let frame_len = config
            .format
            .frame_len(config.width, config.height)
            .filter(|len| *len > 0)
            .ok_or_else(|| {
                CaptureError::InvalidConfig(format!(
                    "raw file source cannot read {:?} frames of {}x{}",
                    config.format, config.width, config.height
                ))
            })?;

        info!("Opening raw frame file {}", config.path.display());
        let file = File::open(&config.path)?;
        let pacer = Pacer::new(config.fps, config.realtime);

        Ok(Self {
            reader: BufReader::new(file),
            frame_len,
            sequence: 0,
            pacer,
            config,
        })
    }
}

impl FrameSource for RawFileSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let mut buf = vec![0u8; self.frame_len];
        match self.reader.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                debug!(
                    "Raw file {} exhausted after {} frames",
                    self.config.path.display(),
                    self.sequence
                );
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        self.pacer.wait();
        self.sequence += 1;
        Ok(Some(Frame::new(
            self.sequence,
            self.config.width,
            self.config.height,
            self.config.format,
            Bytes::from(buf),
        )))
    }

    fn describe(&self) -> String {
        format!("raw file {}", self.config.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn synthetic_source_respects_frame_limit() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: 8,
            height: 8,
            frame_limit: Some(3),
            realtime: false,
            ..Default::default()
        })
        .unwrap();

        let mut sequences = Vec::new();
        while let Some(frame) = source.next_frame().unwrap() {
            assert_eq!(frame.data.len(), 8 * 8 * 3);
            sequences.push(frame.sequence());
        }
        assert_eq!(sequences, vec![1, 2, 3]);
    }

    #[test]
    fn synthetic_block_only_during_event() {
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: 16,
            height: 16,
            event_period: 10,
            event_length: 2,
            realtime: false,
            ..Default::default()
        })
        .unwrap();

        let bright = |f: &Frame| f.data.iter().any(|&b| b > 200);
        let frames: Vec<Frame> = (0..10).map(|_| source.next_frame().unwrap().unwrap()).collect();
        assert!(bright(&frames[0]));
        assert!(bright(&frames[1]));
        assert!(!bright(&frames[2]));
        assert!(!bright(&frames[9]));
    }

    #[test]
    fn raw_file_source_reads_whole_frames_only() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // two full 2x1 RGB frames plus a truncated tail
        file.write_all(&[1, 1, 1, 2, 2, 2, 3, 3, 3, 4, 4, 4, 9, 9]).unwrap();

        let mut source = RawFileSource::open(RawFileConfig {
            path: file.path().to_path_buf(),
            width: 2,
            height: 1,
            format: PixelFormat::Rgb24,
            fps: 20,
            realtime: false,
        })
        .unwrap();

        let first = source.next_frame().unwrap().unwrap();
        let second = source.next_frame().unwrap().unwrap();
        assert_eq!(&first.data[..], &[1, 1, 1, 2, 2, 2]);
        assert_eq!(second.sequence(), 2);
        assert!(source.next_frame().unwrap().is_none());
    }

    #[test]
    fn raw_file_source_rejects_mjpeg() {
        let result = RawFileSource::open(RawFileConfig {
            path: PathBuf::from("/nonexistent"),
            width: 2,
            height: 2,
            format: PixelFormat::Mjpeg,
            fps: 20,
            realtime: false,
        });
        assert!(matches!(result, Err(CaptureError::InvalidConfig(_))));
    }

    #[test]
    fn raw_file_source_rejects_odd_nv12() {
        let result = RawFileSource::open(RawFileConfig {
            path: PathBuf::from("/nonexistent"),
            width: 3,
            height: 3,
            format: PixelFormat::Nv12,
            fps: 20,
            realtime: false,
        });
        assert!(matches!(result, Err(CaptureError::InvalidConfig(_))));
    }
}
