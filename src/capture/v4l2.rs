//! V4L2 camera capture

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::frame::{Frame, FrameMetadata, PixelFormat};
use super::source::FrameSource;
use crate::error::CaptureError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct V4l2Config {
    /// Device node; empty means auto-detect.
    #[serde(default)]
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: PixelFormat,
    #[serde(default = "default_buffer_count")]
    pub buffer_count: u32,
}

fn default_buffer_count() -> u32 {
    4
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: String::new(),
            width: 640,
            height: 480,
            fps: 30,
            format: PixelFormat::Mjpeg,
            buffer_count: default_buffer_count(),
        }
    }
}

/// V4L2 capture over memory-mapped buffers
pub struct V4l2Capture {
    // Boxed so the stream's device handle keeps a stable address
    _device: Box<Device>,
    stream: MmapStream<'static>,
    config: V4l2Config,
    sequence: u64,
}

impl V4l2Capture {
    pub fn open(mut config: V4l2Config) -> Result<Self, CaptureError> {
        if config.device.is_empty() {
            let (path, format) = auto_detect_device()?;
            config.device = path;
            config.format = format;
        }
        info!("Initializing V4L2 capture: {}", config.device);

        let device = Device::with_path(&config.device)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::Device(format!(
                "{} doesn't support video capture",
                config.device
            )));
        }

        let mut fmt = device.format()?;
        fmt.width = config.width;
        fmt.height = config.height;
        fmt.fourcc = match config.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
            other => return Err(CaptureError::UnsupportedFormat(other)),
        };

        // The driver may adjust the geometry; trust what it reports back
        let fmt = device.set_format(&fmt)?;
        config.width = fmt.width;
        config.height = fmt.height;

        if config.fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.fps);
            if let Err(e) = device.set_params(&params) {
                warn!("Failed to set {} fps on {}: {}", config.fps, config.device, e);
            }
        }

        let device = Box::new(device);
        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, config.buffer_count)?;
        info!(
            "Capture stream started with {} buffers ({}x{})",
            config.buffer_count, config.width, config.height
        );

        Ok(Self {
            _device: device,
            stream,
            config,
            sequence: 0,
        })
    }
}

impl FrameSource for V4l2Capture {
    #[instrument(skip(self), fields(device = %self.config.device))]
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let timestamp = Instant::now();

        let (buf, meta) = self.stream.next()?;
        let used = (meta.bytesused as usize).min(buf.len());
        let data = Bytes::copy_from_slice(&buf[..used]);

        self.sequence += 1;

        let frame_meta = Arc::new(FrameMetadata {
            sequence: self.sequence,
            width: self.config.width,
            height: self.config.height,
            stride: self.config.format.stride(self.config.width),
            format: self.config.format,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        });

        Ok(Some(Frame {
            data,
            meta: frame_meta,
            timestamp,
        }))
    }

    fn describe(&self) -> String {
        format!(
            "v4l2 {} {}x{} {:?}",
            self.config.device, self.config.width, self.config.height, self.config.format
        )
    }
}

/// Find the first capture-capable node, preferring MJPEG over YUYV.
pub fn auto_detect_device() -> Result<(String, PixelFormat), CaptureError> {
    info!("Auto-detecting capture devices...");

    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }
        if let Ok(formats) = dev.enum_formats() {
            for fmt in formats {
                if fmt.fourcc == FourCC::new(b"MJPG") {
                    info!("Found MJPEG device: {} - {}", path, caps.card);
                    return Ok((path, PixelFormat::Mjpeg));
                } else if fmt.fourcc == FourCC::new(b"YUYV") {
                    info!("Found YUYV device: {} - {}", path, caps.card);
                    return Ok((path, PixelFormat::Yuyv4));
                }
            }
        }
    }

    Err(CaptureError::Device("no suitable capture device found".into()))
}
