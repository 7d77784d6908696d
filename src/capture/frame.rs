use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Frame data with zero-copy semantics
#[derive(Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Pixel formats we support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Yuyv4,
    Mjpeg,
    Nv12,
}

impl PixelFormat {
    /// Payload size of one frame, `None` for compressed formats.
    pub fn frame_len(self, width: u32, height: u32) -> Option<usize> {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => Some(pixels * 3),
            // Chroma is shared across pixel pairs, so subsampled axes must be even
            PixelFormat::Yuyv4 if width % 2 == 0 => Some(pixels * 2),
            PixelFormat::Nv12 if width % 2 == 0 && height % 2 == 0 => {
                Some(pixels + pixels / 2)
            }
            PixelFormat::Yuyv4 | PixelFormat::Nv12 => None,
            PixelFormat::Mjpeg => None,
        }
    }

    /// Row stride in bytes (luma plane for Nv12).
    pub fn stride(self, width: u32) -> u32 {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => width * 3,
            PixelFormat::Yuyv4 => width * 2,
            PixelFormat::Nv12 | PixelFormat::Mjpeg => width,
        }
    }
}

impl Frame {
    pub fn new(
        sequence: u64,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            data: data.into(),
            meta: Arc::new(FrameMetadata {
                sequence,
                width,
                height,
                stride: format.stride(width),
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    /// Same capture identity carrying new packed RGB24 pixels.
    pub fn with_rgb(&self, width: u32, height: u32, rgb: Vec<u8>) -> Frame {
        Frame {
            data: rgb.into(),
            meta: Arc::new(FrameMetadata {
                sequence: self.meta.sequence,
                width,
                height,
                stride: PixelFormat::Rgb24.stride(width),
                format: PixelFormat::Rgb24,
                device_timestamp: self.meta.device_timestamp,
            }),
            timestamp: self.timestamp,
        }
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.meta.width, self.meta.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("len", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_len_matches_format() {
        assert_eq!(PixelFormat::Rgb24.frame_len(4, 2), Some(24));
        assert_eq!(PixelFormat::Yuyv4.frame_len(4, 2), Some(16));
        assert_eq!(PixelFormat::Nv12.frame_len(4, 2), Some(12));
        assert_eq!(PixelFormat::Mjpeg.frame_len(4, 2), None);
    }

    #[test]
    fn odd_subsampled_geometry_has_no_frame_len() {
        assert_eq!(PixelFormat::Nv12.frame_len(3, 3), None);
        assert_eq!(PixelFormat::Nv12.frame_len(4, 3), None);
        assert_eq!(PixelFormat::Yuyv4.frame_len(3, 2), None);
        assert_eq!(PixelFormat::Rgb24.frame_len(3, 3), Some(27));
    }

    #[test]
    fn clones_share_payload() {
        let frame = Frame::new(7, 2, 1, PixelFormat::Rgb24, vec![1u8, 2, 3, 4, 5, 6]);
        let copy = frame.clone();
        assert_eq!(copy.sequence(), 7);
        assert_eq!(copy.data.as_ptr(), frame.data.as_ptr());
        assert_eq!(copy.meta.stride, 6);
    }
}
