//! Whole-frame transforms applied before detection and recording

use image::imageops::{self, FilterType};
use image::RgbImage;

use super::decoder::decode_frame;
use super::frame::Frame;
use crate::error::CaptureError;

/// Scale a frame to `width` pixels wide, keeping its aspect ratio.
///
/// Frames already at that width pass through without a copy. Anything else
/// comes back as RGB24.
pub fn resize_to_width(frame: &Frame, width: u32) -> Result<Frame, CaptureError> {
    let (src_width, src_height) = frame.dimensions();
    if src_width == width {
        return Ok(frame.clone());
    }
    if width == 0 || src_width == 0 || src_height == 0 {
        return Err(CaptureError::Decode(format!(
            "cannot resize frame #{} from {}x{} to width {}",
            frame.sequence(),
            src_width,
            src_height,
            width
        )));
    }

    let height = (src_height as u64 * width as u64 + src_width as u64 / 2) / src_width as u64;
    let height = height.max(1) as u32;
    let image = rgb_image(frame)?;
    let resized = imageops::resize(&image, width, height, FilterType::Triangle);
    Ok(frame.with_rgb(width, height, resized.into_raw()))
}

/// Decode a frame into an owned RGB image.
pub fn rgb_image(frame: &Frame) -> Result<RgbImage, CaptureError> {
    let (width, height) = frame.dimensions();
    RgbImage::from_raw(width, height, decode_frame(frame)?).ok_or_else(|| {
        CaptureError::Decode(format!(
            "frame #{} does not fill {}x{}",
            frame.sequence(),
            width,
            height
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;

    #[test]
    fn downscale_keeps_aspect_and_identity() {
        let frame = Frame::new(42, 40, 30, PixelFormat::Bgr24, vec![90u8; 40 * 30 * 3]);
        let small = resize_to_width(&frame, 20).unwrap();

        assert_eq!(small.dimensions(), (20, 15));
        assert_eq!(small.format(), PixelFormat::Rgb24);
        assert_eq!(small.sequence(), 42);
        assert_eq!(small.timestamp, frame.timestamp);
        assert_eq!(small.data.len(), 20 * 15 * 3);
        assert!(small.data.iter().all(|&b| b == 90));
    }

    #[test]
    fn matching_width_is_shared() {
        let frame = Frame::new(1, 8, 4, PixelFormat::Rgb24, vec![5u8; 8 * 4 * 3]);
        let same = resize_to_width(&frame, 8).unwrap();
        assert_eq!(same.data.as_ptr(), frame.data.as_ptr());
    }

    #[test]
    fn zero_width_is_rejected() {
        let frame = Frame::new(1, 8, 4, PixelFormat::Rgb24, vec![5u8; 8 * 4 * 3]);
        assert!(matches!(resize_to_width(&frame, 0), Err(CaptureError::Decode(_))));
    }
}
