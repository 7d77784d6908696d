//! Pixel conversion for sinks and detectors that need raw pixels

use zune_jpeg::JpegDecoder;

use super::frame::{Frame, PixelFormat};
use crate::error::CaptureError;

/// Decode any supported frame payload into packed RGB24.
pub fn decode_frame(frame: &Frame) -> Result<Vec<u8>, CaptureError> {
    let (width, height) = frame.dimensions();
    let data = &frame.data[..];
    let pixels = width as usize * height as usize;

    match frame.format() {
        PixelFormat::Mjpeg => {
            let mut decoder = JpegDecoder::new(data);
            let decoded = decoder
                .decode()
                .map_err(|e| CaptureError::Decode(format!("{:?}", e)))?;
            if decoded.len() == pixels * 3 {
                Ok(decoded)
            } else if decoded.len() == pixels {
                // Grayscale JPEG
                Ok(decoded.iter().flat_map(|&y| [y, y, y]).collect())
            } else {
                Err(CaptureError::Decode(format!(
                    "jpeg decoded to {} bytes, expected {}x{} RGB",
                    decoded.len(),
                    width,
                    height
                )))
            }
        }
        PixelFormat::Rgb24 => {
            // Already in RGB format
            packed_rows(frame, 3)
        }
        PixelFormat::Bgr24 => {
            let mut rgb = packed_rows(frame, 3)?;
            for px in rgb.chunks_exact_mut(3) {
                px.swap(0, 2);
            }
            Ok(rgb)
        }
        PixelFormat::Yuyv4 => {
            let packed = packed_rows(frame, 2)?;
            let mut rgb = Vec::with_capacity(pixels * 3);
            for quad in packed.chunks_exact(4) {
                let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
                rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
                rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
            }
            Ok(rgb)
        }
        PixelFormat::Nv12 => {
            if width % 2 != 0 || height % 2 != 0 {
                return Err(CaptureError::Decode(format!(
                    "nv12 frame #{} has odd geometry {}x{}",
                    frame.sequence(),
                    width,
                    height
                )));
            }
            let expected = pixels + pixels / 2;
            if data.len() < expected {
                return Err(short_payload(frame, expected));
            }
            let (luma, chroma) = data.split_at(pixels);
            let w = width as usize;
            let mut rgb = Vec::with_capacity(pixels * 3);
            for row in 0..height as usize {
                for col in 0..w {
                    let y = luma[row * w + col];
                    let uv = (row / 2) * w + (col / 2) * 2;
                    rgb.extend_from_slice(&yuv_to_rgb(y, chroma[uv], chroma[uv + 1]));
                }
            }
            Ok(rgb)
        }
    }
}

/// Luma plane of a frame, one byte per pixel.
pub fn luma_plane(frame: &Frame) -> Result<Vec<u8>, CaptureError> {
    let (width, height) = frame.dimensions();
    let pixels = width as usize * height as usize;
    match frame.format() {
        PixelFormat::Nv12 => {
            if frame.data.len() < pixels {
                return Err(short_payload(frame, pixels));
            }
            Ok(frame.data[..pixels].to_vec())
        }
        PixelFormat::Yuyv4 => Ok(packed_rows(frame, 2)?
            .chunks_exact(2)
            .map(|pair| pair[0])
            .collect()),
        _ => Ok(decode_frame(frame)?
            .chunks_exact(3)
            .map(|px| rgb_luma(px[0], px[1], px[2]))
            .collect()),
    }
}

/// BT.601 luma.
pub fn rgb_luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}

fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let r = c + ((359 * e) >> 8);
    let g = c - ((88 * d + 183 * e) >> 8);
    let b = c + ((454 * d) >> 8);
    [clamp(r), clamp(g), clamp(b)]
}

fn clamp(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}

/// Copy rows out of a possibly padded buffer into a tightly packed one.
fn packed_rows(frame: &Frame, bytes_per_pixel: usize) -> Result<Vec<u8>, CaptureError> {
    let (width, height) = frame.dimensions();
    let row = width as usize * bytes_per_pixel;
    let stride = (frame.meta.stride as usize).max(row);
    let rows = height as usize;
    let expected = if rows == 0 { 0 } else { stride * (rows - 1) + row };
    if frame.data.len() < expected {
        return Err(short_payload(frame, expected));
    }
    if stride == row {
        return Ok(frame.data[..row * rows].to_vec());
    }
    let mut packed = Vec::with_capacity(row * rows);
    for r in 0..rows {
        let start = r * stride;
        packed.extend_from_slice(&frame.data[start..start + row]);
    }
    Ok(packed)
}

fn short_payload(frame: &Frame, expected: usize) -> CaptureError {
    CaptureError::Decode(format!(
        "frame #{} has {} bytes, expected at least {}",
        frame.sequence(),
        frame.data.len(),
        expected
    ))
}
