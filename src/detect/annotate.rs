//! Motion overlay drawn into recorded frames

use image::{Rgb, RgbImage};

use super::MotionRegion;
use crate::capture::transform::rgb_image;
use crate::capture::Frame;
use crate::error::CaptureError;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const CIRCLE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LINE_WIDTH: u32 = 2;

/// Draw each region's bounding box and enclosing circle onto a copy of the
/// frame. The result is RGB24 with the same sequence and timestamps.
pub fn annotate(frame: &Frame, regions: &[MotionRegion]) -> Result<Frame, CaptureError> {
    if regions.is_empty() {
        return Ok(frame.clone());
    }
    let mut image = rgb_image(frame)?;
    for region in regions {
        draw_box(&mut image, region);
        draw_circle(&mut image, region);
    }
    let (width, height) = image.dimensions();
    Ok(frame.with_rgb(width, height, image.into_raw()))
}

fn draw_box(image: &mut RgbImage, region: &MotionRegion) {
    let (width, height) = image.dimensions();
    let right = (region.x + region.width).min(width);
    let bottom = (region.y + region.height).min(height);
    for y in region.y..bottom {
        for x in region.x..right {
            let edge = x < region.x + LINE_WIDTH
                || y < region.y + LINE_WIDTH
                || x + LINE_WIDTH >= right
                || y + LINE_WIDTH >= bottom;
            if edge {
                image.put_pixel(x, y, BOX_COLOR);
            }
        }
    }
}

fn draw_circle(image: &mut RgbImage, region: &MotionRegion) {
    let (width, height) = image.dimensions();
    let (cx, cy) = region.center();
    let radius = region.radius();
    let half = LINE_WIDTH as f32 / 2.0;
    let reach = (radius + half).ceil() as i64;

    for dy in -reach..=reach {
        let y = cy as i64 + dy;
        if y < 0 || y >= height as i64 {
            continue;
        }
        for dx in -reach..=reach {
            let x = cx as i64 + dx;
            if x < 0 || x >= width as i64 {
                continue;
            }
            let distance = ((dx * dx + dy * dy) as f32).sqrt();
            if (distance - radius).abs() <= half {
                image.put_pixel(x as u32, y as u32, CIRCLE_COLOR);
            }
        }
    }
}
