//! Per-frame trigger classification
//!
//! The recorder only consumes a boolean per frame. `MotionDetector` is a
//! small background-subtraction classifier: it keeps a running-average luma
//! model, cleans the changed-pixel mask with erosion and dilation, and fires
//! when a large enough blob survives.

mod annotate;

pub use annotate::annotate;

use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

use crate::capture::decoder::luma_plane;
use crate::capture::Frame;
use crate::error::{ClipError, ClipResult};

/// Decides whether an event of interest is present in a frame.
pub trait TriggerDetector: Send {
    fn detect(&mut self, frame: &Frame) -> bool;

    /// Where the last positive detection saw motion, in frame pixels.
    fn regions(&self) -> &[MotionRegion] {
        &[]
    }

    /// Forget any learned state, e.g. after a stream discontinuity.
    fn reset(&mut self) {}
}

/// Bounding box of one moving blob, in frame pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl MotionRegion {
    pub fn center(&self) -> (u32, u32) {
        (self.x + self.width / 2, self.y + self.height / 2)
    }

    /// Radius of the circle through the box corners.
    pub fn radius(&self) -> f32 {
        let (w, h) = (self.width as f32, self.height as f32);
        (w * w + h * h).sqrt() / 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Luma difference for a pixel to count as changed
    pub pixel_threshold: u8,
    /// Fraction of sampled pixels that must stay changed after cleanup
    pub min_area: f32,
    /// Weight of the newest frame in the background model
    pub learning_rate: f32,
    /// Frames used to settle the model before triggering is allowed
    pub warmup_frames: u32,
    /// Sample every Nth pixel in both directions
    pub sample_step: u32,
    /// Side of the square cleanup kernel, in samples; must be odd
    pub kernel_size: u32,
    pub erode_iterations: u32,
    pub dilate_iterations: u32,
    /// Blobs smaller than this radius in pixels are ignored
    pub min_radius: f32,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            pixel_threshold: 25,
            min_area: 0.01,
            learning_rate: 0.05,
            warmup_frames: 5,
            sample_step: 2,
            kernel_size: 3,
            erode_iterations: 1,
            dilate_iterations: 2,
            min_radius: 3.0,
        }
    }
}

impl MotionConfig {
    pub fn validate(&self) -> ClipResult<()> {
        if !(self.min_area > 0.0 && self.min_area <= 1.0) {
            return Err(ClipError::config("detector.min_area must be in (0, 1]"));
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            return Err(ClipError::config(
                "detector.learning_rate must be in (0, 1]",
            ));
        }
        if self.sample_step == 0 {
            return Err(ClipError::config("detector.sample_step must be positive"));
        }
        if self.kernel_size % 2 == 0 {
            return Err(ClipError::config("detector.kernel_size must be odd"));
        }
        if !(self.min_radius >= 0.0 && self.min_radius.is_finite()) {
            return Err(ClipError::config("detector.min_radius must be a non-negative number"));
        }
        Ok(())
    }
}

pub struct MotionDetector {
    config: MotionConfig,
    background: Vec<f32>,
    geometry: (u32, u32),
    frames_seen: u32,
    samples: Vec<u8>,
    mask: Vec<bool>,
    scratch: Vec<bool>,
    regions: Vec<MotionRegion>,
}

impl MotionDetector {
    pub fn new(config: MotionConfig) -> ClipResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            background: Vec::new(),
            geometry: (0, 0),
            frames_seen: 0,
            samples: Vec::new(),
            mask: Vec::new(),
            scratch: Vec::new(),
            regions: Vec::new(),
        })
    }

    /// Update the model and the cleaned mask. Returns the fraction of samples
    /// still set after cleanup, or `None` while the model is being seeded.
    fn analyse(&mut self, frame: &Frame) -> Option<f32> {
        let luma = match luma_plane(frame) {
            Ok(luma) => luma,
            Err(e) => {
                warn!("Motion detector skipped frame #{}: {}", frame.sequence(), e);
                return None;
            }
        };

        let (width, height) = frame.dimensions();
        let step = self.config.sample_step as usize;
        let grid_width = (width as usize).div_ceil(step);
        let grid_height = (height as usize).div_ceil(step);
        self.samples.clear();
        for row in (0..height as usize).step_by(step) {
            for col in (0..width as usize).step_by(step) {
                self.samples.push(luma[row * width as usize + col]);
            }
        }

        if self.geometry != (width, height) || self.background.len() != self.samples.len() {
            self.geometry = (width, height);
            self.background = self.samples.iter().map(|&s| s as f32).collect();
            self.frames_seen = 1;
            return None;
        }

        let threshold = self.config.pixel_threshold as f32;
        let rate = self.config.learning_rate;
        self.mask.clear();
        for (model, &sample) in self.background.iter_mut().zip(&self.samples) {
            let value = sample as f32;
            self.mask.push((value - *model).abs() > threshold);
            *model += rate * (value - *model);
        }
        self.frames_seen = self.frames_seen.saturating_add(1);
        if self.samples.is_empty() {
            return None;
        }

        let radius = (self.config.kernel_size / 2) as usize;
        for _ in 0..self.config.erode_iterations {
            morph(&self.mask, &mut self.scratch, grid_width, grid_height, radius, true);
            std::mem::swap(&mut self.mask, &mut self.scratch);
        }
        for _ in 0..self.config.dilate_iterations {
            morph(&self.mask, &mut self.scratch, grid_width, grid_height, radius, false);
            std::mem::swap(&mut self.mask, &mut self.scratch);
        }

        self.regions.clear();
        for (c0, r0, c1, r1) in blobs(&self.mask, grid_width, grid_height) {
            let x = (c0 * step) as u32;
            let y = (r0 * step) as u32;
            let region = MotionRegion {
                x,
                y,
                width: (((c1 + 1) * step) as u32).min(width) - x,
                height: (((r1 + 1) * step) as u32).min(height) - y,
            };
            if region.radius() >= self.config.min_radius {
                self.regions.push(region);
            }
        }

        let set = self.mask.iter().filter(|&&m| m).count();
        Some(set as f32 / self.mask.len() as f32)
    }
}

impl TriggerDetector for MotionDetector {
    fn detect(&mut self, frame: &Frame) -> bool {
        let fraction = self.analyse(frame);
        let triggered = match fraction {
            Some(fraction) if self.frames_seen > self.config.warmup_frames => {
                trace!(
                    "frame #{} changed fraction {:.4}, {} regions",
                    frame.sequence(),
                    fraction,
                    self.regions.len()
                );
                fraction >= self.config.min_area && !self.regions.is_empty()
            }
            _ => false,
        };
        if !triggered {
            self.regions.clear();
        }
        triggered
    }

    fn regions(&self) -> &[MotionRegion] {
        &self.regions
    }

    fn reset(&mut self) {
        self.background.clear();
        self.regions.clear();
        self.geometry = (0, 0);
        self.frames_seen = 0;
    }
}

/// One square-kernel pass. Erosion keeps a sample only if its whole window
/// is set, dilation sets it if anything in the window is. Samples outside
/// the grid are ignored, so blobs touching the border are not eaten away.
fn morph(
    mask: &[bool],
    out: &mut Vec<bool>,
    width: usize,
    height: usize,
    radius: usize,
    erode: bool,
) {
    out.clear();
    for row in 0..height {
        let rows = row.saturating_sub(radius)..=(row + radius).min(height - 1);
        for col in 0..width {
            let cols = col.saturating_sub(radius)..=(col + radius).min(width - 1);
            let mut window = rows
                .clone()
                .flat_map(|r| cols.clone().map(move |c| mask[r * width + c]));
            out.push(if erode {
                window.all(|m| m)
            } else {
                window.any(|m| m)
            });
        }
    }
}

/// Bounding boxes `(min_col, min_row, max_col, max_row)` of 8-connected blobs.
fn blobs(mask: &[bool], width: usize, height: usize) -> Vec<(usize, usize, usize, usize)> {
    let mut seen = vec![false; mask.len()];
    let mut stack = Vec::new();
    let mut found = Vec::new();

    for start in 0..mask.len() {
        if !mask[start] || seen[start] {
            continue;
        }
        seen[start] = true;
        stack.push(start);
        let (mut c0, mut r0, mut c1, mut r1) = (usize::MAX, usize::MAX, 0, 0);

        while let Some(i) = stack.pop() {
            let (row, col) = (i / width, i % width);
            c0 = c0.min(col);
            r0 = r0.min(row);
            c1 = c1.max(col);
            r1 = r1.max(row);
            for r in row.saturating_sub(1)..=(row + 1).min(height - 1) {
                for c in col.saturating_sub(1)..=(col + 1).min(width - 1) {
                    let j = r * width + c;
                    if mask[j] && !seen[j] {
                        seen[j] = true;
                        stack.push(j);
                    }
                }
            }
        }
        found.push((c0, r0, c1, r1));
    }
    found
}
