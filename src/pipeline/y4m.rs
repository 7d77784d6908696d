//! YUV4MPEG2 clip writer

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::sink::{FrameSink, SinkParams};
use crate::capture::decoder::{decode_frame, rgb_luma};
use crate::capture::Frame;
use crate::error::SinkError;

/// Writes 4:4:4 planar frames behind a single stream header.
pub struct Y4mSink {
    path: PathBuf,
    params: SinkParams,
    writer: BufWriter<File>,
    frames: u64,
    planes: Vec<u8>,
}

impl Y4mSink {
    pub fn create(path: &Path, params: SinkParams) -> Result<Self, SinkError> {
        params.validate()?;
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(
            writer,
            "YUV4MPEG2 W{} H{} F{}:1 Ip A1:1 C444",
            params.width, params.height, params.fps
        )?;
        debug!("Opened y4m clip {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            params,
            writer,
            frames: 0,
            planes: Vec::new(),
        })
    }
}

impl FrameSink for Y4mSink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.params.check_geometry(frame)?;
        let rgb = decode_frame(frame)?;
        let pixels = self.params.width as usize * self.params.height as usize;
        if rgb.len() != pixels * 3 {
            return Err(SinkError::Encode(format!(
                "frame #{} decoded to {} bytes, expected {}",
                frame.sequence(),
                rgb.len(),
                pixels * 3
            )));
        }

        self.planes.clear();
        self.planes.resize(pixels * 3, 0);
        let (luma, chroma) = self.planes.split_at_mut(pixels);
        let (cb, cr) = chroma.split_at_mut(pixels);
        for (i, px) in rgb.chunks_exact(3).enumerate() {
            let [y, u, v] = rgb_to_ycbcr(px[0], px[1], px[2]);
            luma[i] = y;
            cb[i] = u;
            cr[i] = v;
        }

        self.writer.write_all(b"FRAME\n")?;
        self.writer.write_all(&self.planes)?;
        self.frames += 1;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<u64, SinkError> {
        let Y4mSink {
            path,
            writer,
            frames,
            ..
        } = *self;
        let file = writer
            .into_inner()
            .map_err(|e| SinkError::Io(e.into_error()))?;
        file.sync_all()?;
        debug!("Closed y4m clip {} ({} frames)", path.display(), frames);
        Ok(frames)
    }
}

/// Full-range BT.601 conversion.
fn rgb_to_ycbcr(r: u8, g: u8, b: u8) -> [u8; 3] {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let cb = 128 + ((-43 * r - 85 * g + 128 * b) >> 8);
    let cr = 128 + ((128 * r - 107 * g - 21 * b) >> 8);
    [
        rgb_luma(r as u8, g as u8, b as u8),
        cb.clamp(0, 255) as u8,
        cr.clamp(0, 255) as u8,
    ]
}
