//! Clip as a directory of numbered JPEG stills

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::debug;

use super::sink::{FrameSink, SinkParams};
use crate::capture::decoder::decode_frame;
use crate::capture::{Frame, PixelFormat};
use crate::error::SinkError;

pub struct JpegSequenceSink {
    dir: PathBuf,
    params: SinkParams,
    quality: u8,
    frames: u64,
}

impl JpegSequenceSink {
    pub fn create(dir: &Path, params: SinkParams, quality: u8) -> Result<Self, SinkError> {
        params.validate()?;
        fs::create_dir(dir)?;
        debug!("Opened jpeg sequence {}", dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            params,
            quality,
            frames: 0,
        })
    }

    fn next_path(&self) -> PathBuf {
        self.dir.join(format!("frame-{:06}.jpg", self.frames + 1))
    }
}

impl FrameSink for JpegSequenceSink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        self.params.check_geometry(frame)?;
        let path = self.next_path();

        if frame.format() == PixelFormat::Mjpeg {
            // Already compressed by the camera
            fs::write(&path, &frame.data)?;
        } else {
            let rgb = decode_frame(frame)?;
            let mut writer = BufWriter::new(File::create(&path)?);
            JpegEncoder::new_with_quality(&mut writer, self.quality)
                .encode(
                    &rgb,
                    self.params.width,
                    self.params.height,
                    ExtendedColorType::Rgb8,
                )
                .map_err(|e| SinkError::Encode(e.to_string()))?;
            writer.flush()?;
        }

        self.frames += 1;
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<u64, SinkError> {
        debug!(
            "Closed jpeg sequence {} ({} frames)",
            self.dir.display(),
            self.frames
        );
        Ok(self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_file_per_frame() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("clip");
        let params = SinkParams {
            width: 4,
            height: 4,
            fps: 10,
        };

        let mut sink: Box<dyn FrameSink> =
            Box::new(JpegSequenceSink::create(&dir, params, 80).unwrap());
        for seq in 1..=2 {
            sink.append(&Frame::new(seq, 4, 4, PixelFormat::Rgb24, vec![200u8; 48]))
                .unwrap();
        }
        assert_eq!(sink.close().unwrap(), 2);

        let first = image::open(dir.join("frame-000001.jpg")).unwrap();
        assert_eq!((first.width(), first.height()), (4, 4));
        assert!(dir.join("frame-000002.jpg").exists());
    }

    #[test]
    fn mjpeg_frames_are_copied_verbatim() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("clip");
        let params = SinkParams {
            width: 2,
            height: 2,
            fps: 10,
        };
        let mut sink = JpegSequenceSink::create(&dir, params, 80).unwrap();
        let payload = vec![0xFFu8, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        sink.append(&Frame::new(1, 2, 2, PixelFormat::Mjpeg, payload.clone()))
            .unwrap();
        assert_eq!(fs::read(dir.join("frame-000001.jpg")).unwrap(), payload);
    }
}
