//! Trigger-driven clip recording
//!
//! `ClipRecorder` is driven once per ingested frame. Every frame goes into
//! the pre-roll ring buffer; while a clip is open it is also queued for the
//! background writer. A trigger while idle opens a clip, backfills it with the
//! retained history (oldest first) and then the triggering frame. A clip is
//! finished once `idle_timeout` consecutive frames arrive without a trigger,
//! or when the recorder is shut down.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::Frame;
use crate::error::{ClipError, ClipResult};
use crate::pipeline::{
    clip_path, ClipReport, FrameRingBuffer, SinkFactory, SinkParams, WritePipeline,
    WriterSnapshot,
};
use crate::RecorderConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Idle,
    Recording,
}

/// What a single `on_frame` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// No clip open; frame only retained for pre-roll
    Idle,
    /// A clip was opened on this frame
    Started { path: PathBuf, backfilled: usize },
    /// Frame queued to the open clip
    Recording,
    /// The open clip was closed after this frame
    Finished(ClipReport),
}

struct ClipSession {
    pipeline: WritePipeline,
    params: SinkParams,
    geometry_skipped: u64,
}

impl ClipSession {
    /// Frames of another size than the one the sink was opened with are skipped.
    fn enqueue(&mut self, frame: Frame) -> bool {
        let (width, height) = frame.dimensions();
        if (width, height) != (self.params.width, self.params.height) {
            self.geometry_skipped += 1;
            if self.geometry_skipped == 1 {
                warn!(
                    "Skipping {}x{} frame #{} for {}x{} clip {}",
                    width,
                    height,
                    frame.sequence(),
                    self.params.width,
                    self.params.height,
                    self.pipeline.path().display()
                );
            }
            return false;
        }
        self.pipeline.enqueue(frame)
    }
}

pub struct ClipRecorder {
    config: RecorderConfig,
    idle_timeout: usize,
    poll_interval: Duration,
    factory: Arc<dyn SinkFactory>,
    ring: FrameRingBuffer,
    session: Option<ClipSession>,
    frames_since_trigger: usize,
    frames_since_session_start: u64,
    clips_started: u64,
    shut_down: bool,
}

impl ClipRecorder {
    /// Validates the configuration and prepares the output directory.
    /// No writer thread exists until the first trigger.
    pub fn new(config: RecorderConfig, factory: Arc<dyn SinkFactory>) -> ClipResult<Self> {
        config.validate()?;
        let ring = FrameRingBuffer::new(config.buffer_frames)?;
        fs::create_dir_all(&config.output.dir).map_err(|e| {
            ClipError::config(format!(
                "cannot create output directory {}: {}",
                config.output.dir.display(),
                e
            ))
        })?;

        info!(
            "Clip recorder ready: {} frame pre-roll, {} frame idle timeout, output {}",
            config.buffer_frames,
            config.idle_timeout(),
            config.output.dir.display()
        );

        Ok(Self {
            idle_timeout: config.idle_timeout(),
            poll_interval: config.poll_interval(),
            config,
            factory,
            ring,
            session: None,
            frames_since_trigger: 0,
            frames_since_session_start: 0,
            clips_started: 0,
            shut_down: false,
        })
    }

    /// Feed one frame with its trigger signal.
    ///
    /// Only a failure to open a new clip (`SinkOpen`) or to finish one
    /// (`Shutdown`) is returned; in both cases the recorder is left idle and
    /// can keep ingesting.
    pub fn on_frame(&mut self, frame: Frame, trigger: bool) -> ClipResult<FrameOutcome> {
        let mut outcome = match self.session {
            Some(_) => FrameOutcome::Recording,
            None => FrameOutcome::Idle,
        };
        let mut open_error = None;

        if trigger {
            self.frames_since_trigger = 0;
            if self.session.is_none() {
                if self.shut_down {
                    debug!("Ignoring trigger on frame #{} after shutdown", frame.sequence());
                } else {
                    match self.open_session(&frame) {
                        Ok(started) => outcome = started,
                        Err(e) => open_error = Some(e),
                    }
                }
            }
        } else {
            self.frames_since_trigger = self.frames_since_trigger.saturating_add(1);
        }

        self.ring.push(frame.clone());

        if let Some(session) = self.session.as_mut() {
            session.enqueue(frame);
            self.frames_since_session_start += 1;

            if self.frames_since_trigger >= self.idle_timeout {
                debug!(
                    "No trigger for {} frames, closing clip",
                    self.frames_since_trigger
                );
                return self.finish_session().map(FrameOutcome::Finished);
            }
        }

        match open_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// Finish any open clip, blocking until it is fully written.
    ///
    /// Safe to call repeatedly and when nothing was ever recorded; later
    /// triggers no longer open clips.
    pub fn shutdown(&mut self) -> ClipResult<Option<ClipReport>> {
        if self.shut_down {
            return Ok(None);
        }
        self.shut_down = true;

        if self.session.is_none() {
            info!("Clip recorder shut down (idle)");
            return Ok(None);
        }
        info!("Clip recorder shutting down, finishing open clip");
        self.finish_session().map(Some)
    }

    pub fn state(&self) -> RecorderState {
        match self.session {
            Some(_) => RecorderState::Recording,
            None => RecorderState::Idle,
        }
    }

    pub fn is_recording(&self) -> bool {
        self.session.is_some()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn frames_since_trigger(&self) -> usize {
        self.frames_since_trigger
    }

    pub fn frames_since_session_start(&self) -> u64 {
        self.frames_since_session_start
    }

    pub fn clips_started(&self) -> u64 {
        self.clips_started
    }

    pub fn buffered_frames(&self) -> usize {
        self.ring.len()
    }

    pub fn current_clip(&self) -> Option<&Path> {
        self.session.as_ref().map(|s| s.pipeline.path())
    }

    pub fn writer_snapshot(&self) -> Option<WriterSnapshot> {
        self.session.as_ref().map(|s| s.pipeline.snapshot())
    }

    #[instrument(skip(self, frame), fields(sequence = frame.sequence()))]
    fn open_session(&mut self, frame: &Frame) -> ClipResult<FrameOutcome> {
        let (width, height) = frame.dimensions();
        let params = SinkParams {
            width,
            height,
            fps: self.config.output.fps,
        };
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let path = clip_path(
            &self.config.output.dir,
            &self.config.output.prefix,
            &stamp,
            self.factory.extension(),
        );

        let sink = self.factory.open(&path, &params).map_err(|source| {
            let err = ClipError::SinkOpen {
                path: path.clone(),
                source,
            };
            warn!("{}; staying idle", err);
            err
        })?;
        let pipeline = WritePipeline::start(sink, &path, self.config.queue, self.poll_interval)?;

        let mut session = ClipSession {
            pipeline,
            params,
            geometry_skipped: 0,
        };
        // History only; the triggering frame is queued by the caller
        let mut backfilled = 0;
        for old in self.ring.snapshot() {
            if session.enqueue(old) {
                backfilled += 1;
            }
        }

        self.session = Some(session);
        self.frames_since_session_start = 0;
        self.clips_started += 1;
        metrics::counter!("clip_sessions_started").increment(1);
        info!(
            "Recording {} ({}x{}) with {} pre-roll frames",
            path.display(),
            width,
            height,
            backfilled
        );

        Ok(FrameOutcome::Started { path, backfilled })
    }

    fn finish_session(&mut self) -> ClipResult<ClipReport> {
        let Some(session) = self.session.take() else {
            return Err(ClipError::Shutdown {
                path: PathBuf::new(),
                reason: "no clip is open".into(),
            });
        };
        let geometry_skipped = session.geometry_skipped;

        match session.pipeline.stop() {
            Ok(mut report) => {
                report.geometry_skipped = geometry_skipped;
                if report.write_failures > 0 {
                    warn!(
                        "Clip {} closed with {} failed writes ({} written), last error: {}",
                        report.path.display(),
                        report.write_failures,
                        report.frames_written,
                        report.last_error.as_deref().unwrap_or("unknown")
                    );
                } else {
                    info!(
                        "Clip {} closed: {} frames in {:.1}s",
                        report.path.display(),
                        report.frames_written,
                        report.duration.as_secs_f64()
                    );
                }
                Ok(report)
            }
            Err(e) => {
                error!("{}", e);
                Err(e)
            }
        }
    }
}

impl Drop for ClipRecorder {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("Clip recorder dropped while recording, finishing clip");
            if let Err(e) = self.finish_session() {
                error!("Failed to finish clip on drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::PixelFormat;
    use crate::testing::MemorySinkFactory;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, 4, 4, PixelFormat::Rgb24, vec![0u8; 48])
    }

    fn recorder(buffer: usize, timeout: Option<usize>) -> (ClipRecorder, MemorySinkFactory, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RecorderConfig::with_buffer_frames(buffer);
        config.idle_timeout_frames = timeout;
        config.worker_poll_interval_ms = 10;
        config.output.dir = dir.path().to_path_buf();
        let factory = MemorySinkFactory::new();
        let recorder = ClipRecorder::new(config, Arc::new(factory.clone())).unwrap();
        (recorder, factory, dir)
    }

    #[test]
    fn idle_frames_only_fill_the_ring() {
        let (mut rec, factory, _dir) = recorder(3, None);
        for seq in 1..=5 {
            assert_eq!(rec.on_frame(frame(seq), false).unwrap(), FrameOutcome::Idle);
        }
        assert_eq!(rec.buffered_frames(), 3);
        assert_eq!(rec.state(), RecorderState::Idle);
        assert_eq!(factory.open_count(), 0);
    }

    #[test]
    fn trigger_opens_clip_sized_to_frame() {
        let (mut rec, factory, _dir) = recorder(3, None);
        rec.on_frame(frame(1), false).unwrap();
        let outcome = rec.on_frame(frame(2), true).unwrap();
        assert!(matches!(outcome, FrameOutcome::Started { backfilled: 1, .. }));
        assert_eq!(rec.state(), RecorderState::Recording);
        assert_eq!(
            factory.params(0),
            Some(SinkParams {
                width: 4,
                height: 4,
                fps: 20
            })
        );
        assert!(rec.current_clip().is_some());
    }

    #[test]
    fn counters_track_trigger_gap() {
        let (mut rec, _factory, _dir) = recorder(10, None);
        rec.on_frame(frame(1), true).unwrap();
        rec.on_frame(frame(2), false).unwrap();
        rec.on_frame(frame(3), false).unwrap();
        assert_eq!(rec.frames_since_trigger(), 2);
        assert_eq!(rec.frames_since_session_start(), 3);
        rec.on_frame(frame(4), true).unwrap();
        assert_eq!(rec.frames_since_trigger(), 0);
    }

    #[test]
    fn mismatched_frames_are_skipped() {
        let (mut rec, factory, _dir) = recorder(5, None);
        rec.on_frame(Frame::new(1, 2, 2, PixelFormat::Rgb24, vec![0u8; 12]), false)
            .unwrap();
        rec.on_frame(frame(2), false).unwrap();
        rec.on_frame(frame(3), true).unwrap();
        rec.on_frame(Frame::new(4, 2, 2, PixelFormat::Rgb24, vec![0u8; 12]), true)
            .unwrap();
        rec.on_frame(frame(5), true).unwrap();

        let report = rec.shutdown().unwrap().unwrap();
        assert_eq!(factory.clip(0).unwrap().sequences(), vec![2, 3, 5]);
        assert_eq!(report.geometry_skipped, 2);
    }

    #[test]
    fn no_clips_after_shutdown() {
        let (mut rec, factory, _dir) = recorder(3, None);
        assert_eq!(rec.shutdown().unwrap(), None);
        assert!(rec.is_shut_down());
        assert_eq!(rec.on_frame(frame(1), true).unwrap(), FrameOutcome::Idle);
        assert_eq!(factory.open_count(), 0);
    }

    #[test]
    fn drop_finishes_open_clip() {
        let (mut rec, factory, _dir) = recorder(3, None);
        rec.on_frame(frame(1), true).unwrap();
        rec.on_frame(frame(2), false).unwrap();
        drop(rec);
        let clip = factory.clip(0).unwrap();
        assert_eq!(clip.sequences(), vec![1, 2]);
        assert_eq!(clip.close_count(), 1);
    }
}
