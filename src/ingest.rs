//! The ingestion loop: source → detector → recorder

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::capture::{resize_to_width, FrameSource};
use crate::detect::{annotate, TriggerDetector};
use crate::error::ClipResult;
use crate::recorder::{ClipRecorder, FrameOutcome};
use crate::ProcessingConfig;

/// Give up on a source after this many capture errors in a row.
pub const MAX_CONSECUTIVE_CAPTURE_ERRORS: u32 = 50;
const CAPTURE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndOfStream,
    Cancelled,
    SourceFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub frames: u64,
    pub triggered_frames: u64,
    pub clips_finished: u64,
    pub errors: u64,
    pub stop_reason: StopReason,
}

/// Pull frames until end of stream, cancellation or a dead source, then shut
/// the recorder down. The shutdown runs on every exit path.
pub fn run<S, D>(
    source: &mut S,
    detector: &mut D,
    recorder: &mut ClipRecorder,
    processing: &ProcessingConfig,
    cancel: &AtomicBool,
) -> ClipResult<IngestSummary>
where
    S: FrameSource + ?Sized,
    D: TriggerDetector + ?Sized,
{
    info!("Detecting motion and storing clips from {}", source.describe());

    let mut summary = IngestSummary {
        frames: 0,
        triggered_frames: 0,
        clips_finished: 0,
        errors: 0,
        stop_reason: StopReason::Cancelled,
    };
    let mut consecutive_errors = 0u32;

    summary.stop_reason = loop {
        if cancel.load(Ordering::Acquire) {
            info!("Ingestion cancelled");
            break StopReason::Cancelled;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("The stream has ended");
                break StopReason::EndOfStream;
            }
            Err(e) => {
                summary.errors += 1;
                consecutive_errors += 1;
                error!("Capture error: {}", e);
                if consecutive_errors >= MAX_CONSECUTIVE_CAPTURE_ERRORS {
                    error!("Giving up after {} consecutive capture errors", consecutive_errors);
                    break StopReason::SourceFailed;
                }
                thread::sleep(CAPTURE_RETRY_DELAY);
                continue;
            }
        };
        consecutive_errors = 0;
        summary.frames += 1;

        let frame = match processing.resize_width {
            Some(width) => match resize_to_width(&frame, width) {
                Ok(resized) => resized,
                Err(e) => {
                    summary.errors += 1;
                    warn!("Skipping frame #{}: {}", frame.sequence(), e);
                    continue;
                }
            },
            None => frame,
        };

        let trigger = detector.detect(&frame);
        let frame = if trigger {
            summary.triggered_frames += 1;
            if processing.annotate {
                annotate(&frame, detector.regions()).unwrap_or_else(|e| {
                    debug!("Frame #{} recorded without overlay: {}", frame.sequence(), e);
                    frame.clone()
                })
            } else {
                frame
            }
        } else {
            frame
        };

        match recorder.on_frame(frame, trigger) {
            Ok(FrameOutcome::Started { path, backfilled }) => {
                debug!("Motion detected, clip {} ({} pre-roll)", path.display(), backfilled);
            }
            Ok(FrameOutcome::Finished(_)) => summary.clips_finished += 1,
            Ok(FrameOutcome::Idle | FrameOutcome::Recording) => {}
            Err(e) => {
                // Already logged by the recorder; ingestion carries on
                summary.errors += 1;
                debug!("Recorder error: {}", e);
            }
        }
    };

    match recorder.shutdown() {
        Ok(Some(_)) => summary.clips_finished += 1,
        Ok(None) => {}
        Err(e) => {
            warn!("Final clip did not finish cleanly");
            return Err(e);
        }
    }

    info!(
        "Ingestion stopped ({:?}): {} frames, {} clips, {} errors",
        summary.stop_reason, summary.frames, summary.clips_finished, summary.errors
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{SyntheticConfig, SyntheticSource};
    use crate::detect::{MotionConfig, MotionDetector};
    use crate::error::CaptureError;
    use crate::testing::MemorySinkFactory;
    use crate::{Frame, RecorderConfig};
    use std::sync::Arc;

    fn recorder(factory: &MemorySinkFactory, dir: &tempfile::TempDir) -> ClipRecorder {
        let mut config = RecorderConfig::with_buffer_frames(8);
        config.worker_poll_interval_ms = 10;
        config.output.dir = dir.path().to_path_buf();
        ClipRecorder::new(config, Arc::new(factory.clone())).unwrap()
    }

    #[test]
    fn synthetic_motion_produces_clips() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let mut rec = recorder(&factory, &dir);
        let mut source = SyntheticSource::new(SyntheticConfig {
            width: 64,
            height: 48,
            frame_limit: Some(120),
            event_period: 60,
            event_length: 10,
            realtime: false,
            ..Default::default()
        })
        .unwrap();
        let mut detector = MotionDetector::new(MotionConfig::default()).unwrap();

        let summary = run(
            &mut source,
            &mut detector,
            &mut rec,
            &ProcessingConfig::default(),
            &AtomicBool::new(false),
        )
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::EndOfStream);
        assert_eq!(summary.frames, 120);
        assert!(summary.triggered_frames > 0);
        assert!(factory.open_count() >= 1);
        assert_eq!(summary.clips_finished as usize, factory.open_count());
        for i in 0..factory.open_count() {
            let clip = factory.clip(i).unwrap();
            assert_eq!(clip.close_count(), 1);
            let seqs = clip.sequences();
            assert!(seqs.windows(2).all(|w| w[1] == w[0] + 1), "gap in {:?}", seqs);
        }
        assert!(!rec.is_recording());
    }

    #[test]
    fn cancellation_still_finishes_clip() {
        struct Endless(u64);
        impl FrameSource for Endless {
            fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
                self.0 += 1;
                Ok(Some(Frame::new(self.0, 2, 2, crate::PixelFormat::Rgb24, vec![0u8; 12])))
            }
            fn describe(&self) -> String {
                "endless".into()
            }
        }
        struct CancelAfter<'a>(u64, &'a AtomicBool);
        impl TriggerDetector for CancelAfter<'_> {
            fn detect(&mut self, frame: &Frame) -> bool {
                if frame.sequence() >= self.0 {
                    self.1.store(true, Ordering::Release);
                }
                true
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let mut rec = recorder(&factory, &dir);
        let cancel = AtomicBool::new(false);
        let mut detector = CancelAfter(5, &cancel);

        let summary = run(
            &mut Endless(0),
            &mut detector,
            &mut rec,
            &ProcessingConfig::default(),
            &cancel,
        )
        .unwrap();

        assert_eq!(summary.stop_reason, StopReason::Cancelled);
        assert_eq!(summary.clips_finished, 1);
        let clip = factory.clip(0).unwrap();
        assert_eq!(clip.sequences(), vec![1, 2, 3, 4, 5]);
        assert_eq!(clip.close_count(), 1);
    }

    #[test]
    fn dead_source_gives_up() {
        struct Broken;
        impl FrameSource for Broken {
            fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
                Err(CaptureError::Device("unplugged".into()))
            }
            fn describe(&self) -> String {
                "broken".into()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let mut rec = recorder(&factory, &dir);
        let mut detector = MotionDetector::new(MotionConfig::default()).unwrap();
        let summary = run(
            &mut Broken,
            &mut detector,
            &mut rec,
            &ProcessingConfig::default(),
            &AtomicBool::new(false),
        )
        .unwrap();
        assert_eq!(summary.stop_reason, StopReason::SourceFailed);
        assert_eq!(summary.errors, MAX_CONSECUTIVE_CAPTURE_ERRORS as u64);
    }

    struct Scripted {
        next: u64,
        last: u64,
        block_from: u64,
    }

    impl FrameSource for Scripted {
        fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
            if self.next > self.last {
                return Ok(None);
            }
            let seq = self.next;
            self.next += 1;
            let mut data = vec![60u8; 40 * 40 * 3];
            if seq >= self.block_from {
                for row in 16..24 {
                    data[(row * 40 + 16) * 3..(row * 40 + 24) * 3].fill(240);
                }
            }
            Ok(Some(Frame::new(seq, 40, 40, crate::PixelFormat::Bgr24, data)))
        }

        fn describe(&self) -> String {
            "scripted".into()
        }
    }

    #[test]
    fn frames_are_resized_and_trigger_frames_annotated() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemorySinkFactory::new();
        let mut rec = recorder(&factory, &dir);
        let mut source = Scripted {
            next: 1,
            last: 10,
            block_from: 9,
        };
        let mut detector = MotionDetector::new(MotionConfig {
            warmup_frames: 2,
            sample_step: 1,
            ..Default::default()
        })
        .unwrap();
        let processing = ProcessingConfig {
            resize_width: Some(20),
            annotate: true,
        };

        let summary = run(
            &mut source,
            &mut detector,
            &mut rec,
            &processing,
            &AtomicBool::new(false),
        )
        .unwrap();

        assert!(summary.triggered_frames >= 1);
        let params = factory.params(0).unwrap();
        assert_eq!((params.width, params.height), (20, 20));

        let green = |frame: &Frame| frame.data.chunks_exact(3).any(|px| px == [0, 255, 0]);
        let clip = factory.clip(0).unwrap();
        let trigger = clip.frame(9).unwrap();
        assert_eq!(trigger.dimensions(), (20, 20));
        assert!(green(&trigger));
        assert!(!green(&clip.frame(1).unwrap()));
    }
}
