//! Background clip writer
//!
//! One worker thread per open clip owns the sink and drains a flume queue,
//! so storage latency never reaches the ingestion loop. `stop` is the only
//! blocking call: it joins the worker and then flushes anything still queued
//! on the caller's thread before closing the sink.

use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;
use flume::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::sink::FrameSink;
use crate::capture::Frame;
use crate::error::{ClipError, ClipResult, SinkError};

/// Failures logged at warn level before switching to one warning per this many.
const WARN_EVERY: u64 = 100;
const WARN_FIRST: u64 = 3;

/// What happens when frames queue up faster than the sink drains them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", content = "limit", rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Never drop, never block; memory grows with a slow sink
    #[default]
    Unbounded,
    /// Keep at most N queued frames, discarding the oldest
    DropOldest(usize),
    /// Keep at most N queued frames, blocking the producer when full
    Block(usize),
}

impl QueuePolicy {
    pub fn validate(&self) -> ClipResult<()> {
        match self {
            QueuePolicy::DropOldest(0) | QueuePolicy::Block(0) => Err(ClipError::config(
                "bounded write queue needs a positive limit",
            )),
            _ => Ok(()),
        }
    }
}

/// Summary of one finished clip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipReport {
    pub path: PathBuf,
    pub frames_enqueued: u64,
    pub frames_written: u64,
    pub write_failures: u64,
    pub frames_dropped: u64,
    pub geometry_skipped: u64,
    pub last_error: Option<String>,
    pub duration: Duration,
}

#[derive(Default)]
struct WriterStats {
    enqueued: AtomicU64,
    written: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

/// Live counters of a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterSnapshot {
    pub enqueued: u64,
    pub written: u64,
    pub failures: u64,
    pub dropped: u64,
    pub queued: usize,
}

struct WorkerExit {
    sink: Box<dyn FrameSink>,
    last_error: Option<String>,
}

/// Writes one frame, recording failures instead of propagating them.
struct FrameWriter {
    path: PathBuf,
    stats: Arc<CachePadded<WriterStats>>,
    last_error: Option<String>,
}

impl FrameWriter {
    fn write(&mut self, sink: &mut dyn FrameSink, frame: &Frame) {
        let start = Instant::now();
        match sink.append(frame) {
            Ok(()) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("clip_frames_written").increment(1);
                metrics::histogram!("clip_write_time_us")
                    .record(start.elapsed().as_micros() as f64);
            }
            Err(source) => self.record_failure(frame.sequence(), source),
        }
    }

    fn record_failure(&mut self, sequence: u64, source: SinkError) {
        let failures = self.stats.failures.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("clip_write_failures").increment(1);
        let err = ClipError::SinkWrite {
            path: self.path.clone(),
            sequence,
            source,
        };
        if failures <= WARN_FIRST || failures % WARN_EVERY == 0 {
            warn!("{} ({} write failures in this clip)", err, failures);
        } else {
            debug!("{}", err);
        }
        self.last_error = Some(err.to_string());
    }
}

pub struct WritePipeline {
    path: PathBuf,
    policy: QueuePolicy,
    poll_interval: Duration,
    tx: Option<Sender<Frame>>,
    rx: Receiver<Frame>,
    active: Arc<AtomicBool>,
    worker: Option<WorkerHandle>,
    stats: Arc<CachePadded<WriterStats>>,
    started: Instant,
}

impl WritePipeline {
    /// Spawn the worker; it owns `sink` until [`stop`](Self::stop).
    pub fn start(
        sink: Box<dyn FrameSink>,
        path: &Path,
        policy: QueuePolicy,
        poll_interval: Duration,
    ) -> ClipResult<Self> {
        policy.validate()?;
        let (tx, rx) = match policy {
            QueuePolicy::Block(limit) => flume::bounded(limit),
            QueuePolicy::Unbounded | QueuePolicy::DropOldest(_) => flume::unbounded(),
        };
        let active = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(CachePadded::new(WriterStats::default()));

        // The sink reaches the worker only once the thread exists, so a failed
        // spawn still leaves it here to be closed.
        let (sink_tx, sink_rx) = flume::bounded::<Box<dyn FrameSink>>(1);
        let spawned = {
            let rx = rx.clone();
            let active = active.clone();
            let writer = FrameWriter {
                path: path.to_path_buf(),
                stats: stats.clone(),
                last_error: None,
            };
            thread::Builder::new()
                .name("clip-writer".into())
                .spawn(move || {
                    let sink = sink_rx.recv().ok()?;
                    Some(run_worker(sink, rx, active, writer, poll_interval))
                })
        };
        let worker = hand_off_sink(spawned, sink, &sink_tx, path)?;

        Ok(Self {
            path: path.to_path_buf(),
            policy,
            poll_interval,
            tx: Some(tx),
            rx,
            active,
            worker: Some(worker),
            stats,
            started: Instant::now(),
        })
    }

    /// Queue a frame for the worker. Under [`QueuePolicy::Block`] this waits
    /// for queue space while the worker is alive. Returns `false` if the
    /// pipeline has been stopped or the worker has died; the frame then
    /// counts as dropped.
    pub fn enqueue(&self, frame: Frame) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };

        if let QueuePolicy::DropOldest(limit) = self.policy {
            while tx.len() >= limit {
                match self.rx.try_recv() {
                    Ok(old) => {
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!("Write queue full, dropped frame #{}", old.sequence());
                    }
                    // worker emptied it in the meantime
                    Err(_) => break,
                }
            }
        }

        let sent = match self.policy {
            QueuePolicy::Block(_) => self.send_blocking(tx, frame),
            // `rx` lives as long as `self`, so the channel cannot be disconnected
            QueuePolicy::Unbounded | QueuePolicy::DropOldest(_) => tx.send(frame).is_ok(),
        };
        if !sent {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Wait for queue space, giving up once the worker is no longer running.
    fn send_blocking(&self, tx: &Sender<Frame>, mut frame: Frame) -> bool {
        loop {
            if self.worker.as_ref().map_or(true, |h| h.is_finished()) {
                debug!(
                    "Writer for {} is gone, dropping frame #{}",
                    self.path.display(),
                    frame.sequence()
                );
                return false;
            }
            match tx.send_timeout(frame, self.poll_interval) {
                Ok(()) => return true,
                Err(SendTimeoutError::Timeout(back)) => frame = back,
                Err(SendTimeoutError::Disconnected(_)) => return false,
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> WriterSnapshot {
        WriterSnapshot {
            enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            written: self.stats.written.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            queued: self.rx.len(),
        }
    }

    /// Stop accepting frames, wait for the worker, flush the rest and close
    /// the sink. Blocks until every frame queued before the call is written.
    pub fn stop(mut self) -> ClipResult<ClipReport> {
        self.finish()
    }

    fn finish(&mut self) -> ClipResult<ClipReport> {
        self.active.store(false, Ordering::Release);
        // Disconnects the channel; the worker drains what is queued, then exits
        drop(self.tx.take());

        let Some(handle) = self.worker.take() else {
            return Err(self.shutdown_error("writer already stopped".into()));
        };

        let exit = match handle.join() {
            Ok(Some(exit)) => exit,
            Ok(None) => return Err(self.shutdown_error("writer never received its sink".into())),
            Err(panic) => {
                let lost = self.rx.try_iter().count() as u64;
                self.stats.dropped.fetch_add(lost, Ordering::Relaxed);
                return Err(self.shutdown_error(format!(
                    "writer thread panicked: {}; sink released during unwind, {} queued frames lost",
                    panic_message(&*panic),
                    lost
                )));
            }
        };

        let WorkerExit {
            mut sink,
            last_error,
        } = exit;
        let mut writer = FrameWriter {
            path: self.path.clone(),
            stats: self.stats.clone(),
            last_error,
        };

        let mut flushed = 0u64;
        for frame in self.rx.try_iter() {
            writer.write(sink.as_mut(), &frame);
            flushed += 1;
        }
        if flushed > 0 {
            debug!("Final flush wrote {} residual frames", flushed);
        }

        let report = ClipReport {
            path: self.path.clone(),
            frames_enqueued: self.stats.enqueued.load(Ordering::Relaxed),
            frames_written: self.stats.written.load(Ordering::Relaxed),
            write_failures: self.stats.failures.load(Ordering::Relaxed),
            frames_dropped: self.stats.dropped.load(Ordering::Relaxed),
            geometry_skipped: 0,
            last_error: writer.last_error,
            duration: self.started.elapsed(),
        };

        match sink.close() {
            Ok(persisted) => {
                debug!("Sink reports {} frames persisted", persisted);
                Ok(report)
            }
            Err(e) => {
                error!(
                    "Closing {} failed after {} frames written: {}",
                    self.path.display(),
                    report.frames_written,
                    e
                );
                Err(self.shutdown_error(format!("sink close failed: {}", e)))
            }
        }
    }

    fn shutdown_error(&self, reason: String) -> ClipError {
        ClipError::Shutdown {
            path: self.path.clone(),
            reason,
        }
    }
}

impl Drop for WritePipeline {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }
        match self.finish() {
            Ok(report) => info!(
                "Writer for {} stopped on drop ({} frames written)",
                report.path.display(),
                report.frames_written
            ),
            Err(e) => error!("{}", e),
        }
    }
}

type WorkerHandle = JoinHandle<Option<WorkerExit>>;

/// Give `sink` to a freshly spawned worker, or close it if there is none.
fn hand_off_sink(
    spawned: std::io::Result<WorkerHandle>,
    sink: Box<dyn FrameSink>,
    sink_tx: &Sender<Box<dyn FrameSink>>,
    path: &Path,
) -> ClipResult<WorkerHandle> {
    let handle = match spawned {
        Ok(handle) => handle,
        Err(e) => {
            if let Err(close_err) = sink.close() {
                warn!("Closing unused sink for {} failed: {}", path.display(), close_err);
            }
            return Err(ClipError::SinkOpen {
                path: path.to_path_buf(),
                source: SinkError::Io(e),
            });
        }
    };
    if let Err(flume::SendError(sink)) = sink_tx.send(sink) {
        if let Err(close_err) = sink.close() {
            warn!("Closing unused sink for {} failed: {}", path.display(), close_err);
        }
        return Err(ClipError::SinkOpen {
            path: path.to_path_buf(),
            source: SinkError::Io(std::io::Error::other("writer thread exited at startup")),
        });
    }
    Ok(handle)
}

fn run_worker(
    mut sink: Box<dyn FrameSink>,
    rx: Receiver<Frame>,
    active: Arc<AtomicBool>,
    mut writer: FrameWriter,
    poll_interval: Duration,
) -> WorkerExit {
    debug!("Writer started for {}", writer.path.display());
    loop {
        match rx.recv_timeout(poll_interval) {
            Ok(frame) => writer.write(sink.as_mut(), &frame),
            Err(RecvTimeoutError::Timeout) => {
                if !active.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Writer exiting for {}", writer.path.display());
    WorkerExit {
        sink,
        last_error: writer.last_error,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".into()
    }
}
