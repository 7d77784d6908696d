//! In-memory sinks for exercising the recorder without touching disk

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::capture::Frame;
use crate::error::SinkError;
use crate::pipeline::{FrameSink, SinkFactory, SinkParams};

type FailFn = Arc<dyn Fn(u64) -> bool + Send + Sync>;

#[derive(Debug, Default)]
struct ClipLogInner {
    frames: Vec<Frame>,
    closes: usize,
}

/// What one sink received: appended frames and close calls.
#[derive(Debug, Clone, Default)]
pub struct ClipLog(Arc<Mutex<ClipLogInner>>);

impl ClipLog {
    fn lock(&self) -> MutexGuard<'_, ClipLogInner> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sequences(&self) -> Vec<u64> {
        self.lock().frames.iter().map(Frame::sequence).collect()
    }

    /// The appended frame with this sequence, pixels included.
    pub fn frame(&self, sequence: u64) -> Option<Frame> {
        self.lock()
            .frames
            .iter()
            .find(|frame| frame.sequence() == sequence)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close_count(&self) -> usize {
        self.lock().closes
    }
}

pub struct MemorySink {
    log: ClipLog,
    delay: Option<Duration>,
    fail: Option<FailFn>,
    panic_on: Option<u64>,
}

impl MemorySink {
    pub fn new() -> (Self, ClipLog) {
        let log = ClipLog::default();
        (
            Self {
                log: log.clone(),
                delay: None,
                fail: None,
                panic_on: None,
            },
            log,
        )
    }

    /// Sleep this long inside every append.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Fail appends of frames whose sequence matches.
    pub fn failing_on(mut self, fail: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        self.fail = Some(Arc::new(fail));
        self
    }

    /// Panic while appending the frame with this sequence.
    pub fn panicking_on(mut self, sequence: u64) -> Self {
        self.panic_on = Some(sequence);
        self
    }
}

impl FrameSink for MemorySink {
    fn append(&mut self, frame: &Frame) -> Result<(), SinkError> {
        if let Some(delay) = self.delay {
            thread::sleep(delay);
        }
        let sequence = frame.sequence();
        if self.panic_on == Some(sequence) {
            panic!("memory sink told to panic on frame #{}", sequence);
        }
        if self.fail.as_ref().is_some_and(|fail| fail(sequence)) {
            return Err(SinkError::Io(std::io::Error::other(format!(
                "injected failure on frame #{}",
                sequence
            ))));
        }
        self.log.lock().frames.push(frame.clone());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<u64, SinkError> {
        let mut log = self.log.lock();
        log.closes += 1;
        Ok(log.frames.len() as u64)
    }
}

#[derive(Default)]
struct FactoryState {
    clips: Vec<(PathBuf, SinkParams, ClipLog)>,
    fail_open: bool,
    delay: Option<Duration>,
    fail: Option<FailFn>,
}

/// Hands out [`MemorySink`]s and remembers every clip it opened.
///
/// Clones share state, so keep one to inspect after giving the other away.
#[derive(Clone, Default)]
pub struct MemorySinkFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MemorySinkFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FactoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        self.lock().delay = Some(delay);
        self
    }

    pub fn failing_on(self, fail: impl Fn(u64) -> bool + Send + Sync + 'static) -> Self {
        self.lock().fail = Some(Arc::new(fail));
        self
    }

    /// Make subsequent `open` calls fail.
    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn open_count(&self) -> usize {
        self.lock().clips.len()
    }

    pub fn clip(&self, index: usize) -> Option<ClipLog> {
        self.lock().clips.get(index).map(|(_, _, log)| log.clone())
    }

    pub fn params(&self, index: usize) -> Option<SinkParams> {
        self.lock().clips.get(index).map(|(_, params, _)| *params)
    }

    pub fn paths(&self) -> Vec<PathBuf> {
        self.lock().clips.iter().map(|(path, _, _)| path.clone()).collect()
    }
}

impl SinkFactory for MemorySinkFactory {
    fn open(&self, path: &Path, params: &SinkParams) -> Result<Box<dyn FrameSink>, SinkError> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "injected open failure",
            )));
        }
        params.validate()?;

        let (mut sink, log) = MemorySink::new();
        sink.delay = state.delay;
        sink.fail = state.fail.clone();
        state.clips.push((path.to_path_buf(), *params, log));
        Ok(Box::new(sink))
    }

    fn extension(&self) -> &str {
        "mem"
    }
}
