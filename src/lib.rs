pub mod capture;
pub mod detect;
pub mod error;
pub mod ingest;
pub mod pipeline;
pub mod recorder;
pub mod testing;

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use capture::{Frame, FrameSource, PixelFormat};
pub use detect::{MotionConfig, MotionDetector, MotionRegion, TriggerDetector};
pub use error::{CaptureError, ClipError, ClipResult, SinkError};
pub use pipeline::{ClipReport, FileSinkFactory, OutputFormat, QueuePolicy, SinkFactory};
pub use recorder::{ClipRecorder, FrameOutcome, RecorderState};

use capture::{RawFileConfig, RawFileSource, SyntheticConfig, SyntheticSource};
#[cfg(feature = "v4l2-capture")]
use capture::{V4l2Capture, V4l2Config};

/// Config file read when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "clipkeeper.toml";
/// Prefix for environment overrides, e.g. `CLIPKEEPER__RECORDER__BUFFER_FRAMES=128`
pub const ENV_PREFIX: &str = "CLIPKEEPER";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub source: SourceConfig,
    pub processing: ProcessingConfig,
    pub detector: MotionConfig,
    pub recorder: RecorderConfig,
}

/// Per-frame transforms between capture and recording
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Scale every frame to this width before detection and recording
    pub resize_width: Option<u32>,
    /// Draw detected motion regions into the recorded frames
    pub annotate: bool,
}

impl ProcessingConfig {
    pub fn validate(&self) -> ClipResult<()> {
        if self.resize_width == Some(0) {
            return Err(ClipError::config("processing.resize_width must be positive"));
        }
        Ok(())
    }
}

/// Where frames come from
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    Synthetic(SyntheticConfig),
    RawFile(RawFileConfig),
    #[cfg(feature = "v4l2-capture")]
    V4l2(V4l2Config),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Synthetic(SyntheticConfig::default())
    }
}

impl SourceConfig {
    pub fn open(&self) -> Result<Box<dyn FrameSource>, CaptureError> {
        Ok(match self {
            SourceConfig::Synthetic(config) => Box::new(SyntheticSource::new(config.clone())?),
            SourceConfig::RawFile(config) => Box::new(RawFileSource::open(config.clone())?),
            #[cfg(feature = "v4l2-capture")]
            SourceConfig::V4l2(config) => Box::new(V4l2Capture::open(config.clone())?),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Pre-roll depth in frames
    pub buffer_frames: usize,
    /// Frames without trigger before a clip closes; defaults to `buffer_frames`
    pub idle_timeout_frames: Option<usize>,
    /// Upper bound on how long an idle writer waits before re-checking for stop
    pub worker_poll_interval_ms: u64,
    pub queue: QueuePolicy,
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub dir: PathBuf,
    pub prefix: String,
    pub format: OutputFormat,
    pub fps: u32,
    pub jpeg_quality: u8,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_frames: 64,
            idle_timeout_frames: None,
            worker_poll_interval_ms: 1000,
            queue: QueuePolicy::Unbounded,
            output: OutputConfig::default(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("clips"),
            prefix: String::new(),
            format: OutputFormat::Y4m,
            fps: 20,
            jpeg_quality: 90,
        }
    }
}

impl RecorderConfig {
    pub fn with_buffer_frames(buffer_frames: usize) -> Self {
        Self {
            buffer_frames,
            ..Self::default()
        }
    }

    pub fn idle_timeout(&self) -> usize {
        self.idle_timeout_frames.unwrap_or(self.buffer_frames)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.worker_poll_interval_ms)
    }

    pub fn validate(&self) -> ClipResult<()> {
        if self.buffer_frames == 0 {
            return Err(ClipError::config("recorder.buffer_frames must be positive"));
        }
        if self.idle_timeout() == 0 {
            return Err(ClipError::config(
                "recorder.idle_timeout_frames must be positive",
            ));
        }
        if self.worker_poll_interval_ms == 0 {
            return Err(ClipError::config(
                "recorder.worker_poll_interval_ms must be positive",
            ));
        }
        if self.output.fps == 0 {
            return Err(ClipError::config("recorder.output.fps must be positive"));
        }
        self.queue.validate()
    }

    /// Sink factory for the configured on-disk format.
    pub fn file_sink_factory(&self) -> FileSinkFactory {
        FileSinkFactory::new(self.output.format, self.output.jpeg_quality)
    }
}

impl Config {
    /// Defaults, then the TOML file, then `CLIPKEEPER__*` environment overrides.
    ///
    /// An explicitly given file must exist; the default one is optional.
    pub fn load(path: Option<&Path>) -> ClipResult<Self> {
        Self::load_with_env(path, Self::environment())
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
    }

    fn load_with_env(path: Option<&Path>, env: config::Environment) -> ClipResult<Self> {
        let (file, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        let config: Config = config::Config::builder()
            .add_source(config::File::from(file.as_path()).required(required))
            .add_source(env)
            .build()
            .and_then(|raw| raw.try_deserialize())
            .map_err(|e| ClipError::config(format!("{}: {}", file.display(), e)))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ClipResult<()> {
        self.processing.validate()?;
        self.detector.validate()?;
        self.recorder.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.recorder.idle_timeout(), 64);
    }

    #[test]
    fn zero_resize_width_is_rejected() {
        let mut config = Config::default();
        config.processing.resize_width = Some(0);
        assert!(matches!(
            config.validate(),
            Err(ClipError::Configuration(_))
        ));
    }

    #[test]
    fn zero_buffer_is_a_configuration_error() {
        let config = RecorderConfig::with_buffer_frames(0);
        assert!(matches!(
            config.validate(),
            Err(ClipError::Configuration(_))
        ));
    }

    #[test]
    fn loads_toml_over_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[source]
kind = "raw_file"
path = "/tmp/frames.raw"
width = 320
height = 240

[processing]
resize_width = 160
annotate = true

[recorder]
buffer_frames = 32
idle_timeout_frames = 10
queue = {{ policy = "drop_oldest", limit = 500 }}

[recorder.output]
dir = "/var/clips"
format = "jpeg"
"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.recorder.buffer_frames, 32);
        assert_eq!(config.recorder.idle_timeout(), 10);
        assert_eq!(config.recorder.queue, QueuePolicy::DropOldest(500));
        assert_eq!(config.recorder.output.format, OutputFormat::Jpeg);
        assert_eq!(config.recorder.output.fps, 20);
        assert_eq!(config.processing.resize_width, Some(160));
        assert!(config.processing.annotate);
        match config.source {
            SourceConfig::RawFile(raw) => {
                assert_eq!(raw.width, 320);
                assert_eq!(raw.format, PixelFormat::Rgb24);
            }
            other => panic!("unexpected source {:?}", other),
        }
    }

    #[test]
    fn environment_overrides_file_values() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[recorder]
buffer_frames = 32

[recorder.output]
format = "jpeg"
"#
        )
        .unwrap();

        let vars: config::Map<String, String> = [
            ("CLIPKEEPER__RECORDER__BUFFER_FRAMES", "7"),
            ("CLIPKEEPER__RECORDER__OUTPUT__FORMAT", "y4m"),
            ("OTHERAPP__RECORDER__BUFFER_FRAMES", "99"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let env = Config::environment().source(Some(vars));

        let config = Config::load_with_env(Some(file.path()), env).unwrap();
        assert_eq!(config.recorder.buffer_frames, 7);
        assert_eq!(config.recorder.output.format, OutputFormat::Y4m);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let result = Config::load(Some(Path::new("/nonexistent/clipkeeper.toml")));
        assert!(matches!(result, Err(ClipError::Configuration(_))));
    }

    #[test]
    fn negative_capacity_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[recorder]\nbuffer_frames = -5").unwrap();
        assert!(matches!(
            Config::load(Some(file.path())),
            Err(ClipError::Configuration(_))
        ));
    }
}
