pub mod decoder;
pub mod frame;
pub mod source;
pub mod transform;
#[cfg(feature = "v4l2-capture")]
pub mod v4l2;

pub use frame::{Frame, FrameMetadata, PixelFormat};
pub use source::{FrameSource, RawFileConfig, RawFileSource, SyntheticConfig, SyntheticSource};
pub use transform::resize_to_width;
#[cfg(feature = "v4l2-capture")]
pub use v4l2::{V4l2Capture, V4l2Config};
