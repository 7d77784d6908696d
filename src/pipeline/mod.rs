pub mod jpeg_seq;
pub mod ringbuf;
pub mod sink;
pub mod writer;
pub mod y4m;

pub use self::ringbuf::FrameRingBuffer;
pub use jpeg_seq::JpegSequenceSink;
pub use sink::{clip_path, FileSinkFactory, FrameSink, OutputFormat, SinkFactory, SinkParams};
pub use writer::{ClipReport, QueuePolicy, WritePipeline, WriterSnapshot};
pub use y4m::Y4mSink;
