pub mod file_sink;
pub mod ring_buffer;
pub mod ring_reader;
pub mod sink;
pub mod types;

pub use file_sink::SequentialFileSink;
pub use ring_buffer::{RingBuffer, RingBufferSink, RingStats};
pub use ring_reader::RingReader;
pub use sink::Sink;
pub use types::{CaptureOutcome, CaptureReport, SampleBlock};
