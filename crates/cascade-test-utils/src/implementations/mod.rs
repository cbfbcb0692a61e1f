//! Test implementations (fakes) of engine collaborators.

pub mod spans;

pub use spans::{FailingSpanSink, RecordingSpanSink, SpanEvent};
