//! Span sink fakes.

use cascade_core::{CoreError, SpanSink, StepStatus};
use parking_lot::Mutex;

/// A span start or end observed by the recording sink
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanEvent {
    /// A step started
    Start {
        /// Run identifier
        run_id: String,
        /// Step identifier
        step_id: String,
    },
    /// A step finished
    End {
        /// Run identifier
        run_id: String,
        /// Step identifier
        step_id: String,
        /// Final status
        status: StepStatus,
    },
}

/// Span sink that keeps every event in memory
#[derive(Debug, Default)]
pub struct RecordingSpanSink {
    events: Mutex<Vec<SpanEvent>>,
}

impl RecordingSpanSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Events in arrival order
    pub fn events(&self) -> Vec<SpanEvent> {
        self.events.lock().clone()
    }

    /// Step ids in the order their spans ended
    pub fn finished_steps(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                SpanEvent::End { step_id, .. } => Some(step_id.clone()),
                SpanEvent::Start { .. } => None,
            })
            .collect()
    }
}

impl SpanSink for RecordingSpanSink {
    fn start_span(&self, run_id: &str, step_id: &str) -> Result<(), CoreError> {
        self.events.lock().push(SpanEvent::Start {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
        });
        Ok(())
    }

    fn end_span(&self, run_id: &str, step_id: &str, status: StepStatus) -> Result<(), CoreError> {
        self.events.lock().push(SpanEvent::End {
            run_id: run_id.to_string(),
            step_id: step_id.to_string(),
            status,
        });
        Ok(())
    }
}

/// Span sink whose every call fails
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingSpanSink;

impl SpanSink for FailingSpanSink {
    fn start_span(&self, _run_id: &str, _step_id: &str) -> Result<(), CoreError> {
        Err(CoreError::StoreError("span exporter unavailable".to_string()))
    }

    fn end_span(&self, _run_id: &str, _step_id: &str, _status: StepStatus) -> Result<(), CoreError> {
        Err(CoreError::StoreError("span exporter unavailable".to_string()))
    }
}
