//! Scripted model, agent and tool collaborators.
//!
//! A `ScriptedInvoker` answers each target with a configured `Reply` and
//! records every call it receives, so tests can assert on call counts,
//! arguments and the peak number of in-flight calls.

use async_trait::async_trait;
use cascade_core::{ErrorKind, ModelInvoker, StepOutcome, ToolInvoker};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// How a scripted target answers
#[derive(Debug, Clone)]
pub enum Reply {
    /// Succeed with a fixed value
    Value(Value),
    /// Fail with a retryable step execution error
    Fail(String),
    /// Fail with an explicit kind
    FailWith(ErrorKind, String),
    /// Fail the first `times` calls, then succeed with `then`
    FailTimes {
        /// Number of failing calls
        times: usize,
        /// Value returned afterwards
        then: Value,
    },
    /// Wait before answering with the inner reply
    Delay {
        /// Delay in milliseconds
        ms: u64,
        /// Reply after the delay
        then: Box<Reply>,
    },
    /// Succeed with `{target, inputs}`
    Echo,
}

impl Reply {
    /// Delay an existing reply
    pub fn delayed(ms: u64, then: Reply) -> Self {
        Reply::Delay {
            ms,
            then: Box::new(then),
        }
    }
}

/// A call received by a scripted invoker
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// Model, agent or tool name
    pub target: String,
    /// Evaluated inputs
    pub inputs: Value,
}

/// Model/agent/tool collaborator driven by per-target replies
#[derive(Debug)]
pub struct ScriptedInvoker {
    replies: Mutex<HashMap<String, Reply>>,
    fallback: Reply,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
}

struct InFlight {
    current: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(current: &Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self {
            current: current.clone(),
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for ScriptedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedInvoker {
    /// Invoker that echoes every target
    pub fn new() -> Self {
        Self::with_fallback(Reply::Echo)
    }

    /// Invoker answering unscripted targets with `fallback`
    pub fn with_fallback(fallback: Reply) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            fallback,
            calls: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Script a target
    pub fn on(self, target: impl Into<String>, reply: Reply) -> Self {
        self.replies.lock().insert(target.into(), reply);
        self
    }

    /// Every call received, in arrival order
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls received for one target
    pub fn call_count(&self, target: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.target == target).count()
    }

    /// Highest number of calls that were in progress at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn answer(&self, target: &str, inputs: Value) -> StepOutcome {
        let _guard = InFlight::enter(&self.in_flight, &self.peak_in_flight);
        let attempt = {
            let mut calls = self.calls.lock();
            calls.push(RecordedCall {
                target: target.to_string(),
                inputs: inputs.clone(),
            });
            calls.iter().filter(|c| c.target == target).count()
        };

        let mut reply = self
            .replies
            .lock()
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone());

        loop {
            return match reply {
                Reply::Value(value) => StepOutcome::ok(value),
                Reply::Fail(message) => StepOutcome::failure(message),
                Reply::FailWith(kind, message) => StepOutcome::err(kind, message),
                Reply::FailTimes { times, then } => {
                    if attempt <= times {
                        StepOutcome::failure(format!("{} failed on call {}", target, attempt))
                    } else {
                        StepOutcome::ok(then)
                    }
                }
                Reply::Delay { ms, then } => {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    reply = *then;
                    continue;
                }
                Reply::Echo => StepOutcome::ok(json!({ "target": target, "inputs": inputs })),
            };
        }
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(&self, target: &str, inputs: Value) -> StepOutcome {
        self.answer(target, inputs).await
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(&self, tool: &str, args: Value) -> StepOutcome {
        self.answer(tool, args).await
    }
}
