//! Collaborator traits for the Cascade Core
//!
//! The engine never talks to models, tools, or storage directly. It consumes
//! these narrow traits; external crates implement them to plug in concrete
//! backends.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use super::flow_definition::Flow;
use super::flow_instance::StepStatus;
use crate::{CoreError, StepOutcome};

/// Opaque handle to a record-store snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SnapshotHandle(pub String);

/// Model or agent invocation
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    /// Invoke `target` with the evaluated prompt inputs
    async fn invoke(&self, target: &str, inputs: Value) -> StepOutcome;
}

/// Tool invocation
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` with the evaluated arguments
    async fn invoke(&self, tool: &str, args: Value) -> StepOutcome;
}

/// Record layer
///
/// Mutations report failures as outcomes. Snapshot management reports
/// infrastructure failures as errors.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Insert a row
    async fn create(&self, record: &str, payload: Value) -> StepOutcome;

    /// Apply `changes` to every row matching `filter`
    async fn update(&self, record: &str, filter: Value, changes: Value) -> StepOutcome;

    /// Delete every row matching `filter`
    async fn delete(&self, record: &str, filter: Value) -> StepOutcome;

    /// Rows matching `filter`
    async fn query(&self, record: &str, filter: Value) -> StepOutcome;

    /// Capture every collection
    async fn snapshot(&self) -> Result<SnapshotHandle, CoreError>;

    /// Restore every collection to the snapshot and release it
    async fn restore(&self, handle: &SnapshotHandle) -> Result<(), CoreError>;

    /// Release a snapshot without restoring it
    async fn discard(&self, handle: &SnapshotHandle) -> Result<(), CoreError>;
}

/// Tracing collaborator
///
/// Calls are fire-and-forget: the executor logs a returned error and moves on.
#[cfg_attr(test, mockall::automock)]
pub trait SpanSink: Send + Sync {
    /// A step attempt sequence is starting
    fn start_span(&self, run_id: &str, step_id: &str) -> Result<(), CoreError>;

    /// A step finished with the given status
    fn end_span(&self, run_id: &str, step_id: &str, status: StepStatus) -> Result<(), CoreError>;
}

/// Span sink emitting `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSpanSink;

impl SpanSink for TracingSpanSink {
    fn start_span(&self, run_id: &str, step_id: &str) -> Result<(), CoreError> {
        debug!(run_id, step_id, "span started");
        Ok(())
    }

    fn end_span(&self, run_id: &str, step_id: &str, status: StepStatus) -> Result<(), CoreError> {
        info!(run_id, step_id, status = ?status, "span ended");
        Ok(())
    }
}

/// Compiled flows by name
#[async_trait]
pub trait FlowRepository: Send + Sync {
    /// Find a flow by name
    async fn find_by_name(&self, name: &str) -> Result<Option<Arc<Flow>>, CoreError>;

    /// Save a flow, replacing any flow with the same name
    async fn save(&self, flow: Flow) -> Result<(), CoreError>;

    /// Delete a flow
    async fn delete(&self, name: &str) -> Result<(), CoreError>;

    /// Names of all stored flows
    async fn list(&self) -> Result<Vec<String>, CoreError>;
}

/// Collaborators available to one run
#[derive(Clone)]
pub struct Collaborators {
    /// Model invocation
    pub models: Arc<dyn ModelInvoker>,

    /// Agent invocation
    pub agents: Arc<dyn ModelInvoker>,

    /// Tool invocation
    pub tools: Arc<dyn ToolInvoker>,

    /// Record layer
    pub records: Arc<dyn RecordStore>,

    /// Tracing
    pub spans: Arc<dyn SpanSink>,
}

impl Collaborators {
    /// Bundle collaborators; agents share the model invoker and spans go to `tracing`
    pub fn new(
        models: Arc<dyn ModelInvoker>,
        tools: Arc<dyn ToolInvoker>,
        records: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            agents: models.clone(),
            models,
            tools,
            records,
            spans: Arc::new(TracingSpanSink),
        }
    }

    /// Route agent calls to a dedicated invoker
    pub fn with_agents(mut self, agents: Arc<dyn ModelInvoker>) -> Self {
        self.agents = agents;
        self
    }

    /// Replace the span sink
    pub fn with_span_sink(mut self, spans: Arc<dyn SpanSink>) -> Self {
        self.spans = spans;
        self
    }
}

/// Memory implementations
pub mod memory {
    use super::*;
    use dashmap::DashMap;

    /// In-memory flow repository backed by a concurrent map
    #[derive(Debug, Default)]
    pub struct MemoryFlowRepository {
        flows: DashMap<String, Arc<Flow>>,
    }

    impl MemoryFlowRepository {
        /// Create a new memory flow repository
        pub fn new() -> Self {
            Self {
                flows: DashMap::with_capacity(16),
            }
        }
    }

    #[async_trait]
    impl FlowRepository for MemoryFlowRepository {
        async fn find_by_name(&self, name: &str) -> Result<Option<Arc<Flow>>, CoreError> {
            Ok(self.flows.get(name).map(|entry| entry.value().clone()))
        }

        async fn save(&self, flow: Flow) -> Result<(), CoreError> {
            flow.validate()?;
            self.flows.insert(flow.name.clone(), Arc::new(flow));
            Ok(())
        }

        async fn delete(&self, name: &str) -> Result<(), CoreError> {
            self.flows
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| CoreError::FlowDefinitionNotFound(name.to_string()))
        }

        async fn list(&self) -> Result<Vec<String>, CoreError> {
            let mut names: Vec<String> = self.flows.iter().map(|e| e.key().clone()).collect();
            names.sort();
            Ok(names)
        }
    }
}
