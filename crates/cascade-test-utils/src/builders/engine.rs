//! Test engine builder.
//!
//! Wires scripted collaborators, the in-memory record store and a span
//! sink into a `RuntimeInterface`, keeping handles to each fake so tests
//! can inspect them after a run.

use cascade_core::{
    Collaborators, CoreError, EngineConfig, Flow, RunResult, RuntimeInterface, SpanSink,
};
use cascade_state_inmemory::InMemoryRecordStore;
use serde_json::{Map, Value};
use std::sync::Arc;

use crate::implementations::RecordingSpanSink;
use crate::mocks::ScriptedInvoker;

/// Runtime plus the fakes behind it
pub struct TestEngine {
    /// The runtime under test
    pub runtime: RuntimeInterface,
    /// Model collaborator
    pub models: Arc<ScriptedInvoker>,
    /// Agent collaborator
    pub agents: Arc<ScriptedInvoker>,
    /// Tool collaborator
    pub tools: Arc<ScriptedInvoker>,
    /// Record layer
    pub records: InMemoryRecordStore,
    /// Recorded spans, when the default sink is in use
    pub spans: Arc<RecordingSpanSink>,
}

impl TestEngine {
    /// Start building an engine
    pub fn builder() -> TestEngineBuilder {
        TestEngineBuilder::default()
    }

    /// Register `flow` and run it
    pub async fn run(&self, flow: Flow, bindings: Map<String, Value>) -> Result<RunResult, CoreError> {
        let name = flow.name.clone();
        self.runtime.register_flow(flow).await?;
        self.runtime.run(&name, bindings).await
    }
}

/// Builder for `TestEngine`
#[derive(Default)]
pub struct TestEngineBuilder {
    models: Option<ScriptedInvoker>,
    agents: Option<ScriptedInvoker>,
    tools: Option<ScriptedInvoker>,
    records: Option<InMemoryRecordStore>,
    span_sink: Option<Arc<dyn SpanSink>>,
    config: EngineConfig,
}

impl TestEngineBuilder {
    /// Use a scripted model collaborator
    pub fn models(mut self, models: ScriptedInvoker) -> Self {
        self.models = Some(models);
        self
    }

    /// Use a scripted agent collaborator
    pub fn agents(mut self, agents: ScriptedInvoker) -> Self {
        self.agents = Some(agents);
        self
    }

    /// Use a scripted tool collaborator
    pub fn tools(mut self, tools: ScriptedInvoker) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Use a prepared record store
    pub fn records(mut self, records: InMemoryRecordStore) -> Self {
        self.records = Some(records);
        self
    }

    /// Replace the recording span sink
    pub fn span_sink(mut self, sink: Arc<dyn SpanSink>) -> Self {
        self.span_sink = Some(sink);
        self
    }

    /// Engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the engine
    pub fn build(self) -> Result<TestEngine, CoreError> {
        let models = Arc::new(self.models.unwrap_or_default());
        let agents = Arc::new(self.agents.unwrap_or_default());
        let tools = Arc::new(self.tools.unwrap_or_default());
        let records = self.records.unwrap_or_default();
        let spans = Arc::new(RecordingSpanSink::new());
        let sink: Arc<dyn SpanSink> = match self.span_sink {
            Some(sink) => sink,
            None => spans.clone(),
        };

        let collaborators = Collaborators::new(
            models.clone(),
            tools.clone(),
            Arc::new(records.clone()),
        )
        .with_agents(agents.clone())
        .with_span_sink(sink);

        let runtime = RuntimeInterface::in_memory(collaborators, self.config)?;

        Ok(TestEngine {
            runtime,
            models,
            agents,
            tools,
            records,
            spans,
        })
    }
}
