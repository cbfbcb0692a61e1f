use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::application::flow_execution_service::{FlowExecutor, RunResult};
use crate::config::EngineConfig;
use crate::domain::flow_definition::Flow;
use crate::domain::repository::memory::MemoryFlowRepository;
use crate::domain::repository::{Collaborators, FlowRepository};
use crate::CoreError;

/// The main API provided by Cascade Core to embedding programs
#[derive(Clone)]
pub struct RuntimeInterface {
    flows: Arc<dyn FlowRepository>,
    executor: FlowExecutor,
    run_slots: Arc<Semaphore>,
}

impl RuntimeInterface {
    /// Create a runtime over a flow repository and collaborators
    pub fn new(
        flows: Arc<dyn FlowRepository>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Result<Self, CoreError> {
        config.validate()?;
        let run_slots = Arc::new(Semaphore::new(config.max_concurrent_runs));
        Ok(Self {
            flows,
            executor: FlowExecutor::new(collaborators, config),
            run_slots,
        })
    }

    /// Create a runtime that keeps flows in memory
    pub fn in_memory(collaborators: Collaborators, config: EngineConfig) -> Result<Self, CoreError> {
        Self::new(Arc::new(MemoryFlowRepository::new()), collaborators, config)
    }

    /// Validate and register a flow under its name
    pub async fn register_flow(&self, flow: Flow) -> Result<(), CoreError> {
        let name = flow.name.clone();
        let steps = flow.step_count();
        self.flows.save(flow).await?;
        info!(flow = %name, steps, "flow registered");
        Ok(())
    }

    /// Remove a registered flow
    pub async fn unregister_flow(&self, name: &str) -> Result<(), CoreError> {
        self.flows.delete(name).await
    }

    /// Names of the registered flows
    pub async fn list_flows(&self) -> Result<Vec<String>, CoreError> {
        self.flows.list().await
    }

    /// Run a registered flow to completion
    pub async fn run(&self, name: &str, bindings: Map<String, Value>) -> Result<RunResult, CoreError> {
        self.run_with_cancel(name, bindings, CancellationToken::new())
            .await
    }

    /// Run a registered flow, aborting when `cancel` fires
    pub async fn run_with_cancel(
        &self,
        name: &str,
        bindings: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<RunResult, CoreError> {
        let flow = self.lookup(name).await?;
        Ok(self.executor.execute(&flow, bindings, cancel).await)
    }

    /// Run a flow that was never registered
    pub async fn run_flow(
        &self,
        flow: &Flow,
        bindings: Map<String, Value>,
    ) -> Result<RunResult, CoreError> {
        flow.validate()?;
        Ok(self
            .executor
            .execute(flow, bindings, CancellationToken::new())
            .await)
    }

    /// Start a registered flow in the background
    ///
    /// The run waits for one of `max_concurrent_runs` slots before it starts.
    pub fn submit(
        &self,
        name: &str,
        bindings: Map<String, Value>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<RunResult, CoreError>> {
        let runtime = self.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let flow = runtime.lookup(&name).await?;
            let _slot = runtime.run_slots.clone().acquire_owned().await.map_err(|_| {
                CoreError::ConfigurationError("run admission closed".to_string())
            })?;
            debug!(flow = %name, "run admitted");
            Ok(runtime.executor.execute(&flow, bindings, cancel).await)
        })
    }

    /// Run slots not currently held by submitted runs
    pub fn available_run_slots(&self) -> usize {
        self.run_slots.available_permits()
    }

    /// Engine configuration in use
    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    async fn lookup(&self, name: &str) -> Result<Arc<Flow>, CoreError> {
        self.flows
            .find_by_name(name)
            .await?
            .ok_or_else(|| CoreError::FlowDefinitionNotFound(name.to_string()))
    }
}
