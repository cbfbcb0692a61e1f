//! `cascade-run <flow.(json|yaml)> [bindings.json]`
//!
//! Runs one compiled flow against the in-memory record store with echo
//! model and tool collaborators, then prints the run result as JSON.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use cascade_core::{
    Collaborators, EngineConfig, Flow, ModelInvoker, RunStatus, RuntimeInterface, StepOutcome,
    ToolInvoker,
};
use cascade_state_inmemory::InMemoryRecordStore;
use clap::Parser;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Run one flow against in-memory collaborators and print the result
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Flow definition, YAML when the extension is .yaml or .yml, JSON otherwise
    flow: PathBuf,

    /// JSON object of initial bindings
    bindings: Option<PathBuf>,
}

/// Answers every call with its own target and inputs
struct Echo;

#[async_trait]
impl ModelInvoker for Echo {
    async fn invoke(&self, target: &str, inputs: Value) -> StepOutcome {
        StepOutcome::ok(json!({ "target": target, "inputs": inputs }))
    }
}

#[async_trait]
impl ToolInvoker for Echo {
    async fn invoke(&self, tool: &str, args: Value) -> StepOutcome {
        StepOutcome::ok(json!({ "target": tool, "inputs": args }))
    }
}

fn load_config() -> Result<EngineConfig> {
    match std::env::var("CASCADE_CONFIG") {
        Ok(path) => EngineConfig::from_yaml_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        Err(_) => EngineConfig::load().context("Failed to load configuration"),
    }
}

fn load_flow(path: &Path) -> Result<Flow> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow {}", path.display()))?;
    let flow = match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Flow::from_yaml(&source),
        _ => Flow::from_json(&source),
    };
    flow.with_context(|| format!("Invalid flow {}", path.display()))
}

fn load_bindings(path: Option<&Path>) -> Result<Map<String, Value>> {
    let Some(path) = path else {
        return Ok(Map::new());
    };
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bindings {}", path.display()))?;
    match serde_json::from_str(&source)
        .with_context(|| format!("Invalid bindings {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        other => bail!("Bindings must be a JSON object, got {}", other),
    }
}

fn init_tracing(config: &EngineConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config()?;
    init_tracing(&config);

    let flow = load_flow(&args.flow)?;
    let bindings = load_bindings(args.bindings.as_deref())?;

    let echo = Arc::new(Echo);
    let collaborators = Collaborators::new(
        echo.clone(),
        echo,
        Arc::new(InMemoryRecordStore::new()),
    );
    let runtime = RuntimeInterface::in_memory(collaborators, config)
        .context("Failed to start runtime")?;

    info!(flow = %flow.name, "running flow");
    let result = runtime
        .run_flow(&flow, bindings)
        .await
        .context("Run failed to start")?;

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Failed to render run result")?
    );

    if matches!(result.status, RunStatus::Failed | RunStatus::Cancelled) {
        std::process::exit(1);
    }
    Ok(())
}
