//!
//! Cascade Core - flow execution engine for the Cascade Platform
//!
//! This crate runs compiled flow definitions: ordered step graphs with
//! scoped shared state, control flow, retries, timeouts, parallel fan-out,
//! snapshot transactions and error boundaries. External work is delegated
//! to collaborators supplied by the embedding program.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - flows, steps, runs, expressions and collaborator interfaces
pub mod domain;

/// Application services - the executor and its policies
pub mod application;

/// Core types shared with collaborators
pub mod types;

/// Error types
pub mod error;

/// Engine configuration
pub mod config;

// Re-export key types
pub use config::EngineConfig;
pub use error::{CoreError, ErrorContext, ErrorKind};
pub use types::{OutcomeError, ResultLike, StepOutcome};

// Application interfaces
pub use application::flow_execution_service::{FlowExecutor, RunResult};
pub use application::runtime_interface::RuntimeInterface;

// Re-export main API types for easy use
pub use domain::expression::{BinaryOp, Expr, UnaryOp};
pub use domain::flow_definition::Flow;
pub use domain::flow_instance::{RunId, RunStatus, StepRecord, StepStatus};
pub use domain::repository::{
    Collaborators, FlowRepository, ModelInvoker, RecordStore, SnapshotHandle, SpanSink,
    ToolInvoker,
};
pub use domain::shared_state::{ScopeKind, SharedState};
pub use domain::step::{
    Backoff, CallStep, ConditionalBranch, JoinPolicy, LoopBinding, MatchArm, ParallelBranch,
    Pattern, RecordStep, RetryPolicy, StepKind, StepNode,
};
