/// Flow executor and run results
pub mod flow_execution_service;

/// Runtime interface for embedding programs
pub mod runtime_interface;

/// Control-flow decisions over the shared state
pub mod control_flow;

/// Retry classification and backoff
pub mod retry;

/// Fan-out joins and the concurrency gate
pub mod parallel;

/// Transaction snapshots
pub mod transaction;

/// Error boundaries
pub mod error_boundary;
