//! Assertion utilities for validating run results.

use cascade_core::{ErrorKind, RunResult, RunStatus, StepStatus};
use serde_json::Value;
use thiserror::Error;

/// Error type for run validation failures
#[derive(Debug, Error)]
pub enum RunAssertionError {
    /// The run ended with another status
    #[error("Invalid run status: expected {expected:?}, got {actual:?} (error: {error})")]
    InvalidStatus {
        /// Expected status
        expected: RunStatus,
        /// Actual status
        actual: RunStatus,
        /// Run error, if any
        error: String,
    },

    /// A binding is missing from the final flow scope
    #[error("Missing binding: {0}")]
    MissingBinding(String),

    /// A binding has another value
    #[error("Invalid value for {name}: expected {expected}, got {actual}")]
    InvalidValue {
        /// Binding name
        name: String,
        /// Expected value
        expected: String,
        /// Actual value
        actual: String,
    },

    /// The run error has another kind, or there is none
    #[error("Invalid error kind: expected {expected}, got {actual}")]
    InvalidErrorKind {
        /// Expected kind
        expected: ErrorKind,
        /// Actual kind or `none`
        actual: String,
    },

    /// No record for a step carries the expected status
    #[error("Step {step_id} never ended {expected:?}; statuses seen: {seen:?}")]
    InvalidStepStatus {
        /// Step identifier
        step_id: String,
        /// Expected status
        expected: StepStatus,
        /// Statuses recorded for the step
        seen: Vec<StepStatus>,
    },
}

/// Asserts that the run ended with `expected`
pub fn assert_status(result: &RunResult, expected: RunStatus) -> Result<(), RunAssertionError> {
    if result.status != expected {
        return Err(RunAssertionError::InvalidStatus {
            expected,
            actual: result.status,
            error: result
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "none".to_string()),
        });
    }
    Ok(())
}

/// Asserts that a flow-scope binding holds `expected`
///
/// `state.<field>` names read the flow-wide state object.
pub fn assert_binding(
    result: &RunResult,
    name: &str,
    expected: Value,
) -> Result<(), RunAssertionError> {
    let actual = match name.strip_prefix("state.") {
        Some(field) => result.state_field(field),
        None => result.binding(name),
    }
    .ok_or_else(|| RunAssertionError::MissingBinding(name.to_string()))?;

    if actual != &expected {
        return Err(RunAssertionError::InvalidValue {
            name: name.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Asserts that the run error has kind `expected`
pub fn assert_error_kind(result: &RunResult, expected: ErrorKind) -> Result<(), RunAssertionError> {
    match &result.error {
        Some(error) if error.kind == expected => Ok(()),
        other => Err(RunAssertionError::InvalidErrorKind {
            expected,
            actual: other
                .as_ref()
                .map(|e| e.kind.to_string())
                .unwrap_or_else(|| "none".to_string()),
        }),
    }
}

/// Asserts that some record of `step_id` ended with `expected`
pub fn assert_step_status(
    result: &RunResult,
    step_id: &str,
    expected: StepStatus,
) -> Result<(), RunAssertionError> {
    let seen: Vec<StepStatus> = result.records_for(step_id).map(|r| r.status).collect();
    if seen.contains(&expected) {
        return Ok(());
    }
    Err(RunAssertionError::InvalidStepStatus {
        step_id: step_id.to_string(),
        expected,
        seen,
    })
}
