use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a failure, used for retry decisions and reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A name was not bound in any visible scope
    UnknownIdentifier,
    /// Bad step configuration or bad data shape
    Validation,
    /// A collaborator call failed
    StepExecution,
    /// A step attempt ran past its deadline
    Timeout,
    /// A match over a plain value found no clause
    MatchExhausted,
    /// A transaction was opened while another one was live
    NestedTransaction,
    /// All retry attempts failed
    RetryExhausted,
    /// The run or branch was cancelled
    Cancellation,
    /// Engine configuration is invalid
    Configuration,
    /// The record store could not snapshot or restore
    Store,
    /// A referenced flow does not exist
    NotFound,
    /// A value could not be (de)serialized
    Serialization,
}

impl ErrorKind {
    /// Whether a failure of this kind may be reattempted by a retry policy
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::StepExecution | ErrorKind::Timeout)
    }

    /// Stable snake_case name of the kind
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnknownIdentifier => "unknown_identifier",
            ErrorKind::Validation => "validation",
            ErrorKind::StepExecution => "step_execution",
            ErrorKind::Timeout => "timeout",
            ErrorKind::MatchExhausted => "match_exhausted",
            ErrorKind::NestedTransaction => "nested_transaction",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::Cancellation => "cancellation",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Store => "store",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Serialization => "serialization",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Core error type for the Cascade runtime
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    /// Name not bound in the scope chain
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// Validation error
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Step execution error
    #[error("Step execution error: {0}")]
    StepExecutionError(String),

    /// Timeout error
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// No match clause applied
    #[error("Match exhausted: {0}")]
    MatchExhausted(String),

    /// Transaction opened inside another transaction
    #[error("Nested transaction error: {0}")]
    NestedTransactionError(String),

    /// Retry attempts used up
    #[error("Retry exhausted after {attempts} attempts: {}", .last.message)]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Failure of the final attempt
        last: Box<ErrorContext>,
    },

    /// Cancellation error
    #[error("Cancellation error: {0}")]
    CancellationError(String),

    /// Flow definition not found
    #[error("Flow definition not found: {0}")]
    FlowDefinitionNotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Record store infrastructure error
    #[error("Record store error: {0}")]
    StoreError(String),

    /// Illegal run lifecycle transition
    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Input/output error
    #[error("Input/output error: {0}")]
    IOError(String),
}

impl CoreError {
    /// The error kind this error is reported as
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::UnknownIdentifier(_) => ErrorKind::UnknownIdentifier,
            CoreError::ValidationError(_) | CoreError::InvalidStateTransition(_) => {
                ErrorKind::Validation
            }
            CoreError::StepExecutionError(_) => ErrorKind::StepExecution,
            CoreError::TimeoutError(_) => ErrorKind::Timeout,
            CoreError::MatchExhausted(_) => ErrorKind::MatchExhausted,
            CoreError::NestedTransactionError(_) => ErrorKind::NestedTransaction,
            CoreError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            CoreError::CancellationError(_) => ErrorKind::Cancellation,
            CoreError::FlowDefinitionNotFound(_) => ErrorKind::NotFound,
            CoreError::ConfigurationError(_) => ErrorKind::Configuration,
            CoreError::StoreError(_) | CoreError::IOError(_) => ErrorKind::Store,
            CoreError::SerializationError(_) => ErrorKind::Serialization,
        }
    }

    /// Attach the originating step to this error
    pub fn at_step(self, step_id: &str) -> ErrorContext {
        ErrorContext::from(self).at_step(step_id)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CoreError {
    fn from(err: serde_yaml::Error) -> Self {
        CoreError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::IOError(err.to_string())
    }
}

/// Failure record handed to error boundaries and returned to callers
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ErrorContext {
    /// Error classification
    pub kind: ErrorKind,

    /// Human-readable description
    pub message: String,

    /// Step that raised the error, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Set when the error caused a transaction rollback
    #[serde(default)]
    pub is_rollback: bool,

    /// Underlying failure, e.g. the last attempt of an exhausted retry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorContext>>,
}

impl ErrorContext {
    /// Create a new error context
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            step_id: None,
            is_rollback: false,
            cause: None,
        }
    }

    /// Context for a cancelled run or branch
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancellation, reason)
    }

    /// Wrap the failure of the last attempt in a `RetryExhausted` context
    pub fn retry_exhausted(attempts: u32, last: ErrorContext) -> Self {
        Self {
            kind: ErrorKind::RetryExhausted,
            message: format!("retry exhausted after {} attempts: {}", attempts, last.message),
            step_id: last.step_id.clone(),
            is_rollback: last.is_rollback,
            cause: Some(Box::new(last)),
        }
    }

    /// Record the originating step unless one is already set
    pub fn at_step(mut self, step_id: &str) -> Self {
        if self.step_id.is_none() {
            self.step_id = Some(step_id.to_string());
        }
        self
    }

    /// Mark this error as having triggered a rollback
    pub fn into_rollback(mut self) -> Self {
        self.is_rollback = true;
        self
    }

    /// Whether this context reports a cancellation
    pub fn is_cancellation(&self) -> bool {
        self.kind == ErrorKind::Cancellation
    }

    /// Convert to a JSON value for binding into flow state
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl From<CoreError> for ErrorContext {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::RetryExhausted { attempts, last } => Self::retry_exhausted(attempts, *last),
            other => Self::new(other.kind(), other.to_string()),
        }
    }
}
