use crate::error::{ErrorContext, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Error half of a collaborator outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    /// How the failure should be treated by retry classification
    pub kind: ErrorKind,

    /// Collaborator-supplied message
    pub message: String,
}

/// Uniform `{ok, value}` / `{ok: false, error}` result returned by collaborators
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The call succeeded with a value
    Ok(Value),
    /// The call failed
    Err(OutcomeError),
}

impl StepOutcome {
    /// Successful outcome
    #[inline]
    pub fn ok(value: Value) -> Self {
        StepOutcome::Ok(value)
    }

    /// Failed outcome with an explicit kind
    #[inline]
    pub fn err(kind: ErrorKind, message: impl Into<String>) -> Self {
        StepOutcome::Err(OutcomeError {
            kind,
            message: message.into(),
        })
    }

    /// Retryable collaborator failure
    #[inline]
    pub fn failure(message: impl Into<String>) -> Self {
        Self::err(ErrorKind::StepExecution, message)
    }

    /// Whether the outcome is a success
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok(_))
    }

    /// Render the outcome as its JSON envelope
    pub fn to_envelope(&self) -> Value {
        match self {
            StepOutcome::Ok(value) => json!({ "ok": true, "value": value }),
            StepOutcome::Err(error) => json!({
                "ok": false,
                "error": { "kind": error.kind, "message": error.message },
            }),
        }
    }

    /// Convert into an engine error context on failure
    pub fn into_result(self) -> Result<Value, ErrorContext> {
        match self {
            StepOutcome::Ok(value) => Ok(value),
            StepOutcome::Err(error) => Err(ErrorContext::new(error.kind, error.message)),
        }
    }
}

impl From<Result<Value, ErrorContext>> for StepOutcome {
    fn from(result: Result<Value, ErrorContext>) -> Self {
        match result {
            Ok(value) => StepOutcome::Ok(value),
            Err(ctx) => StepOutcome::Err(OutcomeError {
                kind: ctx.kind,
                message: ctx.message,
            }),
        }
    }
}

/// View of a JSON value shaped like an outcome envelope
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ResultLike<'a> {
    /// `{ok: true, value}`
    Ok(&'a Value),
    /// `{ok: false, error}`
    Err(&'a Value),
}

impl<'a> ResultLike<'a> {
    /// Inspect a value, returning `None` unless it is a result envelope
    pub fn inspect(value: &'a Value) -> Option<Self> {
        let object = value.as_object()?;
        match object.get("ok")?.as_bool()? {
            true => object.get("value").map(ResultLike::Ok),
            false => object.get("error").map(ResultLike::Err),
        }
    }
}
