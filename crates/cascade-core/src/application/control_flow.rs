//! Control-flow evaluation
//!
//! Pure decisions over the shared state: which branch or arm runs, how many
//! times a loop runs, and what a loop iteration binds. Executing the chosen
//! bodies is left to the flow executor.

use serde_json::Value;

use crate::domain::expression::{values_equal, Expr};
use crate::domain::shared_state::SharedState;
use crate::domain::step::{ConditionalBranch, LoopBinding, MatchArm, Pattern, StepNode};
use crate::types::ResultLike;
use crate::CoreError;

/// Evaluate a condition, accepting only booleans
pub fn eval_condition(condition: &Expr, state: &SharedState) -> Result<bool, CoreError> {
    match condition.evaluate(state)? {
        Value::Bool(b) => Ok(b),
        other => Err(CoreError::ValidationError(format!(
            "Condition must evaluate to a boolean, got {}",
            other
        ))),
    }
}

/// Body of the first branch whose condition holds, else `otherwise`
pub fn select_branch<'a>(
    branches: &'a [ConditionalBranch],
    otherwise: Option<&'a [StepNode]>,
    state: &SharedState,
) -> Result<Option<&'a [StepNode]>, CoreError> {
    for branch in branches {
        if eval_condition(&branch.condition, state)? {
            return Ok(Some(&branch.body));
        }
    }
    Ok(otherwise)
}

/// Arm chosen by a match
#[derive(Debug, PartialEq)]
pub struct SelectedArm<'a> {
    /// Body to run
    pub body: &'a [StepNode],
    /// Name and value unwrapped by an `ok`/`err` pattern
    pub binding: Option<(&'a str, Value)>,
}

/// Choose the arm of a match for an already evaluated discriminant
///
/// A result-like discriminant that no arm accepts is a no-op. A plain value
/// with no matching arm and no `otherwise` fails with `MatchExhausted`.
pub fn select_arm<'a>(
    subject: &Value,
    arms: &'a [MatchArm],
    otherwise: Option<&'a [StepNode]>,
) -> Result<Option<SelectedArm<'a>>, CoreError> {
    let result_like = ResultLike::inspect(subject);

    for arm in arms {
        let binding = match (&arm.pattern, result_like) {
            (Pattern::Literal { value }, _) => {
                if values_equal(subject, value) {
                    Some(None)
                } else {
                    None
                }
            }
            (Pattern::Ok { bind }, Some(ResultLike::Ok(inner)))
            | (Pattern::Err { bind }, Some(ResultLike::Err(inner))) => {
                Some(bind.as_deref().map(|name| (name, inner.clone())))
            }
            _ => None,
        };

        if let Some(binding) = binding {
            return Ok(Some(SelectedArm {
                body: &arm.body,
                binding,
            }));
        }
    }

    if let Some(body) = otherwise {
        return Ok(Some(SelectedArm {
            body,
            binding: None,
        }));
    }

    match result_like {
        Some(_) => Ok(None),
        None => Err(CoreError::MatchExhausted(format!(
            "No clause matches {}",
            subject
        ))),
    }
}

/// Iteration count of a bounded loop
pub fn loop_count(value: &Value) -> Result<u64, CoreError> {
    if let Some(n) = value.as_u64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
        _ => Err(CoreError::ValidationError(format!(
            "Loop count must be a non-negative integer, got {}",
            value
        ))),
    }
}

/// Elements of a collection in stored order
///
/// Objects iterate as `[key, value]` pairs.
pub fn collection_items(value: Value) -> Result<Vec<Value>, CoreError> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| Value::Array(vec![Value::String(key), value]))
            .collect()),
        other => Err(CoreError::ValidationError(format!(
            "Cannot iterate over {}",
            other
        ))),
    }
}

/// Bind loop variables for one element in the innermost frame
pub fn bind_loop_variables(
    state: &mut SharedState,
    binding: &LoopBinding,
    item: Value,
) -> Result<(), CoreError> {
    match binding {
        LoopBinding::Single(name) => {
            state.declare_local(name.clone(), item);
            Ok(())
        }
        LoopBinding::Destructure(names) => match item {
            Value::Array(values) if values.len() == names.len() => {
                for (name, value) in names.iter().zip(values) {
                    state.declare_local(name.clone(), value);
                }
                Ok(())
            }
            Value::Object(mut map) => {
                for name in names {
                    let value = map.remove(name).unwrap_or(Value::Null);
                    state.declare_local(name.clone(), value);
                }
                Ok(())
            }
            other => Err(CoreError::ValidationError(format!(
                "Cannot destructure {} into {} names",
                other,
                names.len()
            ))),
        },
    }
}
