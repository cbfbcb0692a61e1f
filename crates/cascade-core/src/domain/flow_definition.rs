use crate::domain::step::{LoopBinding, Pattern, StepKind, StepNode};
use crate::CoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A compiled flow: an ordered step tree plus an optional error boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Name the flow is registered and invoked under
    pub name: String,

    /// Description of the flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Top-level steps in declared order
    pub steps: Vec<StepNode>,

    /// Flow-level error boundary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<Vec<StepNode>>,
}

impl Flow {
    /// Create a flow with no error boundary
    pub fn new(name: impl Into<String>, steps: Vec<StepNode>) -> Self {
        Self {
            name: name.into(),
            description: None,
            steps,
            on_error: None,
        }
    }

    /// Attach a flow-level error boundary
    pub fn with_on_error(mut self, handler: Vec<StepNode>) -> Self {
        self.on_error = Some(handler);
        self
    }

    /// Parse a compiled flow from JSON
    pub fn from_json(source: &str) -> Result<Self, CoreError> {
        let flow: Self = serde_json::from_str(source)?;
        flow.validate()?;
        Ok(flow)
    }

    /// Parse a compiled flow from YAML
    pub fn from_yaml(source: &str) -> Result<Self, CoreError> {
        let flow: Self = serde_yaml::from_str(source)?;
        flow.validate()?;
        Ok(flow)
    }

    /// Validate the flow definition
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "Flow name must not be empty".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        validate_sequence(&self.steps, &mut seen, false)?;
        if let Some(handler) = &self.on_error {
            validate_sequence(handler, &mut seen, false)?;
        }
        Ok(())
    }

    /// Total number of step nodes, nested ones included
    pub fn step_count(&self) -> usize {
        fn count(steps: &[StepNode]) -> usize {
            steps
                .iter()
                .map(|s| 1 + s.children().into_iter().map(count).sum::<usize>())
                .sum()
        }
        count(&self.steps) + self.on_error.as_deref().map(count).unwrap_or(0)
    }
}

fn validate_sequence<'a>(
    steps: &'a [StepNode],
    seen: &mut HashSet<&'a str>,
    in_transaction: bool,
) -> Result<(), CoreError> {
    for step in steps {
        if step.id.is_empty() {
            return Err(CoreError::ValidationError(
                "Step id must not be empty".to_string(),
            ));
        }
        if !seen.insert(step.id.as_str()) {
            return Err(CoreError::ValidationError(format!(
                "Duplicate step id: {}",
                step.id
            )));
        }
        if let Some(policy) = &step.retry {
            if policy.max_attempts == 0 {
                return Err(CoreError::ValidationError(format!(
                    "Step {} declares a retry policy with zero attempts",
                    step.id
                )));
            }
        }

        validate_names(step)?;

        match &step.kind {
            StepKind::Transaction { body, on_error } => {
                if in_transaction {
                    return Err(CoreError::NestedTransactionError(format!(
                        "Transaction {} is nested inside another transaction",
                        step.id
                    )));
                }
                validate_sequence(body, seen, true)?;
                // The handler runs after rollback, outside the snapshot
                if let Some(handler) = on_error {
                    validate_sequence(handler, seen, false)?;
                }
            }
            _ => {
                for child in step.children() {
                    validate_sequence(child, seen, in_transaction)?;
                }
            }
        }
    }
    Ok(())
}

/// Names a step writes must be reachable by a variable path
fn validate_names(step: &StepNode) -> Result<(), CoreError> {
    let plain = |name: &str| !name.is_empty() && !name.contains('.');
    let reject = |name: &str| {
        Err(CoreError::ValidationError(format!(
            "Step {} binds unreachable name '{}'",
            step.id, name
        )))
    };

    let mut names: Vec<&str> = Vec::new();
    match &step.kind {
        StepKind::SetVariable { target, .. } => {
            let reachable = match target.strip_prefix("state.") {
                Some(field) => plain(field),
                None => plain(target),
            };
            if !reachable {
                return reject(target);
            }
        }
        StepKind::AiCall(call) | StepKind::AgentCall(call) | StepKind::ToolCall(call) => {
            names.extend(call.bind.as_deref());
        }
        StepKind::DbCreate(record)
        | StepKind::DbUpdate(record)
        | StepKind::DbDelete(record)
        | StepKind::DbQuery(record) => names.extend(record.bind.as_deref()),
        StepKind::Script { bind, .. } => names.extend(bind.as_deref()),
        StepKind::Match { arms, .. } => {
            for arm in arms {
                if let Pattern::Ok { bind: Some(name) } | Pattern::Err { bind: Some(name) } =
                    &arm.pattern
                {
                    names.push(name.as_str());
                }
            }
        }
        StepKind::RepeatTimes { counter, .. } => names.extend(counter.as_deref()),
        StepKind::RepeatForEach { binding, index, .. } => {
            names.extend(loop_names(binding));
            names.extend(index.as_deref());
        }
        StepKind::ForEach { binding, .. } => names.extend(loop_names(binding)),
        _ => {}
    }

    match names.into_iter().find(|name| !plain(name)) {
        Some(name) => reject(name),
        None => Ok(()),
    }
}

fn loop_names(binding: &LoopBinding) -> Vec<&str> {
    match binding {
        LoopBinding::Single(name) => vec![name.as_str()],
        LoopBinding::Destructure(names) => names.iter().map(String::as_str).collect(),
    }
}
