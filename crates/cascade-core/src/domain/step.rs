//! Compiled step graph nodes
//!
//! A flow is an ordered tree of [`StepNode`]s. Each node carries a closed
//! [`StepKind`] so that dispatch in the executor is an exhaustive match.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::domain::expression::Expr;

/// One node of the compiled step graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepNode {
    /// Identifier, unique within the flow
    pub id: String,

    /// Kind-specific parameters
    #[serde(flatten)]
    pub kind: StepKind,

    /// Retry policy wrapping this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Deadline for a single attempt of this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl StepNode {
    /// Create a node without retry or timeout
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            retry: None,
            timeout_ms: None,
        }
    }

    /// Wrap the node in a retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Bound each attempt by a deadline
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Per-attempt deadline, if declared
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Nested step sequences owned by this node
    pub fn children(&self) -> Vec<&[StepNode]> {
        match &self.kind {
            StepKind::Conditional {
                branches,
                otherwise,
            } => {
                let mut out: Vec<&[StepNode]> =
                    branches.iter().map(|b| b.body.as_slice()).collect();
                if let Some(body) = otherwise {
                    out.push(body);
                }
                out
            }
            StepKind::Match {
                arms, otherwise, ..
            } => {
                let mut out: Vec<&[StepNode]> = arms.iter().map(|a| a.body.as_slice()).collect();
                if let Some(body) = otherwise {
                    out.push(body);
                }
                out
            }
            StepKind::Guard { body, .. }
            | StepKind::RepeatTimes { body, .. }
            | StepKind::RepeatForEach { body, .. }
            | StepKind::ForEach { body, .. } => vec![body.as_slice()],
            StepKind::Parallel { branches, .. } => {
                branches.iter().map(|b| b.steps.as_slice()).collect()
            }
            StepKind::Transaction { body, on_error } => {
                let mut out = vec![body.as_slice()];
                if let Some(handler) = on_error {
                    out.push(handler);
                }
                out
            }
            _ => Vec::new(),
        }
    }
}

/// Closed set of step kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum StepKind {
    /// Model invocation
    AiCall(CallStep),
    /// Agent invocation, routed through the agent collaborator
    AgentCall(CallStep),
    /// Tool invocation
    ToolCall(CallStep),

    /// Evaluate an expression and record its value
    Script {
        /// Expression to evaluate
        expr: Expr,
        /// Name receiving the value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },

    /// `set` / `let`
    SetVariable {
        /// Name or `state.<field>` target
        target: String,
        /// Value expression
        value: Expr,
        /// Bind in the current scope instead of assigning
        #[serde(default)]
        declare: bool,
    },

    /// Insert a record
    DbCreate(RecordStep),
    /// Update records matching a filter
    DbUpdate(RecordStep),
    /// Delete records matching a filter
    DbDelete(RecordStep),
    /// Read records matching a filter
    DbQuery(RecordStep),

    /// `if / otherwise if / otherwise`
    Conditional {
        /// Condition and body pairs in declaration order
        branches: Vec<ConditionalBranch>,
        /// Body run when no condition holds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Vec<StepNode>>,
    },

    /// Pattern match over a discriminant
    Match {
        /// Discriminant, evaluated once
        subject: Expr,
        /// Arms in declaration order
        arms: Vec<MatchArm>,
        /// Body run when no arm applies
        #[serde(default, skip_serializing_if = "Option::is_none")]
        otherwise: Option<Vec<StepNode>>,
    },

    /// Early return from the current scope when the condition is false
    Guard {
        /// Condition that must hold
        condition: Expr,
        /// Body run before leaving the scope
        body: Vec<StepNode>,
    },

    /// `repeat up to N`
    RepeatTimes {
        /// Iteration count
        count: Expr,
        /// Name bound to the 1-based iteration number
        #[serde(default, skip_serializing_if = "Option::is_none")]
        counter: Option<String>,
        /// Loop body
        body: Vec<StepNode>,
    },

    /// `repeat for each`
    RepeatForEach {
        /// Collection to iterate
        collection: Expr,
        /// Loop variable or destructuring pattern
        binding: LoopBinding,
        /// Name bound to the 0-based position
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        /// Loop body
        body: Vec<StepNode>,
    },

    /// Flow-level fan-out of a step template over a collection
    ForEach {
        /// Collection to fan out over
        collection: Expr,
        /// Variable bound in each branch
        binding: LoopBinding,
        /// Step template run per element
        body: Vec<StepNode>,
        /// Join policy for the generated branches
        #[serde(default)]
        join: JoinPolicy,
        /// Branch result expression
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collect: Option<Expr>,
    },

    /// Independent branches run concurrently
    Parallel {
        /// Branches in input order
        branches: Vec<ParallelBranch>,
        /// Join policy
        #[serde(default)]
        join: JoinPolicy,
    },

    /// Snapshot-isolated block of record mutations
    Transaction {
        /// Protected body
        body: Vec<StepNode>,
        /// Error boundary run after rollback
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_error: Option<Vec<StepNode>>,
    },
}

impl StepKind {
    /// Kebab-case tag of the kind
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::AiCall(_) => "ai-call",
            StepKind::AgentCall(_) => "agent-call",
            StepKind::ToolCall(_) => "tool-call",
            StepKind::Script { .. } => "script",
            StepKind::SetVariable { .. } => "set-variable",
            StepKind::DbCreate(_) => "db-create",
            StepKind::DbUpdate(_) => "db-update",
            StepKind::DbDelete(_) => "db-delete",
            StepKind::DbQuery(_) => "db-query",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Match { .. } => "match",
            StepKind::Guard { .. } => "guard",
            StepKind::RepeatTimes { .. } => "repeat-times",
            StepKind::RepeatForEach { .. } => "repeat-for-each",
            StepKind::ForEach { .. } => "for-each",
            StepKind::Parallel { .. } => "parallel",
            StepKind::Transaction { .. } => "transaction",
        }
    }

    /// Whether the kind suspends on an external collaborator
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            StepKind::AiCall(_)
                | StepKind::AgentCall(_)
                | StepKind::ToolCall(_)
                | StepKind::DbCreate(_)
                | StepKind::DbUpdate(_)
                | StepKind::DbDelete(_)
                | StepKind::DbQuery(_)
        )
    }
}

/// Parameters of a model, agent or tool call
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallStep {
    /// Model, agent or tool name
    pub target: String,

    /// Named input expressions
    #[serde(default)]
    pub inputs: BTreeMap<String, Expr>,

    /// Name receiving the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Keep the `{ok, value|error}` envelope as the output instead of failing
    #[serde(default)]
    pub capture: bool,
}

/// Parameters of a record-layer step
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RecordStep {
    /// Record (table) name
    pub record: String,

    /// Row payload for create, or changes for update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Expr>,

    /// Equality filter for update, delete and query
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Expr>,

    /// Name receiving the output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind: Option<String>,

    /// Keep the `{ok, value|error}` envelope as the output instead of failing
    #[serde(default)]
    pub capture: bool,
}

/// One `if` / `otherwise if` branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionalBranch {
    /// Boolean condition
    pub condition: Expr,
    /// Body run when the condition holds
    pub body: Vec<StepNode>,
}

/// One arm of a match
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    /// Pattern tested against the discriminant
    pub pattern: Pattern,
    /// Body run on a match
    pub body: Vec<StepNode>,
}

/// Match pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Pattern {
    /// Equality with a literal
    Literal {
        /// Value compared against
        value: Value,
    },
    /// Successful result, optionally binding its value
    Ok {
        /// Name receiving the unwrapped value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },
    /// Failed result, optionally binding its error
    Err {
        /// Name receiving the unwrapped error
        #[serde(default, skip_serializing_if = "Option::is_none")]
        bind: Option<String>,
    },
}

/// Loop variable binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoopBinding {
    /// One name per element
    Single(String),
    /// Names bound positionally from an element list
    Destructure(Vec<String>),
}

impl From<&str> for LoopBinding {
    fn from(name: &str) -> Self {
        LoopBinding::Single(name.to_string())
    }
}

/// One branch of a parallel block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelBranch {
    /// Steps of the branch
    pub steps: Vec<StepNode>,
    /// Branch result expression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<Expr>,
}

impl From<Vec<StepNode>> for ParallelBranch {
    fn from(steps: Vec<StepNode>) -> Self {
        Self {
            steps,
            collect: None,
        }
    }
}

/// How sibling branch failures affect the group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Every branch runs to completion
    #[default]
    WaitAll,
    /// The first failure cancels the siblings
    FailFast,
}

/// Bounded reattempts around a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay between attempts
    #[serde(default)]
    pub backoff: Backoff,

    /// Whether timed-out attempts are reattempted
    #[serde(default = "default_retry_on_timeout")]
    pub retry_on_timeout: bool,
}

fn default_retry_on_timeout() -> bool {
    true
}

impl RetryPolicy {
    /// Policy with a fixed delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                delay_ms: delay.as_millis() as u64,
            },
            retry_on_timeout: true,
        }
    }

    /// Policy with exponential backoff
    pub fn exponential(max_attempts: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                initial_ms: initial.as_millis() as u64,
                multiplier: 2.0,
                max_ms: Some(max.as_millis() as u64),
            },
            retry_on_timeout: true,
        }
    }

    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }
}

/// Backoff function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay every time
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// Delay grows linearly with the attempt number
    Linear {
        /// Delay per attempt in milliseconds
        delay_ms: u64,
    },
    /// Delay multiplies on every attempt
    Exponential {
        /// First delay in milliseconds
        initial_ms: u64,
        /// Growth factor
        multiplier: f64,
        /// Upper bound in milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_ms: Option<u64>,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed { delay_ms: 100 }
    }
}

impl Backoff {
    /// Delay after the given failed attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self {
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear { delay_ms } => delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential {
                initial_ms,
                multiplier,
                max_ms,
            } => {
                let exponent = attempt.saturating_sub(1).min(32) as i32;
                let raw = (*initial_ms as f64) * multiplier.powi(exponent);
                let capped = match max_ms {
                    Some(max) => raw.min(*max as f64),
                    None => raw,
                };
                if capped.is_finite() && capped > 0.0 {
                    capped.min(u64::MAX as f64) as u64
                } else {
                    0
                }
            }
        };
        Duration::from_millis(ms)
    }
}
