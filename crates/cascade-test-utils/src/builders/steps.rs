//! Shorthand constructors for step graphs.

use cascade_core::{
    CallStep, ConditionalBranch, Expr, JoinPolicy, LoopBinding, MatchArm, ParallelBranch,
    Pattern, RecordStep, StepKind, StepNode,
};
use std::collections::BTreeMap;

/// `set target = value`
pub fn set(id: &str, target: &str, value: Expr) -> StepNode {
    StepNode::new(
        id,
        StepKind::SetVariable {
            target: target.to_string(),
            value,
            declare: false,
        },
    )
}

/// `let name = value`
pub fn declare(id: &str, name: &str, value: Expr) -> StepNode {
    StepNode::new(
        id,
        StepKind::SetVariable {
            target: name.to_string(),
            value,
            declare: true,
        },
    )
}

/// Script step binding its value to `bind`
pub fn script(id: &str, expr: Expr, bind: &str) -> StepNode {
    StepNode::new(
        id,
        StepKind::Script {
            expr,
            bind: Some(bind.to_string()),
        },
    )
}

fn call(target: &str, inputs: Vec<(&str, Expr)>, bind: Option<&str>) -> CallStep {
    CallStep {
        target: target.to_string(),
        inputs: inputs
            .into_iter()
            .map(|(name, expr)| (name.to_string(), expr))
            .collect::<BTreeMap<_, _>>(),
        bind: bind.map(str::to_string),
        capture: false,
    }
}

/// Tool call
pub fn tool(id: &str, target: &str, inputs: Vec<(&str, Expr)>, bind: Option<&str>) -> StepNode {
    StepNode::new(id, StepKind::ToolCall(call(target, inputs, bind)))
}

/// Model call
pub fn model(id: &str, target: &str, inputs: Vec<(&str, Expr)>, bind: Option<&str>) -> StepNode {
    StepNode::new(id, StepKind::AiCall(call(target, inputs, bind)))
}

/// Agent call
pub fn agent(id: &str, target: &str, inputs: Vec<(&str, Expr)>, bind: Option<&str>) -> StepNode {
    StepNode::new(id, StepKind::AgentCall(call(target, inputs, bind)))
}

/// Turn a call step into one whose output is the `{ok, value|error}` envelope
pub fn captured(mut node: StepNode) -> StepNode {
    match &mut node.kind {
        StepKind::AiCall(call) | StepKind::AgentCall(call) | StepKind::ToolCall(call) => {
            call.capture = true;
        }
        StepKind::DbCreate(step)
        | StepKind::DbUpdate(step)
        | StepKind::DbDelete(step)
        | StepKind::DbQuery(step) => step.capture = true,
        _ => {}
    }
    node
}

/// Insert a record
pub fn db_create(id: &str, record: &str, payload: Expr, bind: Option<&str>) -> StepNode {
    StepNode::new(
        id,
        StepKind::DbCreate(RecordStep {
            record: record.to_string(),
            payload: Some(payload),
            bind: bind.map(str::to_string),
            ..RecordStep::default()
        }),
    )
}

/// Update matching records
pub fn db_update(id: &str, record: &str, filter: Expr, changes: Expr) -> StepNode {
    StepNode::new(
        id,
        StepKind::DbUpdate(RecordStep {
            record: record.to_string(),
            payload: Some(changes),
            filter: Some(filter),
            ..RecordStep::default()
        }),
    )
}

/// Delete matching records
pub fn db_delete(id: &str, record: &str, filter: Expr) -> StepNode {
    StepNode::new(
        id,
        StepKind::DbDelete(RecordStep {
            record: record.to_string(),
            filter: Some(filter),
            ..RecordStep::default()
        }),
    )
}

/// Read matching records
pub fn db_query(id: &str, record: &str, filter: Expr, bind: Option<&str>) -> StepNode {
    StepNode::new(
        id,
        StepKind::DbQuery(RecordStep {
            record: record.to_string(),
            filter: Some(filter),
            bind: bind.map(str::to_string),
            ..RecordStep::default()
        }),
    )
}

/// `if condition { then } otherwise { otherwise }`
pub fn when(id: &str, condition: Expr, then: Vec<StepNode>, otherwise: Option<Vec<StepNode>>) -> StepNode {
    StepNode::new(
        id,
        StepKind::Conditional {
            branches: vec![ConditionalBranch {
                condition,
                body: then,
            }],
            otherwise,
        },
    )
}

/// Match over `subject`
pub fn match_on(
    id: &str,
    subject: Expr,
    arms: Vec<(Pattern, Vec<StepNode>)>,
    otherwise: Option<Vec<StepNode>>,
) -> StepNode {
    StepNode::new(
        id,
        StepKind::Match {
            subject,
            arms: arms
                .into_iter()
                .map(|(pattern, body)| MatchArm { pattern, body })
                .collect(),
            otherwise,
        },
    )
}

/// Guard leaving the enclosing scope when `condition` is false
pub fn guard(id: &str, condition: Expr, body: Vec<StepNode>) -> StepNode {
    StepNode::new(id, StepKind::Guard { condition, body })
}

/// `repeat up to count` with an optional counter
pub fn repeat(id: &str, count: Expr, counter: Option<&str>, body: Vec<StepNode>) -> StepNode {
    StepNode::new(
        id,
        StepKind::RepeatTimes {
            count,
            counter: counter.map(str::to_string),
            body,
        },
    )
}

/// Sequential `repeat for each`
pub fn repeat_each(id: &str, collection: Expr, binding: LoopBinding, body: Vec<StepNode>) -> StepNode {
    StepNode::new(
        id,
        StepKind::RepeatForEach {
            collection,
            binding,
            index: None,
            body,
        },
    )
}

/// Concurrent fan-out of `body` over `collection`
pub fn for_each(
    id: &str,
    collection: Expr,
    binding: &str,
    body: Vec<StepNode>,
    join: JoinPolicy,
) -> StepNode {
    StepNode::new(
        id,
        StepKind::ForEach {
            collection,
            binding: binding.into(),
            body,
            join,
            collect: None,
        },
    )
}

/// Independent branches
pub fn parallel(id: &str, branches: Vec<Vec<StepNode>>, join: JoinPolicy) -> StepNode {
    StepNode::new(
        id,
        StepKind::Parallel {
            branches: branches
                .into_iter()
                .map(|steps| ParallelBranch {
                    steps,
                    collect: None,
                })
                .collect(),
            join,
        },
    )
}

/// Transaction block with an optional boundary
pub fn transaction(id: &str, body: Vec<StepNode>, on_error: Option<Vec<StepNode>>) -> StepNode {
    StepNode::new(id, StepKind::Transaction { body, on_error })
}
