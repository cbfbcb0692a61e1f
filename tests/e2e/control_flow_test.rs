//! End-to-end tests for sequential execution, branching, matching and loops

use cascade_core::{
    BinaryOp, ErrorKind, Expr, Flow, LoopBinding, Pattern, RunStatus, StepStatus,
};
use cascade_test_utils::assertions::{
    assert_binding, assert_error_kind, assert_status, assert_step_status,
};
use cascade_test_utils::builders::steps::{
    captured, declare, guard, match_on, repeat, repeat_each, set, tool, when,
};
use cascade_test_utils::{bindings, init_test_tracing, Reply, ScriptedInvoker, TestEngine};
use serde_json::json;

fn plus_one(name: &str) -> Expr {
    Expr::binary(BinaryOp::Add, Expr::var(name), Expr::lit(1))
}

#[tokio::test]
async fn test_sequential_steps_run_once_in_order() -> anyhow::Result<()> {
    init_test_tracing();
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "sequential",
        vec![
            set("a", "a", Expr::lit(1)),
            set("b", "b", plus_one("a")),
            set("c", "c", plus_one("b")),
        ],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "c", json!(3))?;
    let order: Vec<_> = result.records.iter().map(|r| r.step_id.as_str()).collect();
    assert_eq!(order, vec!["a", "b", "c"]);
    assert!(result.records.iter().all(|r| r.attempts == 1));
    assert_eq!(engine.spans.finished_steps(), vec!["a", "b", "c"]);
    Ok(())
}

#[tokio::test]
async fn test_flow_loaded_from_yaml() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::from_yaml(
        r#"
name: greeting
steps:
  - id: greet
    kind: script
    expr:
      type: binary
      op: add
      left: { type: literal, value: "hello " }
      right: { type: var, path: user.name }
    bind: greeting
  - id: shout
    kind: tool-call
    target: upper
    inputs:
      text: { type: var, path: greeting }
    bind: loud
"#,
    )?;

    let result = engine
        .run(flow, bindings(json!({"user": {"name": "ada"}})))
        .await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "greeting", json!("hello ada"))?;
    assert_eq!(result.output("greet"), Some(&json!("hello ada")));
    assert_eq!(
        engine.tools.calls()[0].inputs,
        json!({"text": "hello ada"})
    );
    Ok(())
}

#[tokio::test]
async fn test_guard_skips_rest_of_scope_only() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "guarded",
        vec![
            when(
                "validate",
                Expr::lit(true),
                vec![
                    guard(
                        "require_x",
                        Expr::var("x"),
                        vec![set("set_err", "err", Expr::lit("bad"))],
                    ),
                    set("skipped", "state.skipped", Expr::lit(true)),
                ],
                None,
            ),
            set("after", "state.after", Expr::lit(true)),
        ],
    );

    let result = engine
        .run(flow, bindings(json!({"x": false, "err": null})))
        .await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "err", json!("bad"))?;
    assert_binding(&result, "state.after", json!(true))?;
    assert!(result.state_field("skipped").is_none());
    assert_eq!(result.records_for("skipped").count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_guard_passes_when_condition_holds() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "guarded",
        vec![
            guard(
                "require_x",
                Expr::var("x"),
                vec![set("set_err", "err", Expr::lit("bad"))],
            ),
            set("next", "state.next", Expr::lit(true)),
        ],
    );

    let result = engine.run(flow, bindings(json!({"x": true}))).await?;

    assert_binding(&result, "state.next", json!(true))?;
    assert!(result.binding("err").is_none());
    Ok(())
}

#[tokio::test]
async fn test_match_on_plain_value_without_clause_is_exhausted() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "routing",
        vec![
            match_on(
                "route",
                Expr::var("tier"),
                vec![
                    (
                        Pattern::Literal { value: json!("gold") },
                        vec![set("gold", "state.discount", Expr::lit(20))],
                    ),
                    (
                        Pattern::Literal { value: json!("silver") },
                        vec![set("silver", "state.discount", Expr::lit(10))],
                    ),
                ],
                None,
            ),
            set("unreached", "state.unreached", Expr::lit(true)),
        ],
    );

    let result = engine.run(flow, bindings(json!({"tier": "bronze"}))).await?;

    assert_status(&result, RunStatus::Failed)?;
    assert_error_kind(&result, ErrorKind::MatchExhausted)?;
    assert_eq!(
        result.error.as_ref().and_then(|e| e.step_id.as_deref()),
        Some("route")
    );
    assert_step_status(&result, "route", StepStatus::Failed)?;
    assert!(result.state_field("unreached").is_none());
    Ok(())
}

#[tokio::test]
async fn test_match_on_captured_result() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("lookup", Reply::Fail("not found".to_string()));
    let engine = TestEngine::builder().tools(tools).build()?;

    let handle = |outcome: &str| {
        vec![
            (
                Pattern::Ok {
                    bind: Some("value".to_string()),
                },
                vec![set(&format!("{}_ok", outcome), "state.result", Expr::var("value"))],
            ),
            (
                Pattern::Err {
                    bind: Some("e".to_string()),
                },
                vec![set(&format!("{}_err", outcome), "state.result", Expr::var("e.message"))],
            ),
        ]
    };

    let flow = Flow::new(
        "lookup",
        vec![
            captured(tool("call", "lookup", vec![], Some("found"))),
            match_on("check", Expr::var("found"), handle("lookup"), None),
        ],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "state.result", json!("not found"))?;
    assert_step_status(&result, "call", StepStatus::Completed)?;
    Ok(())
}

#[tokio::test]
async fn test_loops_scope_their_bindings() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "loops",
        vec![
            declare("init", "total", Expr::lit(0)),
            repeat(
                "three_times",
                Expr::lit(3),
                Some("i"),
                vec![set(
                    "add_i",
                    "total",
                    Expr::binary(BinaryOp::Add, Expr::var("total"), Expr::var("i")),
                )],
            ),
            repeat_each(
                "pairs",
                Expr::var("prices"),
                LoopBinding::Destructure(vec!["sku".to_string(), "price".to_string()]),
                vec![
                    declare("shadow", "total", Expr::lit(-1)),
                    set("seen", "state.last_sku", Expr::var("sku")),
                ],
            ),
        ],
    );

    let result = engine
        .run(flow, bindings(json!({"prices": [["a", 1], ["b", 2]]})))
        .await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "total", json!(6))?;
    assert_binding(&result, "state.last_sku", json!("b"))?;
    assert!(result.binding("i").is_none());
    assert!(result.binding("sku").is_none());
    assert_eq!(result.records_for("add_i").count(), 3);
    Ok(())
}

#[tokio::test]
async fn test_unknown_identifier_fails_with_step_id() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new("broken", vec![set("read", "x", Expr::var("nowhere"))]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Failed)?;
    assert_error_kind(&result, ErrorKind::UnknownIdentifier)?;
    assert_eq!(
        result.error.as_ref().and_then(|e| e.step_id.as_deref()),
        Some("read")
    );
    Ok(())
}

#[tokio::test]
async fn test_flow_boundary_reads_error_details() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "bounded",
        vec![
            set("ok", "state.first", Expr::lit(1)),
            set("boom", "x", Expr::var("missing")),
            set("never", "state.never", Expr::lit(1)),
        ],
    )
    .with_on_error(vec![
        set("note_step", "state.failed_step", Expr::var("error.step_id")),
        set("note_kind", "state.failed_kind", Expr::var("error.kind")),
    ]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::ErroredHandled)?;
    assert_binding(&result, "state.failed_step", json!("boom"))?;
    assert_binding(&result, "state.failed_kind", json!("unknown_identifier"))?;
    assert!(result.state_field("never").is_none());
    assert!(result.error.is_none());
    assert_eq!(result.handled_errors.len(), 1);
    assert!(result.binding("error").is_none());
    Ok(())
}

#[tokio::test]
async fn test_failing_boundary_fails_run_with_cause() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new("doubly_broken", vec![set("boom", "x", Expr::var("missing"))])
        .with_on_error(vec![set("also_boom", "y", Expr::var("also_missing"))]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Failed)?;
    let error = result.error.as_ref().expect("run error");
    assert_eq!(error.step_id.as_deref(), Some("also_boom"));
    assert_eq!(
        error.cause.as_ref().and_then(|c| c.step_id.as_deref()),
        Some("boom")
    );
    Ok(())
}
