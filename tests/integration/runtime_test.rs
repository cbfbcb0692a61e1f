//! Integration tests for the runtime interface and its collaborators

use cascade_core::{CoreError, EngineConfig, Expr, Flow, RunStatus, StepStatus};
use cascade_state_inmemory::InMemoryRecordStore;
use cascade_test_utils::assertions::{assert_binding, assert_status};
use cascade_test_utils::builders::steps::{db_query, db_update, model, agent, script, set};
use cascade_test_utils::implementations::SpanEvent;
use cascade_test_utils::{bindings, FailingSpanSink, Reply, ScriptedInvoker, TestEngine};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn report_flow() -> Flow {
    Flow::new(
        "report",
        vec![
            db_query(
                "active",
                "User",
                Expr::object(vec![("active", Expr::lit(true))]),
                Some("users"),
            ),
            script("count", Expr::query("length(users)"), "active_count"),
            set("store", "state.report", Expr::object(vec![
                ("region", Expr::var("region")),
                ("active", Expr::var("active_count")),
            ])),
        ],
    )
}

async fn seeded_store() -> anyhow::Result<InMemoryRecordStore> {
    let store = InMemoryRecordStore::new();
    store
        .seed(
            "User",
            vec![
                json!({"name": "ada", "active": true}),
                json!({"name": "bob", "active": false}),
                json!({"name": "cy", "active": true}),
            ],
        )
        .await?;
    Ok(store)
}

#[tokio::test]
async fn test_read_only_flow_is_idempotent() -> anyhow::Result<()> {
    let engine = TestEngine::builder().records(seeded_store().await?).build()?;
    engine.runtime.register_flow(report_flow()).await?;
    let before = engine.records.rows("User").await;

    let first = engine.runtime.run("report", bindings(json!({"region": "eu"}))).await?;
    let second = engine.runtime.run("report", bindings(json!({"region": "eu"}))).await?;

    assert_status(&first, RunStatus::Completed)?;
    assert_binding(&first, "state.report", json!({"region": "eu", "active": 2}))?;
    assert_eq!(first.outputs, second.outputs);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(engine.records.rows("User").await, before);
    Ok(())
}

#[tokio::test]
async fn test_updates_are_visible_to_later_queries() -> anyhow::Result<()> {
    let engine = TestEngine::builder().records(seeded_store().await?).build()?;
    let mut flow = report_flow();
    flow.steps.insert(
        0,
        db_update(
            "activate_bob",
            "User",
            Expr::object(vec![("name", Expr::lit("bob"))]),
            Expr::object(vec![("active", Expr::lit(true))]),
        ),
    );

    let result = engine.run(flow, bindings(json!({"region": "us"}))).await?;

    assert_binding(&result, "state.report", json!({"region": "us", "active": 3}))?;
    assert_eq!(result.output("activate_bob"), Some(&json!(1)));
    Ok(())
}

#[tokio::test]
async fn test_model_and_agent_calls_reach_their_collaborators() -> anyhow::Result<()> {
    let models = ScriptedInvoker::new().on("summarise", Reply::Value(json!("short")));
    let agents = ScriptedInvoker::new().on("planner", Reply::Value(json!(["step one"])));
    let engine = TestEngine::builder().models(models).agents(agents).build()?;
    let flow = Flow::new(
        "assist",
        vec![
            model("summary", "summarise", vec![("text", Expr::var("doc"))], Some("summary")),
            agent("plan", "planner", vec![("goal", Expr::var("summary"))], Some("plan")),
        ],
    );

    let result = engine.run(flow, bindings(json!({"doc": "long text"}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "plan", json!(["step one"]))?;
    assert_eq!(engine.models.calls()[0].inputs, json!({"text": "long text"}));
    assert_eq!(engine.agents.calls()[0].inputs, json!({"goal": "short"}));
    assert_eq!(engine.models.call_count("planner"), 0);
    Ok(())
}

#[tokio::test]
async fn test_spans_follow_step_outcomes() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "traced",
        vec![set("ok", "a", Expr::lit(1)), set("bad", "b", Expr::var("missing"))],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Failed)?;
    let events = engine.spans.events();
    assert_eq!(events.len(), 4);
    assert!(matches!(
        &events[3],
        SpanEvent::End { step_id, status: StepStatus::Failed, .. } if step_id == "bad"
    ));
    assert!(events.iter().all(|e| match e {
        SpanEvent::Start { run_id, .. } | SpanEvent::End { run_id, .. } => *run_id == result.run_id.0,
    }));
    Ok(())
}

#[tokio::test]
async fn test_failing_span_sink_never_changes_the_run() -> anyhow::Result<()> {
    let engine = TestEngine::builder()
        .span_sink(Arc::new(FailingSpanSink))
        .build()?;
    let flow = Flow::new(
        "untraced",
        vec![set("a", "a", Expr::lit(1)), set("b", "b", Expr::lit(2))],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "b", json!(2))?;
    Ok(())
}

#[tokio::test]
async fn test_submitted_runs_complete_independently() -> anyhow::Result<()> {
    let engine = TestEngine::builder()
        .config(EngineConfig {
            max_concurrent_runs: 2,
            ..EngineConfig::default()
        })
        .build()?;
    engine
        .runtime
        .register_flow(Flow::new(
            "echo",
            vec![set("copy", "copy", Expr::var("input"))],
        ))
        .await?;

    let handles: Vec<_> = (0..4)
        .map(|n| {
            engine
                .runtime
                .submit("echo", bindings(json!({"input": n})), CancellationToken::new())
        })
        .collect();

    let mut run_ids = HashSet::new();
    for (n, handle) in handles.into_iter().enumerate() {
        let result = handle.await??;
        assert_binding(&result, "copy", json!(n))?;
        run_ids.insert(result.run_id.0.clone());
    }
    assert_eq!(run_ids.len(), 4);
    assert_eq!(engine.runtime.available_run_slots(), 2);
    Ok(())
}

#[tokio::test]
async fn test_unknown_flow_is_reported() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;

    let err = engine.runtime.run("ghost", bindings(json!({}))).await.unwrap_err();
    assert!(matches!(err, CoreError::FlowDefinitionNotFound(_)));

    let submitted = engine
        .runtime
        .submit("ghost", bindings(json!({})), CancellationToken::new())
        .await?;
    assert!(matches!(submitted, Err(CoreError::FlowDefinitionNotFound(_))));
    Ok(())
}

#[tokio::test]
async fn test_run_result_serializes() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new("tiny", vec![set("a", "a", Expr::lit(1))]);

    let result = engine.run(flow, bindings(json!({}))).await?;
    let rendered = serde_json::to_value(&result)?;

    assert_eq!(rendered["status"], json!("completed"));
    assert_eq!(rendered["flow"], json!("tiny"));
    assert_eq!(rendered["outputs"]["a"], json!(1));
    assert_eq!(rendered["records"][0]["status"], json!("completed"));
    assert!(rendered.get("error").is_none());
    assert!(rendered.get("events").is_none());
    Ok(())
}
