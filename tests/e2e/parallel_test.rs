//! End-to-end tests for fan-out, join policies and the concurrency gate

use cascade_core::{
    BinaryOp, EngineConfig, ErrorKind, Expr, Flow, JoinPolicy, RunStatus, StepKind, StepNode,
    StepStatus,
};
use cascade_test_utils::assertions::{
    assert_binding, assert_error_kind, assert_status, assert_step_status,
};
use cascade_test_utils::builders::steps::{
    db_create, for_each, parallel, script, set, tool, transaction, when,
};
use cascade_test_utils::{bindings, Reply, ScriptedInvoker, TestEngine};
use cascade_tests::checkout_store;
use serde_json::json;
use std::time::Duration;

fn item_times_ten() -> Expr {
    Expr::binary(BinaryOp::Mul, Expr::var("item"), Expr::lit(10))
}

#[tokio::test]
async fn test_wait_all_returns_every_result_in_input_order() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("explode", Reply::Fail("branch two failed".to_string()));
    let engine = TestEngine::builder().tools(tools).build()?;

    let flow = Flow::new(
        "fan_out",
        vec![for_each(
            "fan",
            Expr::var("items"),
            "item",
            vec![
                when(
                    "is_two",
                    Expr::binary(BinaryOp::Eq, Expr::var("item"), Expr::lit(2)),
                    vec![tool("explode", "explode", vec![], None)],
                    None,
                ),
                script("scale", item_times_ten(), "scaled"),
            ],
            JoinPolicy::WaitAll,
        )],
    );

    let result = engine.run(flow, bindings(json!({"items": [1, 2, 3]}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    let outputs = result.output("fan").and_then(|v| v.as_array()).expect("fan output");
    assert_eq!(outputs.len(), 3);
    assert_eq!(outputs[0], json!({"ok": true, "value": 10}));
    assert_eq!(outputs[1]["ok"], json!(false));
    assert_eq!(outputs[1]["error"]["message"], json!("branch two failed"));
    assert_eq!(outputs[1]["error"]["step_id"], json!("explode"));
    assert_eq!(outputs[2], json!({"ok": true, "value": 30}));
    assert_eq!(engine.tools.call_count("explode"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wait_all_reorders_by_input_position() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new()
        .on("slow", Reply::delayed(300, Reply::Value(json!("first"))))
        .on("medium", Reply::delayed(200, Reply::Value(json!("second"))))
        .on("fast", Reply::delayed(100, Reply::Value(json!("third"))));
    let engine = TestEngine::builder().tools(tools).build()?;

    let flow = Flow::new(
        "branches",
        vec![parallel(
            "all",
            vec![
                vec![tool("a", "slow", vec![], None)],
                vec![tool("b", "medium", vec![], None)],
                vec![tool("c", "fast", vec![], None)],
            ],
            JoinPolicy::WaitAll,
        )],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_eq!(
        result.output("all"),
        Some(&json!([
            {"ok": true, "value": "first"},
            {"ok": true, "value": "second"},
            {"ok": true, "value": "third"},
        ]))
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_aborts_remaining_branches() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new()
        .on("slow", Reply::delayed(60_000, Reply::Value(json!("late"))))
        .on("broken", Reply::delayed(10, Reply::Fail("boom".to_string())));
    let engine = TestEngine::builder().tools(tools).build()?;

    let flow = Flow::new(
        "racing",
        vec![
            parallel(
                "race",
                vec![
                    vec![tool("first", "slow", vec![], None)],
                    vec![tool("second", "broken", vec![], None)],
                    vec![tool("third", "slow", vec![], None)],
                ],
                JoinPolicy::FailFast,
            ),
            set("after", "state.after", Expr::lit(true)),
        ],
    );

    let start = tokio::time::Instant::now();
    let result = engine.run(flow, bindings(json!({}))).await?;

    assert!(start.elapsed() < Duration::from_secs(60));
    assert_status(&result, RunStatus::Failed)?;
    assert_error_kind(&result, ErrorKind::StepExecution)?;
    let error = result.error.as_ref().expect("run error");
    assert_eq!(error.message, "boom");
    assert_eq!(error.step_id.as_deref(), Some("second"));
    assert!(result.state_field("after").is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gate_bounds_in_flight_calls() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("work", Reply::delayed(50, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .config(EngineConfig {
            max_concurrency: 2,
            ..EngineConfig::default()
        })
        .build()?;

    let flow = Flow::new(
        "bounded",
        vec![for_each(
            "fan",
            Expr::var("items"),
            "item",
            vec![tool("work", "work", vec![("n", Expr::var("item"))], None)],
            JoinPolicy::WaitAll,
        )],
    );

    let result = engine
        .run(flow, bindings(json!({"items": [1, 2, 3, 4, 5, 6]})))
        .await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_eq!(engine.tools.call_count("work"), 6);
    assert_eq!(engine.tools.peak_in_flight(), 2);
    Ok(())
}

#[tokio::test]
async fn test_branches_work_on_forked_state() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let fan = StepNode::new(
        "fan",
        StepKind::ForEach {
            collection: Expr::var("items"),
            binding: "item".into(),
            body: vec![
                set("mark", "counter", Expr::var("item")),
                set("flag", "state.touched", Expr::lit(true)),
            ],
            join: JoinPolicy::WaitAll,
            collect: Some(Expr::object(vec![
                ("item", Expr::var("item")),
                ("counter", Expr::var("counter")),
            ])),
        },
    );
    let flow = Flow::new("isolated", vec![fan]);

    let result = engine
        .run(flow, bindings(json!({"items": ["x", "y"], "counter": 0})))
        .await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_binding(&result, "counter", json!(0))?;
    assert!(result.state_field("touched").is_none());
    assert_eq!(
        result.output("fan"),
        Some(&json!([
            {"ok": true, "value": {"item": "x", "counter": "x"}},
            {"ok": true, "value": {"item": "y", "counter": "y"}},
        ]))
    );
    assert_eq!(result.records_for("mark").count(), 2);
    Ok(())
}

fn audit_failure() -> StepNode {
    db_create(
        "audit",
        "AuditLog",
        Expr::object(vec![
            ("step", Expr::var("error.step_id")),
            ("kind", Expr::var("error.kind")),
        ]),
        None,
    )
}

#[tokio::test(start_paused = true)]
async fn test_fail_fast_settles_abandoned_transaction_before_boundary() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new()
        .on("boom", Reply::delayed(20, Reply::Fail("boom".to_string())))
        .on("slow", Reply::delayed(5_000, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .records(checkout_store())
        .build()?;

    let flow = Flow::new(
        "abandoned",
        vec![parallel(
            "race",
            vec![
                vec![tool("explode", "boom", vec![], None)],
                vec![transaction(
                    "tx",
                    vec![
                        db_create(
                            "create_user",
                            "User",
                            Expr::object(vec![("name", Expr::lit("ada"))]),
                            None,
                        ),
                        tool("hold", "slow", vec![], None),
                    ],
                    None,
                )],
            ],
            JoinPolicy::FailFast,
        )],
    )
    .with_on_error(vec![audit_failure()]);

    let start = tokio::time::Instant::now();
    let result = engine.run(flow, bindings(json!({}))).await?;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_status(&result, RunStatus::ErroredHandled)?;
    assert_eq!(engine.records.count("User").await, 0);
    assert_eq!(engine.records.open_snapshots().await, 0);

    let audit = engine.records.rows("AuditLog").await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["step"], json!("explode"));
    assert_eq!(audit[0]["kind"], json!("step_execution"));

    assert_step_status(&result, "create_user", StepStatus::Completed)?;
    assert_step_status(&result, "hold", StepStatus::Cancelled)?;
    let events: Vec<_> = result.events.iter().map(|e| e.event_type()).collect();
    assert!(events.contains(&"transaction.rolled_back"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sibling_branch_transactions_conflict() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("hold", Reply::delayed(50, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .records(checkout_store())
        .build()?;

    let branch = |suffix: &str| {
        vec![transaction(
            &format!("tx_{}", suffix),
            vec![
                db_create(
                    &format!("create_{}", suffix),
                    "User",
                    Expr::object(vec![("name", Expr::lit(suffix))]),
                    None,
                ),
                tool(&format!("hold_{}", suffix), "hold", vec![], None),
            ],
            None,
        )]
    };
    let flow = Flow::new(
        "siblings",
        vec![parallel("both", vec![branch("a"), branch("b")], JoinPolicy::WaitAll)],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    let outputs = result.output("both").and_then(|v| v.as_array()).expect("both output");
    assert_eq!(outputs.len(), 2);
    let committed = outputs.iter().filter(|o| o["ok"] == json!(true)).count();
    let rejected: Vec<_> = outputs.iter().filter(|o| o["ok"] == json!(false)).collect();
    assert_eq!(committed, 1);
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0]["error"]["kind"], json!("nested_transaction"));

    assert_eq!(engine.records.count("User").await, 1);
    assert_eq!(engine.records.open_snapshots().await, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_reaches_every_branch() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("slow", Reply::delayed(10_000, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .config(EngineConfig {
            run_timeout_ms: Some(200),
            ..EngineConfig::default()
        })
        .build()?;

    let flow = Flow::new(
        "stalled",
        vec![
            for_each(
                "fan",
                Expr::var("items"),
                "item",
                vec![tool("work", "slow", vec![("n", Expr::var("item"))], None)],
                JoinPolicy::WaitAll,
            ),
            set("after", "state.after", Expr::lit(true)),
        ],
    );

    let start = tokio::time::Instant::now();
    let result = engine.run(flow, bindings(json!({"items": [1, 2, 3]}))).await?;

    assert!(start.elapsed() < Duration::from_secs(10));
    assert_status(&result, RunStatus::Cancelled)?;
    assert_error_kind(&result, ErrorKind::Timeout)?;
    let work: Vec<_> = result.records_for("work").collect();
    assert_eq!(work.len(), 3);
    assert!(work.iter().all(|r| r.status == StepStatus::Cancelled));
    assert!(result.state_field("after").is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_rolls_back_branch_snapshot() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("slow", Reply::delayed(10_000, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .records(checkout_store())
        .build()?;
    let flow = Flow::new(
        "branch_tx",
        vec![parallel(
            "pair",
            vec![
                vec![tool("idle", "slow", vec![], None)],
                vec![transaction(
                    "tx",
                    vec![
                        db_create(
                            "create_user",
                            "User",
                            Expr::object(vec![("name", Expr::lit("bob"))]),
                            None,
                        ),
                        tool("hold", "slow", vec![], None),
                    ],
                    Some(vec![audit_failure()]),
                )],
            ],
            JoinPolicy::FailFast,
        )],
    );
    engine.runtime.register_flow(flow).await?;

    let token = tokio_util::sync::CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let result = engine
        .runtime
        .run_with_cancel("branch_tx", bindings(json!({})), token)
        .await?;

    assert_status(&result, RunStatus::Cancelled)?;
    assert_error_kind(&result, ErrorKind::Cancellation)?;
    assert_step_status(&result, "idle", StepStatus::Cancelled)?;
    assert_step_status(&result, "hold", StepStatus::Cancelled)?;
    assert_eq!(engine.records.count("User").await, 0);
    assert_eq!(engine.records.count("AuditLog").await, 0);
    assert_eq!(engine.records.open_snapshots().await, 0);
    Ok(())
}
