//! End-to-end tests for retries, timeouts and cancellation

use cascade_core::{EngineConfig, ErrorKind, Expr, Flow, RetryPolicy, RunStatus, StepStatus};
use cascade_test_utils::assertions::{assert_error_kind, assert_status, assert_step_status};
use cascade_test_utils::builders::steps::{db_create, set, tool, transaction};
use cascade_test_utils::{bindings, Reply, ScriptedInvoker, TestEngine};
use cascade_tests::checkout_store;
use serde_json::json;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn retried(target: &str, attempts: u32) -> cascade_core::StepNode {
    tool("call", target, vec![], Some("answer"))
        .with_retry(RetryPolicy::fixed(attempts, Duration::from_millis(100)))
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_makes_exactly_three_attempts() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("down", Reply::Fail("service unavailable".to_string()));
    let engine = TestEngine::builder().tools(tools).build()?;
    let flow = Flow::new("retrying", vec![retried("down", 3)]);

    let start = tokio::time::Instant::now();
    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Failed)?;
    assert_error_kind(&result, ErrorKind::RetryExhausted)?;
    assert_eq!(engine.tools.call_count("down"), 3);
    assert_eq!(result.records[0].attempts, 3);
    assert!(start.elapsed() >= Duration::from_millis(200));

    let error = result.error.as_ref().expect("run error");
    assert_eq!(error.step_id.as_deref(), Some("call"));
    assert_eq!(
        error.cause.as_ref().map(|c| c.kind),
        Some(ErrorKind::StepExecution)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_retry_recovers_after_transient_failures() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on(
        "flaky",
        Reply::FailTimes {
            times: 2,
            then: json!({"status": "ok"}),
        },
    );
    let engine = TestEngine::builder().tools(tools).build()?;
    let flow = Flow::new("retrying", vec![retried("flaky", 5)]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_eq!(result.binding("answer"), Some(&json!({"status": "ok"})));
    assert_eq!(result.records[0].attempts, 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_failure_is_not_retried() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on(
        "strict",
        Reply::FailWith(ErrorKind::Validation, "bad arguments".to_string()),
    );
    let engine = TestEngine::builder().tools(tools).build()?;
    let flow = Flow::new("retrying", vec![retried("strict", 3)]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_error_kind(&result, ErrorKind::Validation)?;
    assert_eq!(engine.tools.call_count("strict"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_step_timeout_is_retried_then_exhausted() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("slow", Reply::delayed(5_000, Reply::Echo));
    let engine = TestEngine::builder().tools(tools).build()?;
    let step = retried("slow", 2).with_timeout(Duration::from_millis(100));
    let flow = Flow::new("timing_out", vec![step]);

    let start = tokio::time::Instant::now();
    let result = engine.run(flow, bindings(json!({}))).await?;

    assert!(start.elapsed() < Duration::from_secs(5));
    assert_error_kind(&result, ErrorKind::RetryExhausted)?;
    let error = result.error.as_ref().expect("run error");
    assert_eq!(error.cause.as_ref().map(|c| c.kind), Some(ErrorKind::Timeout));
    assert_eq!(engine.tools.call_count("slow"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_run_timeout_cancels_the_run() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("slow", Reply::delayed(10_000, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .config(EngineConfig {
            run_timeout_ms: Some(200),
            ..EngineConfig::default()
        })
        .build()?;
    let flow = Flow::new(
        "deadline",
        vec![
            tool("wait", "slow", vec![], None),
            set("after", "state.after", Expr::lit(true)),
        ],
    )
    .with_on_error(vec![set("handler", "state.handled", Expr::lit(true))]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Cancelled)?;
    assert_error_kind(&result, ErrorKind::Timeout)?;
    assert_step_status(&result, "wait", StepStatus::Cancelled)?;
    assert!(result.state_field("after").is_none());
    assert!(result.state_field("handled").is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_external_cancellation_rolls_back_open_transaction() -> anyhow::Result<()> {
    let tools = ScriptedInvoker::new().on("slow", Reply::delayed(10_000, Reply::Echo));
    let engine = TestEngine::builder()
        .tools(tools)
        .records(checkout_store())
        .build()?;
    let flow = Flow::new(
        "interrupted",
        vec![transaction(
            "tx",
            vec![
                db_create(
                    "create_user",
                    "User",
                    Expr::object(vec![("name", Expr::lit("ada"))]),
                    None,
                ),
                tool("wait", "slow", vec![], None),
            ],
            Some(vec![db_create(
                "audit",
                "AuditLog",
                Expr::object(vec![("step", Expr::var("error.step_id"))]),
                None,
            )]),
        )],
    );
    engine.runtime.register_flow(flow).await?;

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = engine
        .runtime
        .run_with_cancel("interrupted", bindings(json!({})), token)
        .await?;

    assert_status(&result, RunStatus::Cancelled)?;
    assert_error_kind(&result, ErrorKind::Cancellation)?;
    assert_eq!(engine.records.count("User").await, 0);
    assert_eq!(engine.records.count("AuditLog").await, 0);
    assert_eq!(engine.records.open_snapshots().await, 0);
    Ok(())
}
