//! End-to-end tests for transaction blocks and their error boundaries

use cascade_core::{CoreError, ErrorKind, Expr, Flow, RunStatus, StepStatus};
use cascade_test_utils::assertions::{assert_binding, assert_status, assert_step_status};
use cascade_test_utils::builders::steps::{db_create, set, transaction};
use cascade_test_utils::{bindings, TestEngine};
use cascade_tests::{checkout_flow, checkout_store};
use serde_json::json;

#[tokio::test]
async fn test_failed_transaction_rolls_back_and_runs_boundary() -> anyhow::Result<()> {
    let engine = TestEngine::builder().records(checkout_store()).build()?;

    let result = engine
        .run(
            checkout_flow(Expr::lit(999)),
            bindings(json!({"customer": "ada", "total": 40})),
        )
        .await?;

    assert_status(&result, RunStatus::ErroredHandled)?;
    assert_eq!(engine.records.count("User").await, 0);
    assert_eq!(engine.records.count("Order").await, 0);

    let audit = engine.records.rows("AuditLog").await;
    assert_eq!(audit.len(), 1);
    assert_eq!(audit[0]["step"], json!("create_order"));
    assert_eq!(audit[0]["kind"], json!("validation"));
    assert_eq!(audit[0]["rolled_back"], json!(true));

    assert_step_status(&result, "create_user", StepStatus::Completed)?;
    assert_step_status(&result, "create_order", StepStatus::Failed)?;
    assert_binding(&result, "state.finished", json!(true))?;
    assert_eq!(result.handled_errors.len(), 1);
    assert!(result.handled_errors[0].is_rollback);
    assert_eq!(engine.records.open_snapshots().await, 0);

    let events: Vec<_> = result.events.iter().map(|e| e.event_type()).collect();
    assert!(events.contains(&"transaction.rolled_back"));
    Ok(())
}

#[tokio::test]
async fn test_successful_transaction_commits() -> anyhow::Result<()> {
    let engine = TestEngine::builder().records(checkout_store()).build()?;

    let result = engine
        .run(
            checkout_flow(Expr::var("user.id")),
            bindings(json!({"customer": "ada", "total": 40})),
        )
        .await?;

    assert_status(&result, RunStatus::Completed)?;
    assert_eq!(engine.records.count("User").await, 1);
    assert_eq!(engine.records.count("Order").await, 1);
    assert_eq!(engine.records.count("AuditLog").await, 0);
    assert_eq!(engine.records.rows("Order").await[0]["total"], json!(40));
    assert_eq!(engine.records.open_snapshots().await, 0);
    assert!(result.binding("user").is_none());
    Ok(())
}

#[tokio::test]
async fn test_transaction_without_boundary_reaches_flow_boundary() -> anyhow::Result<()> {
    let engine = TestEngine::builder().records(checkout_store()).build()?;
    let flow = Flow::new(
        "unguarded",
        vec![
            transaction(
                "tx",
                vec![
                    db_create(
                        "create_user",
                        "User",
                        Expr::object(vec![("name", Expr::lit("bob"))]),
                        None,
                    ),
                    db_create(
                        "create_order",
                        "Order",
                        Expr::object(vec![("user_id", Expr::lit(404))]),
                        None,
                    ),
                ],
                None,
            ),
            set("after_tx", "state.after", Expr::lit(true)),
        ],
    )
    .with_on_error(vec![set(
        "note",
        "state.rolled_back",
        Expr::var("error.is_rollback"),
    )]);

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::ErroredHandled)?;
    assert_binding(&result, "state.rolled_back", json!(true))?;
    assert!(result.state_field("after").is_none());
    assert_eq!(engine.records.count("User").await, 0);
    Ok(())
}

#[tokio::test]
async fn test_failing_transaction_boundary_escalates() -> anyhow::Result<()> {
    let engine = TestEngine::builder().records(checkout_store()).build()?;
    let flow = Flow::new(
        "escalating",
        vec![transaction(
            "tx",
            vec![db_create(
                "create_order",
                "Order",
                Expr::object(vec![("user_id", Expr::lit(1))]),
                None,
            )],
            Some(vec![set("broken_handler", "x", Expr::var("undefined"))]),
        )],
    );

    let result = engine.run(flow, bindings(json!({}))).await?;

    assert_status(&result, RunStatus::Failed)?;
    let error = result.error.as_ref().expect("run error");
    assert_eq!(error.kind, ErrorKind::UnknownIdentifier);
    let cause = error.cause.as_deref().expect("cause");
    assert_eq!(cause.step_id.as_deref(), Some("create_order"));
    assert!(cause.is_rollback);
    Ok(())
}

#[tokio::test]
async fn test_nested_transaction_is_rejected_before_running() -> anyhow::Result<()> {
    let engine = TestEngine::builder().build()?;
    let flow = Flow::new(
        "nested",
        vec![transaction(
            "outer",
            vec![transaction(
                "inner",
                vec![set("x", "x", Expr::lit(1))],
                None,
            )],
            None,
        )],
    );

    let err = engine.runtime.register_flow(flow).await.unwrap_err();
    assert!(matches!(err, CoreError::NestedTransactionError(_)));
    assert!(engine.runtime.list_flows().await?.is_empty());
    Ok(())
}
