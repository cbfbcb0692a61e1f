//! Shared fixtures for the Cascade end-to-end tests.

use cascade_core::{Expr, Flow};
use cascade_state_inmemory::InMemoryRecordStore;
use cascade_test_utils::builders::steps::{db_create, set, transaction};

/// Record store with `Order.user_id` referencing `User.id`
pub fn checkout_store() -> InMemoryRecordStore {
    InMemoryRecordStore::new().with_foreign_key("Order", "user_id", "User")
}

/// Checkout flow: create a user and an order inside one transaction
///
/// `order_user` computes the order's `user_id`. The transaction boundary
/// writes one `AuditLog` row describing the failure.
pub fn checkout_flow(order_user: Expr) -> Flow {
    Flow::new(
        "checkout",
        vec![
            transaction(
                "tx",
                vec![
                    db_create(
                        "create_user",
                        "User",
                        Expr::object(vec![("name", Expr::var("customer"))]),
                        Some("user"),
                    ),
                    db_create(
                        "create_order",
                        "Order",
                        Expr::object(vec![("user_id", order_user), ("total", Expr::var("total"))]),
                        Some("order"),
                    ),
                ],
                Some(vec![db_create(
                    "audit",
                    "AuditLog",
                    Expr::object(vec![
                        ("step", Expr::var("error.step_id")),
                        ("kind", Expr::var("error.kind")),
                        ("rolled_back", Expr::var("error.is_rollback")),
                    ]),
                    None,
                )]),
            ),
            set("finish", "state.finished", Expr::lit(true)),
        ],
    )
}
