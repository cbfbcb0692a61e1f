use tracing::{info, warn};

use crate::domain::shared_state::{ScopeGuard, ScopeKind, SharedState};
use crate::domain::step::StepNode;
use crate::ErrorContext;

/// Name the triggering error is bound to inside a handler
pub const ERROR_BINDING: &str = "error";

/// Fallback step sequence attached to a flow or a transaction block
#[derive(Debug, Clone, Copy)]
pub struct ErrorBoundary<'a> {
    name: &'a str,
    handler: &'a [StepNode],
}

impl<'a> ErrorBoundary<'a> {
    /// Boundary named after its owner (flow name or transaction step id)
    pub fn new(name: &'a str, handler: &'a [StepNode]) -> Self {
        Self { name, handler }
    }

    /// Owner of the boundary
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Fallback steps
    pub fn handler(&self) -> &'a [StepNode] {
        self.handler
    }

    /// Whether the boundary handles this error; cancellation always passes through
    pub fn intercepts(&self, error: &ErrorContext) -> bool {
        !error.is_cancellation()
    }

    /// Open the handler scope with the error bound as `error`
    pub fn enter<'s>(&self, state: &'s mut SharedState, error: &ErrorContext) -> ScopeGuard<'s> {
        info!(
            boundary = self.name,
            kind = %error.kind,
            step_id = ?error.step_id,
            is_rollback = error.is_rollback,
            "dispatching error boundary"
        );
        let mut scope = state.scoped(ScopeKind::Step);
        scope.declare_local(ERROR_BINDING, error.to_value());
        scope
    }

    /// Combine the triggering error with the handler's outcome
    ///
    /// A successful handler yields the handled error. A failing handler yields
    /// its own error, caused by the triggering one.
    pub fn resolve(
        &self,
        error: ErrorContext,
        handler_result: Result<(), ErrorContext>,
    ) -> Result<ErrorContext, ErrorContext> {
        match handler_result {
            Ok(()) => Ok(error),
            Err(mut failure) => {
                warn!(boundary = self.name, error = %failure, "error boundary failed");
                if failure.cause.is_none() && !failure.is_cancellation() {
                    failure.cause = Some(Box::new(error));
                }
                Err(failure)
            }
        }
    }
}
