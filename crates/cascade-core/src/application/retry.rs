use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::domain::step::RetryPolicy;
use crate::{ErrorContext, ErrorKind};

/// What to do after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Reattempt after the delay
    RetryAfter(Duration),
    /// Propagate this error
    GiveUp(ErrorContext),
}

/// Classifies attempt failures against an optional retry policy
#[derive(Debug, Clone, Copy)]
pub struct RetryController<'a> {
    policy: Option<&'a RetryPolicy>,
}

impl<'a> RetryController<'a> {
    /// Controller for a step with or without a policy
    pub fn new(policy: Option<&'a RetryPolicy>) -> Self {
        Self { policy }
    }

    /// Maximum number of attempts
    pub fn max_attempts(&self) -> u32 {
        self.policy.map(|p| p.max_attempts.max(1)).unwrap_or(1)
    }

    /// Decide after attempt number `attempt` (1-based) failed with `error`
    pub fn on_failure(&self, attempt: u32, error: ErrorContext) -> RetryDecision {
        let policy = match self.policy {
            Some(policy) => policy,
            None => return RetryDecision::GiveUp(error),
        };

        if !self.is_retryable(&error) {
            return RetryDecision::GiveUp(error);
        }

        if attempt >= policy.max_attempts {
            return RetryDecision::GiveUp(ErrorContext::retry_exhausted(attempt, error));
        }

        RetryDecision::RetryAfter(policy.delay(attempt))
    }

    fn is_retryable(&self, error: &ErrorContext) -> bool {
        match error.kind {
            ErrorKind::Timeout => self.policy.map(|p| p.retry_on_timeout).unwrap_or(false),
            kind => kind.is_retryable(),
        }
    }
}

/// Sleep for a backoff delay unless cancelled first
pub async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<(), ErrorContext> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ErrorContext::cancelled("cancelled during retry backoff")),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
