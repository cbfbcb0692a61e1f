use crate::{
    domain::events::{
        DomainEvent, ErrorBoundaryInvoked, RunFinished, RunStarted, StepCompleted, StepFailed,
        TransactionRolledBack,
    },
    CoreError, ErrorContext,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Run ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Fresh random run id
    pub fn generate() -> Self {
        RunId(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Run lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, not yet invoked
    Pending,

    /// Steps are executing
    Running,

    /// Every top-level step finished without an unhandled error
    Completed,

    /// An error was caught and resolved by an error boundary
    ErroredHandled,

    /// An error escaped every boundary
    Failed,

    /// Cancelled externally or by the run timeout
    Cancelled,
}

impl RunStatus {
    /// Whether no further transition is allowed
    #[inline]
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

/// Outcome of one executed step node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Finished successfully
    Completed,
    /// Raised an error
    Failed,
    /// Never started because the run was already unwinding
    Skipped,
    /// Observed cancellation
    Cancelled,
}

/// Execution record of one step node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step id
    pub step_id: String,

    /// Step kind tag
    pub kind: String,

    /// Final status
    pub status: StepStatus,

    /// Attempts made, retries included
    pub attempts: u32,

    /// When the first attempt started
    pub started_at: DateTime<Utc>,

    /// Wall time across all attempts
    pub duration_ms: u64,

    /// Failure detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
}

/// Aggregate: one execution of a flow
#[derive(Debug)]
pub struct Run {
    /// Unique identifier
    pub id: RunId,

    /// Name of the flow being run
    pub flow_name: String,

    /// Current status
    pub status: RunStatus,

    /// Error that ended or was handled during the run
    pub error: Option<ErrorContext>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,

    events: Vec<Box<dyn DomainEvent>>,
}

impl Run {
    /// Create a pending run
    pub fn new(flow_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            flow_name: flow_name.into(),
            status: RunStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            events: Vec::with_capacity(8),
        }
    }

    /// `Pending -> Running`
    pub fn start(&mut self) -> Result<(), CoreError> {
        if self.status != RunStatus::Pending {
            return Err(CoreError::InvalidStateTransition(format!(
                "Cannot start run in state: {:?}",
                self.status
            )));
        }

        self.status = RunStatus::Running;
        self.update_timestamp();

        self.record_event(Box::new(RunStarted {
            run_id: self.id.clone(),
            flow_name: self.flow_name.clone(),
            timestamp: Utc::now(),
        }));

        Ok(())
    }

    /// `Running -> Completed`
    pub fn complete(&mut self) -> Result<(), CoreError> {
        self.finish(RunStatus::Completed, None)
    }

    /// `Running -> ErroredHandled`
    pub fn complete_handled(&mut self, handled: ErrorContext) -> Result<(), CoreError> {
        self.finish(RunStatus::ErroredHandled, Some(handled))
    }

    /// `Running -> Failed`
    pub fn fail(&mut self, error: ErrorContext) -> Result<(), CoreError> {
        self.finish(RunStatus::Failed, Some(error))
    }

    /// `Running -> Cancelled`
    pub fn cancel(&mut self, error: ErrorContext) -> Result<(), CoreError> {
        self.finish(RunStatus::Cancelled, Some(error))
    }

    fn finish(&mut self, status: RunStatus, error: Option<ErrorContext>) -> Result<(), CoreError> {
        if self.status != RunStatus::Running {
            return Err(CoreError::InvalidStateTransition(format!(
                "Cannot move run from {:?} to {:?}",
                self.status, status
            )));
        }

        self.status = status;
        self.error = error;
        self.update_timestamp();

        self.record_event(Box::new(RunFinished {
            run_id: self.id.clone(),
            status,
            timestamp: Utc::now(),
        }));

        Ok(())
    }

    /// Record the outcome of a step node
    pub fn record_step(&mut self, record: &StepRecord) {
        let event: Box<dyn DomainEvent> = match &record.error {
            None => Box::new(StepCompleted {
                run_id: self.id.clone(),
                step_id: record.step_id.clone(),
                timestamp: Utc::now(),
            }),
            Some(error) => Box::new(StepFailed {
                run_id: self.id.clone(),
                step_id: record.step_id.clone(),
                error: error.message.clone(),
                timestamp: Utc::now(),
            }),
        };
        self.record_event(event);
    }

    /// Record a transaction rollback
    pub fn record_rollback(&mut self, step_id: &str) {
        self.record_event(Box::new(TransactionRolledBack {
            run_id: self.id.clone(),
            step_id: step_id.to_string(),
            timestamp: Utc::now(),
        }));
    }

    /// Record dispatch to an error boundary
    pub fn record_boundary(&mut self, boundary: &str, error: &ErrorContext) {
        self.record_event(Box::new(ErrorBoundaryInvoked {
            run_id: self.id.clone(),
            boundary: boundary.to_string(),
            error: error.clone(),
            timestamp: Utc::now(),
        }));
    }

    /// Update the timestamp
    #[inline]
    pub fn update_timestamp(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: Box<dyn DomainEvent>) {
        self.events.push(event);
    }

    /// Get and clear all domain events
    pub fn take_events(&mut self) -> Vec<Box<dyn DomainEvent>> {
        std::mem::take(&mut self.events)
    }
}
