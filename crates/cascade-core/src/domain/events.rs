use crate::domain::flow_instance::{RunId, RunStatus};
use crate::ErrorContext;
use chrono::{DateTime, Utc};
use std::fmt::Debug;

/// Domain event trait for all events in the system
pub trait DomainEvent: Debug + Send + Sync {
    /// Returns the type of the event as a string
    fn event_type(&self) -> &'static str;

    /// Returns the run ID this event is associated with
    fn run_id(&self) -> &RunId;

    /// Returns the timestamp when the event occurred
    fn timestamp(&self) -> DateTime<Utc>;
}

/// Event: Run started
#[derive(Debug)]
pub struct RunStarted {
    /// The unique identifier of the run
    pub run_id: RunId,

    /// The name of the flow being run
    pub flow_name: String,

    /// The timestamp when the run started
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for RunStarted {
    fn event_type(&self) -> &'static str {
        "run.started"
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Step completed
#[derive(Debug)]
pub struct StepCompleted {
    /// The unique identifier of the run
    pub run_id: RunId,

    /// The identifier of the step that completed
    pub step_id: String,

    /// The timestamp when the step completed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepCompleted {
    fn event_type(&self) -> &'static str {
        "step.completed"
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Step failed
#[derive(Debug)]
pub struct StepFailed {
    /// The unique identifier of the run
    pub run_id: RunId,

    /// The identifier of the step that failed
    pub step_id: String,

    /// The error message
    pub error: String,

    /// The timestamp when the step failed
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for StepFailed {
    fn event_type(&self) -> &'static str {
        "step.failed"
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Transaction snapshot restored
#[derive(Debug)]
pub struct TransactionRolledBack {
    /// The unique identifier of the run
    pub run_id: RunId,

    /// The transaction step
    pub step_id: String,

    /// The timestamp of the rollback
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for TransactionRolledBack {
    fn event_type(&self) -> &'static str {
        "transaction.rolled_back"
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Error boundary dispatched
#[derive(Debug)]
pub struct ErrorBoundaryInvoked {
    /// The unique identifier of the run
    pub run_id: RunId,

    /// Transaction step id, or the flow name for the flow-level boundary
    pub boundary: String,

    /// The error handed to the boundary
    pub error: ErrorContext,

    /// The timestamp of the dispatch
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for ErrorBoundaryInvoked {
    fn event_type(&self) -> &'static str {
        "error_boundary.invoked"
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Event: Run reached a terminal status
#[derive(Debug)]
pub struct RunFinished {
    /// The unique identifier of the run
    pub run_id: RunId,

    /// The terminal status
    pub status: RunStatus,

    /// The timestamp when the run finished
    pub timestamp: DateTime<Utc>,
}

impl DomainEvent for RunFinished {
    fn event_type(&self) -> &'static str {
        "run.finished"
    }

    fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}
