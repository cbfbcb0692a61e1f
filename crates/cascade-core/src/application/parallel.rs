//! Parallel join coordination and the run's admission gate

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::step::JoinPolicy;
use crate::{ErrorContext, ErrorKind};

/// One branch of a fan-out, resolving to the branch value
pub type BranchTask = BoxFuture<'static, Result<Value, ErrorContext>>;

/// Counting permit pool bounding in-flight collaborator calls of one run
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    size: usize,
}

impl ConcurrencyGate {
    /// Gate with `size` permits
    pub fn new(size: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured number of permits
    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently held
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a permit, giving up when `cancel` fires
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<OwnedSemaphorePermit, ErrorContext> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ErrorContext::cancelled("cancelled while waiting for a concurrency permit")),
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| ErrorContext::cancelled("concurrency gate closed"))
            }
        }
    }
}

/// Final state of one branch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BranchOutcome {
    /// The branch produced a value
    Completed {
        /// Branch value
        value: Value,
    },
    /// The branch raised an error
    Failed {
        /// The error
        error: ErrorContext,
    },
    /// The branch observed cancellation
    Cancelled {
        /// The cancellation context
        error: ErrorContext,
    },
}

impl BranchOutcome {
    fn from_result(result: Result<Value, ErrorContext>) -> Self {
        match result {
            Ok(value) => BranchOutcome::Completed { value },
            Err(error) if error.is_cancellation() => BranchOutcome::Cancelled { error },
            Err(error) => BranchOutcome::Failed { error },
        }
    }

    /// Whether the branch produced a value
    pub fn is_completed(&self) -> bool {
        matches!(self, BranchOutcome::Completed { .. })
    }

    /// `{ok, value}` or `{ok: false, error}` envelope
    pub fn to_envelope(&self) -> Value {
        match self {
            BranchOutcome::Completed { value } => json!({ "ok": true, "value": value }),
            BranchOutcome::Failed { error } | BranchOutcome::Cancelled { error } => {
                json!({ "ok": false, "error": error.to_value() })
            }
        }
    }
}

/// Result of a spawned branch task
type BranchHandle = JoinHandle<Result<Value, ErrorContext>>;

/// Branches abandoned by a fail-fast join that may still be unwinding
///
/// Shared by every branch of a run. The executor settles it before it
/// opens a snapshot, rolls one back, dispatches an error boundary or
/// reports the run, so no abandoned branch touches the store afterwards.
#[derive(Debug, Clone, Default)]
pub struct Stragglers {
    handles: Arc<Mutex<Vec<BranchHandle>>>,
}

impl Stragglers {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of branches not yet settled
    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    /// Whether every abandoned branch has been settled
    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }

    fn adopt(&self, handles: impl IntoIterator<Item = BranchHandle>) {
        self.handles.lock().extend(handles);
    }

    /// Wait until every abandoned branch has finished unwinding
    ///
    /// With `cancel`, waiting stops when the token fires and the remaining
    /// branches stay registered for a later settle.
    pub async fn settle(&self, cancel: Option<&CancellationToken>) -> Result<usize, ErrorContext> {
        let mut settled = 0;
        loop {
            let pending = std::mem::take(&mut *self.handles.lock());
            if pending.is_empty() {
                return Ok(settled);
            }

            let mut pending = pending.into_iter();
            while let Some(mut handle) = pending.next() {
                let joined = match cancel {
                    Some(token) => tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            self.adopt(std::iter::once(handle).chain(pending));
                            return Err(ErrorContext::cancelled(
                                "cancelled while waiting for abandoned branches",
                            ));
                        }
                        joined = &mut handle => joined,
                    },
                    None => handle.await,
                };
                settled += 1;
                match joined {
                    Ok(Ok(_)) => debug!("abandoned branch finished"),
                    Ok(Err(error)) => debug!(error = %error, "abandoned branch unwound"),
                    Err(join_error) => warn!(error = %join_error, "abandoned branch aborted"),
                }
            }
        }
    }
}

/// Runs branch tasks concurrently and joins them under a policy
#[derive(Debug, Clone, Copy)]
pub struct JoinCoordinator {
    policy: JoinPolicy,
}

impl JoinCoordinator {
    /// Coordinator for the given policy
    pub fn new(policy: JoinPolicy) -> Self {
        Self { policy }
    }

    /// Spawn every task and join them
    ///
    /// `group` must be the token the tasks observe. Under `wait-all` the
    /// outcomes are returned in input order. Under `fail-fast` the first
    /// failure cancels `group` and is returned at once; the unfinished
    /// tasks are handed to `stragglers` to unwind.
    pub async fn join(
        &self,
        tasks: Vec<BranchTask>,
        group: CancellationToken,
        stragglers: &Stragglers,
    ) -> Result<Vec<BranchOutcome>, ErrorContext> {
        let total = tasks.len();
        let mut handles: Vec<BranchHandle> = tasks.into_iter().map(tokio::spawn).collect();
        let mut outcomes: Vec<Option<BranchOutcome>> = vec![None; total];
        let mut first_failure = None;

        {
            let mut pending: FuturesUnordered<_> = handles
                .iter_mut()
                .enumerate()
                .map(|(index, handle)| async move { (index, handle.await) })
                .collect();

            while let Some((index, joined)) = pending.next().await {
                let result = match joined {
                    Ok(result) => result,
                    Err(join_error) => Err(ErrorContext::new(
                        ErrorKind::StepExecution,
                        format!("branch {} aborted: {}", index, join_error),
                    )),
                };

                if self.policy == JoinPolicy::FailFast {
                    if let Err(error) = &result {
                        warn!(branch = index, error = %error, "branch failed, cancelling siblings");
                        group.cancel();
                        outcomes[index] = Some(BranchOutcome::from_result(result.clone()));
                        first_failure = result.err();
                        break;
                    }
                }

                debug!(branch = index, "branch finished");
                outcomes[index] = Some(BranchOutcome::from_result(result));
            }
        }

        if let Some(error) = first_failure {
            let unfinished: Vec<BranchHandle> = handles
                .into_iter()
                .zip(outcomes.iter())
                .filter(|(_, outcome)| outcome.is_none())
                .map(|(handle, _)| handle)
                .collect();
            debug!(unfinished = unfinished.len(), "handing unfinished branches over");
            stragglers.adopt(unfinished);
            return Err(error);
        }

        Ok(outcomes
            .into_iter()
            .map(|outcome| {
                outcome.unwrap_or_else(|| BranchOutcome::Cancelled {
                    error: ErrorContext::cancelled("branch never reported"),
                })
            })
            .collect())
    }
}
