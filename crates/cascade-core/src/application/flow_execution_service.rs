//! Flow executor
//!
//! Walks the step graph of one run, dispatching every node by kind and
//! composing the shared state, control flow, retry, parallel join,
//! transaction and error boundary pieces.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::control_flow::{
    bind_loop_variables, collection_items, eval_condition, loop_count, select_arm, select_branch,
};
use crate::application::error_boundary::ErrorBoundary;
use crate::application::parallel::{
    BranchOutcome, BranchTask, ConcurrencyGate, JoinCoordinator, Stragglers,
};
use crate::application::retry::{backoff, RetryController, RetryDecision};
use crate::application::transaction::TransactionManager;
use crate::config::EngineConfig;
use crate::domain::events::DomainEvent;
use crate::domain::expression::Expr;
use crate::domain::flow_definition::Flow;
use crate::domain::flow_instance::{Run, RunId, RunStatus, StepRecord, StepStatus};
use crate::domain::repository::{Collaborators, ModelInvoker};
use crate::domain::shared_state::{ScopeKind, SharedState, STATE_BINDING, STEP_BINDING};
use crate::domain::step::{CallStep, JoinPolicy, RecordStep, StepKind, StepNode};
use crate::{CoreError, ErrorContext, ErrorKind, StepOutcome};

/// Outcome of one run, handed back to the caller
#[derive(Debug, Serialize)]
pub struct RunResult {
    /// Run identifier
    pub run_id: RunId,

    /// Flow name
    pub flow: String,

    /// Terminal status
    pub status: RunStatus,

    /// Final flow-scope bindings, `state` and `step` included
    pub outputs: Map<String, Value>,

    /// Execution record of every executed step node
    pub records: Vec<StepRecord>,

    /// Error that failed or cancelled the run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,

    /// Errors resolved by error boundaries
    pub handled_errors: Vec<ErrorContext>,

    /// Domain events recorded by the run
    #[serde(skip)]
    pub events: Vec<Box<dyn DomainEvent>>,
}

impl RunResult {
    /// Output of a completed step, `step.<id>.output`
    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(STEP_BINDING)?.get(step_id)?.get("output")
    }

    /// Final value of a flow-scope binding
    pub fn binding(&self, name: &str) -> Option<&Value> {
        self.outputs.get(name)
    }

    /// Final value of a `state.<field>` binding
    pub fn state_field(&self, field: &str) -> Option<&Value> {
        self.outputs.get(STATE_BINDING)?.get(field)
    }

    /// Records of one step id, in execution order
    pub fn records_for<'a>(&'a self, step_id: &'a str) -> impl Iterator<Item = &'a StepRecord> {
        self.records.iter().filter(move |r| r.step_id == step_id)
    }

    /// Whether the run ended `Completed` or `ErroredHandled`
    pub fn is_success(&self) -> bool {
        matches!(self.status, RunStatus::Completed | RunStatus::ErroredHandled)
    }
}

/// Run-level journal shared with every branch
struct RunJournal {
    run: Mutex<Run>,
    records: Mutex<Vec<StepRecord>>,
    handled: Mutex<Vec<ErrorContext>>,
}

impl RunJournal {
    fn new(run: Run) -> Self {
        Self {
            run: Mutex::new(run),
            records: Mutex::new(Vec::new()),
            handled: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, record: StepRecord) {
        self.run.lock().record_step(&record);
        self.records.lock().push(record);
    }

    fn rolled_back(&self, step_id: &str) {
        self.run.lock().record_rollback(step_id);
    }

    fn boundary(&self, name: &str, error: &ErrorContext) {
        self.run.lock().record_boundary(name, error);
    }

    fn handled(&self, error: ErrorContext) {
        self.handled.lock().push(error);
    }
}

/// Per-run execution context, cloned into every branch
#[derive(Clone)]
struct RunContext {
    run_id: RunId,
    collaborators: Collaborators,
    gate: ConcurrencyGate,
    transactions: Arc<TransactionManager>,
    journal: Arc<RunJournal>,
    stragglers: Stragglers,
    cancel: CancellationToken,
    default_step_timeout: Option<Duration>,
}

impl RunContext {
    fn with_cancel(&self, cancel: CancellationToken) -> Self {
        let mut ctx = self.clone();
        ctx.cancel = cancel;
        ctx
    }

    /// Wait for branches abandoned by a fail-fast join, unless this context
    /// is itself being cancelled
    async fn settle_stragglers(&self, step_id: &str) {
        if let Err(err) = self.stragglers.settle(Some(&self.cancel)).await {
            debug!(
                run_id = %self.run_id,
                step_id,
                error = %err,
                "stopped waiting for abandoned branches"
            );
        }
    }

    fn span_start(&self, step_id: &str) {
        if let Err(err) = self.collaborators.spans.start_span(&self.run_id.0, step_id) {
            debug!(run_id = %self.run_id, step_id, error = %err, "span sink rejected start");
        }
    }

    fn span_end(&self, step_id: &str, status: StepStatus) {
        if let Err(err) = self
            .collaborators
            .spans
            .end_span(&self.run_id.0, step_id, status)
        {
            debug!(run_id = %self.run_id, step_id, error = %err, "span sink rejected end");
        }
    }
}

/// Result of a single node, telling the enclosing sequence whether to stop
struct NodeOutcome {
    output: Value,
    exit_scope: bool,
}

impl NodeOutcome {
    fn value(output: Value) -> Self {
        Self {
            output,
            exit_scope: false,
        }
    }
}

enum Terminal {
    Completed,
    Failed(ErrorContext),
    Cancelled(ErrorContext),
}

#[derive(Clone, Copy)]
enum RecordOp {
    Create,
    Update,
    Delete,
    Query,
}

/// Drives runs of compiled flows
#[derive(Clone)]
pub struct FlowExecutor {
    collaborators: Collaborators,
    config: EngineConfig,
}

impl FlowExecutor {
    /// Create an executor over the given collaborators
    pub fn new(collaborators: Collaborators, config: EngineConfig) -> Self {
        Self {
            collaborators,
            config,
        }
    }

    /// Engine configuration in use
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute one run of `flow` to a terminal status
    pub async fn execute(
        &self,
        flow: &Flow,
        bindings: Map<String, Value>,
        cancel: CancellationToken,
    ) -> RunResult {
        let mut run = Run::new(flow.name.clone());
        if let Err(err) = run.start() {
            error!(flow = %flow.name, error = %err, "failed to start run");
        }
        let run_id = run.id.clone();

        let run_token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let ctx = RunContext {
            run_id: run_id.clone(),
            collaborators: self.collaborators.clone(),
            gate: ConcurrencyGate::new(self.config.max_concurrency),
            transactions: Arc::new(TransactionManager::new(
                self.collaborators.records.clone(),
            )),
            journal: Arc::new(RunJournal::new(run)),
            stragglers: Stragglers::new(),
            cancel: run_token.clone(),
            default_step_timeout: self.config.default_step_timeout(),
        };

        let deadline = self.config.run_timeout().map(|limit| {
            let token = run_token.clone();
            let flag = timed_out.clone();
            tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                flag.store(true, Ordering::SeqCst);
                token.cancel();
            })
        });

        info!(run_id = %run_id, flow = %flow.name, "run started");
        let mut state = SharedState::with_bindings(bindings);
        let outcome = self.execute_sequence(&ctx, &mut state, &flow.steps).await;
        self.settle_run(&ctx).await;

        if let Some(timer) = deadline {
            timer.abort();
        }

        let terminal = match outcome {
            Ok(_) => Terminal::Completed,
            Err(error) if error.is_cancellation() || run_token.is_cancelled() => {
                Terminal::Cancelled(self.cancellation_error(error, timed_out.load(Ordering::SeqCst)))
            }
            Err(error) => match &flow.on_error {
                Some(handler) => {
                    let boundary = ErrorBoundary::new(&flow.name, handler);
                    match self.run_boundary(&ctx, &mut state, boundary, error).await {
                        Ok(handled) => {
                            ctx.journal.handled(handled);
                            Terminal::Completed
                        }
                        Err(escaped) if escaped.is_cancellation() => Terminal::Cancelled(
                            self.cancellation_error(escaped, timed_out.load(Ordering::SeqCst)),
                        ),
                        Err(escaped) => Terminal::Failed(escaped),
                    }
                }
                None => Terminal::Failed(error),
            },
        };

        self.settle_run(&ctx).await;
        let records = std::mem::take(&mut *ctx.journal.records.lock());
        let handled_errors = std::mem::take(&mut *ctx.journal.handled.lock());

        let (status, error, events) = {
            let mut run = ctx.journal.run.lock();
            let (transition, error) = match terminal {
                Terminal::Completed => match handled_errors.last() {
                    None => (run.complete(), None),
                    Some(last) => (run.complete_handled(last.clone()), None),
                },
                Terminal::Failed(err) => (run.fail(err.clone()), Some(err)),
                Terminal::Cancelled(err) => (run.cancel(err.clone()), Some(err)),
            };
            if let Err(err) = transition {
                error!(run_id = %run_id, error = %err, "illegal run transition");
            }
            (run.status, error, run.take_events())
        };

        match &error {
            Some(err) => warn!(
                run_id = %run_id,
                flow = %flow.name,
                status = ?status,
                step_id = ?err.step_id,
                error = %err,
                "run finished"
            ),
            None => info!(
                run_id = %run_id,
                flow = %flow.name,
                status = ?status,
                handled = handled_errors.len(),
                "run finished"
            ),
        }

        RunResult {
            run_id,
            flow: flow.name.clone(),
            status,
            outputs: state.flow_bindings(),
            records,
            error,
            handled_errors,
            events,
        }
    }

    async fn settle_run(&self, ctx: &RunContext) {
        match ctx.stragglers.settle(None).await {
            Ok(0) => {}
            Ok(settled) => debug!(run_id = %ctx.run_id, settled, "abandoned branches settled"),
            Err(err) => warn!(run_id = %ctx.run_id, error = %err, "abandoned branches not settled"),
        }
    }

    fn cancellation_error(&self, error: ErrorContext, timed_out: bool) -> ErrorContext {
        let step_id = error.step_id.clone();
        let mut ctx = if timed_out {
            let limit = self.config.run_timeout_ms.unwrap_or_default();
            ErrorContext::new(
                ErrorKind::Timeout,
                format!("run exceeded its deadline of {} ms", limit),
            )
        } else if error.is_cancellation() {
            error
        } else {
            ErrorContext::cancelled("run cancelled")
        };
        ctx.step_id = ctx.step_id.or(step_id);
        ctx
    }

    fn execute_sequence<'a>(
        &'a self,
        ctx: &'a RunContext,
        state: &'a mut SharedState,
        steps: &'a [StepNode],
    ) -> BoxFuture<'a, Result<Value, ErrorContext>> {
        async move {
            let mut last = Value::Null;
            for step in steps {
                let outcome = self.execute_node(ctx, state, step).await?;
                last = outcome.output;
                if outcome.exit_scope {
                    debug!(run_id = %ctx.run_id, step_id = %step.id, "guard left the scope");
                    break;
                }
            }
            Ok(last)
        }
        .boxed()
    }

    async fn execute_scoped(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        steps: &[StepNode],
    ) -> Result<Value, ErrorContext> {
        let mut scope = state.scoped(ScopeKind::Step);
        self.execute_sequence(ctx, &mut scope, steps).await
    }

    async fn execute_node(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        node: &StepNode,
    ) -> Result<NodeOutcome, ErrorContext> {
        let started_at = Utc::now();
        let clock = Instant::now();

        if ctx.cancel.is_cancelled() {
            let error = ErrorContext::cancelled("run cancelled before the step started")
                .at_step(&node.id);
            ctx.journal.record(StepRecord {
                step_id: node.id.clone(),
                kind: node.kind.name().to_string(),
                status: StepStatus::Skipped,
                attempts: 0,
                started_at,
                duration_ms: 0,
                error: Some(error.clone()),
            });
            return Err(error);
        }

        ctx.span_start(&node.id);
        let retry = RetryController::new(node.retry.as_ref());
        let mut attempt = 0u32;

        let result = loop {
            attempt += 1;
            debug!(
                run_id = %ctx.run_id,
                step_id = %node.id,
                kind = node.kind.name(),
                attempt,
                "executing step"
            );

            let error = match self.execute_attempt(ctx, state, node).await {
                Ok(outcome) => break Ok(outcome),
                Err(error) => error.at_step(&node.id),
            };

            match retry.on_failure(attempt, error.clone()) {
                RetryDecision::GiveUp(error) => break Err(error),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        run_id = %ctx.run_id,
                        step_id = %node.id,
                        attempt,
                        max_attempts = retry.max_attempts(),
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "step attempt failed, retrying"
                    );
                    if let Err(cancelled) = backoff(delay, &ctx.cancel).await {
                        break Err(cancelled.at_step(&node.id));
                    }
                }
            }
        };

        let status = match &result {
            Ok(_) => StepStatus::Completed,
            Err(error) if error.is_cancellation() => StepStatus::Cancelled,
            Err(_) => StepStatus::Failed,
        };

        ctx.journal.record(StepRecord {
            step_id: node.id.clone(),
            kind: node.kind.name().to_string(),
            status,
            attempts: attempt,
            started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            error: result.as_ref().err().cloned(),
        });
        ctx.span_end(&node.id, status);

        match result {
            Ok(outcome) => {
                state.record_output(&node.id, outcome.output.clone());
                debug!(run_id = %ctx.run_id, step_id = %node.id, attempts = attempt, "step completed");
                Ok(outcome)
            }
            Err(error) => {
                debug!(
                    run_id = %ctx.run_id,
                    step_id = %node.id,
                    status = ?status,
                    error = %error,
                    "step did not complete"
                );
                Err(error)
            }
        }
    }

    async fn execute_attempt(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        node: &StepNode,
    ) -> Result<NodeOutcome, ErrorContext> {
        let limit = match node.timeout() {
            Some(limit) => Some(limit),
            None if node.kind.is_external() => ctx.default_step_timeout,
            None => None,
        };
        let limit = match limit {
            Some(limit) => limit,
            None => return self.execute_kind(ctx, state, node).await,
        };

        let attempt_token = ctx.cancel.child_token();
        let attempt_ctx = ctx.with_cancel(attempt_token.clone());
        let mut attempt = self.execute_kind(&attempt_ctx, state, node);
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        let mut timed_out = false;
        let result = loop {
            tokio::select! {
                result = &mut attempt => break result,
                _ = &mut deadline, if !timed_out => {
                    timed_out = true;
                    attempt_token.cancel();
                }
            }
        };

        match result {
            Err(error) if timed_out && error.is_cancellation() && !ctx.cancel.is_cancelled() => {
                Err(CoreError::TimeoutError(format!(
                    "step {} exceeded its timeout of {} ms",
                    node.id,
                    limit.as_millis()
                ))
                .at_step(&node.id))
            }
            other => other,
        }
    }

    fn execute_kind<'a>(
        &'a self,
        ctx: &'a RunContext,
        state: &'a mut SharedState,
        node: &'a StepNode,
    ) -> BoxFuture<'a, Result<NodeOutcome, ErrorContext>> {
        async move {
            match &node.kind {
                StepKind::AiCall(call) => {
                    let models = ctx.collaborators.models.as_ref();
                    self.invoke_model(ctx, state, &node.id, models, call)
                        .await
                        .map(NodeOutcome::value)
                }
                StepKind::AgentCall(call) => {
                    let agents = ctx.collaborators.agents.as_ref();
                    self.invoke_model(ctx, state, &node.id, agents, call)
                        .await
                        .map(NodeOutcome::value)
                }
                StepKind::ToolCall(call) => {
                    let args = evaluate_inputs(&call.inputs, state)?;
                    let outcome = call_external(
                        ctx,
                        &node.id,
                        ctx.collaborators.tools.invoke(&call.target, args),
                    )
                    .await?;
                    finish_call(state, call.bind.as_deref(), call.capture, outcome)
                        .map(NodeOutcome::value)
                }
                StepKind::Script { expr, bind } => {
                    let value = expr.evaluate(state)?;
                    if let Some(name) = bind {
                        state.assign(name, value.clone());
                    }
                    Ok(NodeOutcome::value(value))
                }
                StepKind::SetVariable {
                    target,
                    value,
                    declare,
                } => {
                    let value = value.evaluate(state)?;
                    assign_target(state, target, value.clone(), *declare);
                    Ok(NodeOutcome::value(value))
                }
                StepKind::DbCreate(step) => self
                    .invoke_record(ctx, state, &node.id, step, RecordOp::Create)
                    .await
                    .map(NodeOutcome::value),
                StepKind::DbUpdate(step) => self
                    .invoke_record(ctx, state, &node.id, step, RecordOp::Update)
                    .await
                    .map(NodeOutcome::value),
                StepKind::DbDelete(step) => self
                    .invoke_record(ctx, state, &node.id, step, RecordOp::Delete)
                    .await
                    .map(NodeOutcome::value),
                StepKind::DbQuery(step) => self
                    .invoke_record(ctx, state, &node.id, step, RecordOp::Query)
                    .await
                    .map(NodeOutcome::value),
                StepKind::Conditional {
                    branches,
                    otherwise,
                } => match select_branch(branches, otherwise.as_deref(), state)? {
                    Some(body) => self
                        .execute_scoped(ctx, state, body)
                        .await
                        .map(NodeOutcome::value),
                    None => Ok(NodeOutcome::value(Value::Null)),
                },
                StepKind::Match {
                    subject,
                    arms,
                    otherwise,
                } => {
                    let subject = subject.evaluate(state)?;
                    match select_arm(&subject, arms, otherwise.as_deref())? {
                        Some(arm) => {
                            let mut scope = state.scoped(ScopeKind::Step);
                            if let Some((name, value)) = arm.binding {
                                scope.declare_local(name, value);
                            }
                            self.execute_sequence(ctx, &mut scope, arm.body)
                                .await
                                .map(NodeOutcome::value)
                        }
                        None => Ok(NodeOutcome::value(Value::Null)),
                    }
                }
                StepKind::Guard { condition, body } => {
                    if eval_condition(condition, state)? {
                        return Ok(NodeOutcome::value(Value::Bool(true)));
                    }
                    // The body runs in the scope it is about to leave
                    self.execute_sequence(ctx, state, body).await?;
                    Ok(NodeOutcome {
                        output: Value::Bool(false),
                        exit_scope: true,
                    })
                }
                StepKind::RepeatTimes {
                    count,
                    counter,
                    body,
                } => {
                    let count = loop_count(&count.evaluate(state)?)?;
                    let mut outputs = Vec::new();
                    for iteration in 1..=count {
                        let mut scope = state.scoped(ScopeKind::LoopIteration);
                        if let Some(name) = counter {
                            scope.declare_local(name.clone(), json!(iteration));
                        }
                        outputs.push(self.execute_sequence(ctx, &mut scope, body).await?);
                    }
                    Ok(NodeOutcome::value(Value::Array(outputs)))
                }
                StepKind::RepeatForEach {
                    collection,
                    binding,
                    index,
                    body,
                } => {
                    let items = collection_items(collection.evaluate(state)?)?;
                    let mut outputs = Vec::with_capacity(items.len());
                    for (position, item) in items.into_iter().enumerate() {
                        let mut scope = state.scoped(ScopeKind::LoopIteration);
                        bind_loop_variables(&mut scope, binding, item)?;
                        if let Some(name) = index {
                            scope.declare_local(name.clone(), json!(position));
                        }
                        outputs.push(self.execute_sequence(ctx, &mut scope, body).await?);
                    }
                    Ok(NodeOutcome::value(Value::Array(outputs)))
                }
                StepKind::ForEach {
                    collection,
                    binding,
                    body,
                    join,
                    collect,
                } => {
                    let items = collection_items(collection.evaluate(state)?)?;
                    let template = Arc::new(body.clone());
                    let group = ctx.cancel.child_token();
                    let mut tasks = Vec::with_capacity(items.len());
                    for item in items {
                        let mut branch = state.fork(ScopeKind::LoopIteration);
                        bind_loop_variables(&mut branch, binding, item)?;
                        tasks.push(self.branch_task(
                            ctx,
                            &group,
                            branch,
                            template.clone(),
                            collect.clone(),
                        ));
                    }
                    self.join_branches(ctx, &node.id, *join, tasks, group).await
                }
                StepKind::Parallel { branches, join } => {
                    let group = ctx.cancel.child_token();
                    let tasks = branches
                        .iter()
                        .map(|branch| {
                            self.branch_task(
                                ctx,
                                &group,
                                state.fork(ScopeKind::LoopIteration),
                                Arc::new(branch.steps.clone()),
                                branch.collect.clone(),
                            )
                        })
                        .collect();
                    self.join_branches(ctx, &node.id, *join, tasks, group).await
                }
                StepKind::Transaction { body, on_error } => {
                    self.execute_transaction(ctx, state, &node.id, body, on_error.as_deref())
                        .await
                }
            }
        }
        .boxed()
    }

    async fn invoke_model(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        step_id: &str,
        invoker: &dyn ModelInvoker,
        call: &CallStep,
    ) -> Result<Value, ErrorContext> {
        let inputs = evaluate_inputs(&call.inputs, state)?;
        let outcome = call_external(ctx, step_id, invoker.invoke(&call.target, inputs)).await?;
        finish_call(state, call.bind.as_deref(), call.capture, outcome)
    }

    async fn invoke_record(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        step_id: &str,
        step: &RecordStep,
        op: RecordOp,
    ) -> Result<Value, ErrorContext> {
        let records = ctx.collaborators.records.as_ref();
        let filter = match &step.filter {
            Some(expr) => expr.evaluate(state)?,
            None => json!({}),
        };

        let outcome = match op {
            RecordOp::Create => {
                let payload = required_payload(step, state)?;
                call_external(ctx, step_id, records.create(&step.record, payload)).await?
            }
            RecordOp::Update => {
                let changes = required_payload(step, state)?;
                call_external(ctx, step_id, records.update(&step.record, filter, changes)).await?
            }
            RecordOp::Delete => {
                call_external(ctx, step_id, records.delete(&step.record, filter)).await?
            }
            RecordOp::Query => {
                call_external(ctx, step_id, records.query(&step.record, filter)).await?
            }
        };

        finish_call(state, step.bind.as_deref(), step.capture, outcome)
    }

    fn branch_task(
        &self,
        ctx: &RunContext,
        group: &CancellationToken,
        mut state: SharedState,
        steps: Arc<Vec<StepNode>>,
        collect: Option<Expr>,
    ) -> BranchTask {
        let executor = self.clone();
        let ctx = ctx.with_cancel(group.clone());
        async move {
            let last = executor.execute_sequence(&ctx, &mut state, &steps).await?;
            match collect {
                Some(expr) => Ok(expr.evaluate(&state)?),
                None => Ok(last),
            }
        }
        .boxed()
    }

    async fn join_branches(
        &self,
        ctx: &RunContext,
        step_id: &str,
        policy: JoinPolicy,
        tasks: Vec<BranchTask>,
        group: CancellationToken,
    ) -> Result<NodeOutcome, ErrorContext> {
        debug!(
            run_id = %ctx.run_id,
            step_id,
            branches = tasks.len(),
            policy = ?policy,
            "fanning out"
        );

        let outcomes = JoinCoordinator::new(policy)
            .join(tasks, group, &ctx.stragglers)
            .await?;
        if ctx.cancel.is_cancelled() {
            return Err(ErrorContext::cancelled("cancelled during fan-out").at_step(step_id));
        }

        let failed = outcomes.iter().filter(|o| !o.is_completed()).count();
        if failed > 0 {
            warn!(run_id = %ctx.run_id, step_id, failed, "branches did not complete");
        }

        Ok(NodeOutcome::value(Value::Array(
            outcomes.iter().map(BranchOutcome::to_envelope).collect(),
        )))
    }

    async fn execute_transaction(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        step_id: &str,
        body: &[StepNode],
        on_error: Option<&[StepNode]>,
    ) -> Result<NodeOutcome, ErrorContext> {
        ctx.settle_stragglers(step_id).await;
        let handle = ctx.transactions.begin().await?;
        info!(run_id = %ctx.run_id, step_id, snapshot = %handle.0, "transaction started");

        let error = match self.execute_scoped(ctx, state, body).await {
            Ok(output) => {
                ctx.transactions.commit(&handle).await?;
                info!(run_id = %ctx.run_id, step_id, "transaction committed");
                return Ok(NodeOutcome::value(output));
            }
            Err(error) => error,
        };

        warn!(
            run_id = %ctx.run_id,
            step_id,
            error = %error,
            "transaction body failed, rolling back"
        );
        ctx.settle_stragglers(step_id).await;
        if let Err(restore) = ctx.transactions.rollback(&handle).await {
            error!(run_id = %ctx.run_id, step_id, error = %restore, "rollback failed");
            let mut failure = ErrorContext::from(restore).at_step(step_id);
            failure.cause = Some(Box::new(error));
            return Err(failure);
        }
        ctx.journal.rolled_back(step_id);

        let error = error.into_rollback();
        match on_error {
            Some(handler) => {
                let boundary = ErrorBoundary::new(step_id, handler);
                let handled = self.run_boundary(ctx, state, boundary, error).await?;
                ctx.journal.handled(handled);
                Ok(NodeOutcome::value(Value::Null))
            }
            None => Err(error),
        }
    }

    async fn run_boundary(
        &self,
        ctx: &RunContext,
        state: &mut SharedState,
        boundary: ErrorBoundary<'_>,
        error: ErrorContext,
    ) -> Result<ErrorContext, ErrorContext> {
        if !boundary.intercepts(&error) {
            return Err(error);
        }

        ctx.journal.boundary(boundary.name(), &error);
        let handler_result = {
            let mut scope = boundary.enter(state, &error);
            self.execute_sequence(ctx, &mut scope, boundary.handler())
                .await
                .map(|_| ())
        };
        boundary.resolve(error, handler_result)
    }
}

/// Run a collaborator call under the run's gate, abandoning it on cancellation
async fn call_external<F>(
    ctx: &RunContext,
    step_id: &str,
    call: F,
) -> Result<StepOutcome, ErrorContext>
where
    F: Future<Output = StepOutcome> + Send,
{
    if ctx.cancel.is_cancelled() {
        return Err(ErrorContext::cancelled("cancelled before collaborator call").at_step(step_id));
    }

    let _permit = ctx
        .gate
        .acquire(&ctx.cancel)
        .await
        .map_err(|e| e.at_step(step_id))?;

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            Err(ErrorContext::cancelled("cancelled during collaborator call").at_step(step_id))
        }
        outcome = call => Ok(outcome),
    }
}

fn finish_call(
    state: &mut SharedState,
    bind: Option<&str>,
    capture: bool,
    outcome: StepOutcome,
) -> Result<Value, ErrorContext> {
    let value = if capture {
        outcome.to_envelope()
    } else {
        outcome.into_result()?
    };
    if let Some(name) = bind {
        state.assign(name, value.clone());
    }
    Ok(value)
}

fn evaluate_inputs(
    inputs: &BTreeMap<String, Expr>,
    state: &SharedState,
) -> Result<Value, CoreError> {
    let mut map = Map::new();
    for (name, expr) in inputs {
        map.insert(name.clone(), expr.evaluate(state)?);
    }
    Ok(Value::Object(map))
}

fn required_payload(step: &RecordStep, state: &SharedState) -> Result<Value, CoreError> {
    match &step.payload {
        Some(expr) => expr.evaluate(state),
        None => Err(CoreError::ValidationError(format!(
            "Record step on {} requires a payload",
            step.record
        ))),
    }
}

fn assign_target(state: &mut SharedState, target: &str, value: Value, declare: bool) {
    if let Some(field) = target.strip_prefix("state.") {
        state.set_state_field(field, value);
    } else if declare {
        state.declare_local(target, value);
    } else {
        state.assign(target, value);
    }
}
