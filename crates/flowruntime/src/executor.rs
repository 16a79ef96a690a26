use crate::registry::NodeRegistry;
use crate::store::RunStore;
use chrono::Utc;
use flowcore::{
    execution_key, node_types, ports, Connection, EventBus, ExecutionEvent, ExecutionPlan,
    ExecutionStep, FlowError, Node, NodeContext, NodeError, NodeExecution, NodeExecutionStatus,
    NodeId, NodeOutput, RetryPolicy, RunError, RunId, RunStatus, StoreError, Value, WorkflowRun,
};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Walks an execution plan for one run.
///
/// Steps outside a parallel group run one at a time in plan order. Members
/// of a parallel group are dispatched together, as a small DAG, and the walk
/// only moves on once every member is terminal. Loop bodies are re-walked
/// once per iteration under their own iteration path.
///
/// Every record change is persisted before the walk continues, so a walk
/// restarted on the same run replays terminal records instead of
/// dispatching them again.
pub struct WorkflowExecutor {
    registry: Arc<NodeRegistry>,
    runs: Arc<dyn RunStore>,
    event_bus: Arc<EventBus>,
    max_parallel: usize,
    max_loop_iterations: usize,
}

/// Why a walk stopped early
#[derive(Debug)]
enum Halt {
    Failed(String),
    Cancelled,
    TimedOut,
    Error(FlowError),
}

impl From<FlowError> for Halt {
    fn from(e: FlowError) -> Self {
        Halt::Error(e)
    }
}

impl From<StoreError> for Halt {
    fn from(e: StoreError) -> Self {
        Halt::Error(e.into())
    }
}

impl From<RunError> for Halt {
    fn from(e: RunError) -> Self {
        Halt::Error(e.into())
    }
}

/// Loop scope a step is walked in
#[derive(Debug, Clone, Default)]
struct Frame {
    iteration: Vec<u32>,
    locals: BTreeMap<String, Value>,
    loop_node: Option<NodeId>,
}

impl Frame {
    fn child(&self, index: u32, loop_node: &str, locals: BTreeMap<String, Value>) -> Self {
        let mut iteration = self.iteration.clone();
        iteration.push(index);
        Self {
            iteration,
            locals,
            loop_node: Some(loop_node.to_string()),
        }
    }
}

struct RunState {
    run: WorkflowRun,
    plan: Arc<ExecutionPlan>,
    records: HashMap<String, NodeExecution>,
    /// Latest output data per node id, exposed to expressions as `nodes.<id>`
    outputs: BTreeMap<NodeId, Value>,
    last_keys: HashMap<NodeId, String>,
    depth: HashMap<NodeId, usize>,
    cancellation: CancellationToken,
}

impl RunState {
    fn new(
        run: WorkflowRun,
        plan: Arc<ExecutionPlan>,
        records: Vec<NodeExecution>,
        cancellation: CancellationToken,
    ) -> Self {
        let depth = loop_depths(&plan);
        let mut state = Self {
            run,
            plan,
            records: HashMap::new(),
            outputs: BTreeMap::new(),
            last_keys: HashMap::new(),
            depth,
            cancellation,
        };
        for record in records {
            let key = record.key();
            state.last_keys.insert(record.node_id.clone(), key.clone());
            state.records.insert(key, record);
        }
        state
    }

    /// Key of the record a connection from `source` reads, seen from `frame`
    fn source_key(&self, source: &str, frame: &Frame) -> Option<String> {
        let depth = self.depth.get(source).copied().unwrap_or(0);
        if depth <= frame.iteration.len() {
            Some(execution_key(source, &frame.iteration[..depth]))
        } else {
            self.last_keys.get(source).cloned()
        }
    }

    fn is_settled(&self, node_id: &str, frame: &Frame) -> bool {
        self.source_key(node_id, frame)
            .and_then(|key| self.records.get(&key))
            .map(|r| r.status.is_terminal())
            .unwrap_or(false)
    }

    fn replay(&mut self, key: &str) {
        if let Some(record) = self.records.get(key) {
            if let Some(output) = &record.output {
                self.outputs.insert(record.node_id.clone(), output.clone());
            }
            self.last_keys.insert(record.node_id.clone(), key.to_string());
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.run
            .deadline
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    fn check_halt(&self) -> Result<(), Halt> {
        if self.cancellation.is_cancelled() {
            return Err(Halt::Cancelled);
        }
        if matches!(self.remaining(), Some(left) if left.is_zero()) {
            return Err(Halt::TimedOut);
        }
        Ok(())
    }

    /// A node reporting cancellation only stops the walk as cancelled when
    /// the run itself was cancelled; otherwise it is an ordinary failure.
    fn failure_kind(&self, kind: FailureKind) -> FailureKind {
        if kind == FailureKind::Cancelled && !self.cancellation.is_cancelled() {
            FailureKind::Error
        } else {
            kind
        }
    }
}

enum Prepared {
    /// Replayed or skipped without dispatch
    Settled,
    Loop,
    Dispatch(DispatchJob),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Error,
    Cancelled,
    Deadline,
}

enum Outcome {
    Completed(NodeOutput),
    Failed {
        message: String,
        output: Option<NodeOutput>,
        kind: FailureKind,
    },
}

struct Dispatched {
    step_idx: usize,
    key: String,
    outcome: Outcome,
    attempts: u32,
    duration_ms: u64,
}

/// One executor invocation, retried per the step's policy
struct DispatchJob {
    step_idx: usize,
    key: String,
    node: Box<dyn Node>,
    ctx: NodeContext,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
}

impl DispatchJob {
    async fn run(self) -> Dispatched {
        let start = Instant::now();
        let max_attempts = self.retry.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let cancellation = self.ctx.cancellation.clone();
        let mut attempts = 0;

        let outcome = loop {
            attempts += 1;
            let invocation = self.node.execute(self.ctx.clone());
            let result = match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, invocation).await {
                    Ok(result) => result,
                    Err(_) => {
                        break Outcome::Failed {
                            message: NodeError::Timeout {
                                seconds: limit.as_secs(),
                            }
                            .to_string(),
                            output: None,
                            kind: FailureKind::Deadline,
                        }
                    }
                },
                None => invocation.await,
            };

            let (message, output) = match result {
                Ok(output) => match output.error.clone() {
                    None => break Outcome::Completed(output),
                    Some(message) => (message, Some(output)),
                },
                Err(NodeError::Cancelled) => {
                    break Outcome::Failed {
                        message: NodeError::Cancelled.to_string(),
                        output: None,
                        kind: FailureKind::Cancelled,
                    }
                }
                Err(e) => (e.to_string(), None),
            };

            if attempts >= max_attempts || cancellation.is_cancelled() {
                break Outcome::Failed {
                    message,
                    output,
                    kind: FailureKind::Error,
                };
            }

            let delay = self
                .retry
                .as_ref()
                .map(|p| p.delay_for(attempts))
                .unwrap_or_default();
            tracing::warn!(
                node_id = %self.ctx.node_id,
                attempt = attempts,
                error = %message,
                "Node failed; retrying in {:?}",
                delay
            );
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(delay) => false,
                _ = cancellation.cancelled() => true,
            };
            if cancelled {
                break Outcome::Failed {
                    message,
                    output,
                    kind: FailureKind::Error,
                };
            }
        };

        Dispatched {
            step_idx: self.step_idx,
            key: self.key,
            outcome,
            attempts,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }
}

/// Run the job on its own task so a panicking executor fails only its step.
/// The task starts immediately; the returned future only collects it.
fn spawn_job(job: DispatchJob) -> impl Future<Output = Dispatched> {
    let (step_idx, key) = (job.step_idx, job.key.clone());
    let handle = tokio::spawn(job.run());
    async move {
        handle.await.unwrap_or_else(|e| Dispatched {
            step_idx,
            key,
            outcome: Outcome::Failed {
                message: format!("Node task failed: {}", e),
                output: None,
                kind: FailureKind::Error,
            },
            attempts: 1,
            duration_ms: 0,
        })
    }
}

impl WorkflowExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        runs: Arc<dyn RunStore>,
        event_bus: Arc<EventBus>,
        max_parallel: usize,
        max_loop_iterations: usize,
    ) -> Self {
        Self {
            registry,
            runs,
            event_bus,
            max_parallel: max_parallel.max(1),
            max_loop_iterations,
        }
    }

    /// Drive a run to a terminal status, replaying whatever the store
    /// already holds for it. Returns the run as last persisted.
    pub async fn execute(
        &self,
        run_id: RunId,
        plan: Arc<ExecutionPlan>,
        cancellation: CancellationToken,
    ) -> Result<WorkflowRun, FlowError> {
        let mut run = self
            .runs
            .load_run(run_id)
            .await?
            .ok_or(RunError::RunNotFound(run_id))?;
        if run.status.is_terminal() {
            return Ok(run);
        }

        if run.status == RunStatus::Pending {
            let mut next = run.clone();
            next.transition(RunStatus::Running)?;
            if next.deadline.is_none() {
                next.deadline = plan
                    .timeout_secs
                    .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));
            }
            if !self.runs.update_run_if(&next, RunStatus::Pending).await? {
                return self.reload(run_id).await;
            }
            run = next;
            tracing::info!(run_id = %run_id, definition_id = %run.definition_id, "Starting workflow run");
            self.event_bus.emit(ExecutionEvent::RunStarted {
                run_id,
                definition_id: run.definition_id,
                timestamp: Utc::now(),
            });
        } else {
            tracing::info!(run_id = %run_id, "Resuming workflow run");
        }

        let records = self.runs.list_node_executions(run_id).await?;
        let mut state = RunState::new(run, plan.clone(), records, cancellation);
        let top_level: Vec<usize> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.loop_parent.is_none())
            .map(|(i, _)| i)
            .collect();

        let started = Instant::now();
        let result = self.walk(&mut state, &top_level, &Frame::default()).await;
        self.finish_run(state, result, started).await
    }

    async fn finish_run(
        &self,
        state: RunState,
        result: Result<(), Halt>,
        started: Instant,
    ) -> Result<WorkflowRun, FlowError> {
        let run_id = state.run.id;
        let duration_ms = started.elapsed().as_millis() as u64;
        let mut run = state.run.clone();

        let (status, error) = match result {
            Ok(()) => (RunStatus::Completed, None),
            Err(Halt::Failed(message)) => (RunStatus::Failed, Some(message)),
            Err(Halt::TimedOut) => (
                RunStatus::Failed,
                Some(format!(
                    "Run exceeded its timeout of {}s",
                    state.plan.timeout_secs.unwrap_or_default()
                )),
            ),
            Err(Halt::Error(e)) => (RunStatus::Failed, Some(e.to_string())),
            Err(Halt::Cancelled) => {
                let stored = self.reload(run_id).await?;
                if stored.status.is_terminal() {
                    // the canceller announces the terminal status
                    tracing::info!(run_id = %run_id, "Workflow run stopped after cancellation");
                    return Ok(stored);
                }
                (RunStatus::Failed, Some(NodeError::Cancelled.to_string()))
            }
        };

        if status == RunStatus::Completed {
            run.output = Some(run_output(&state));
        }
        run.error = error;
        run.transition(status)?;
        if !self.runs.update_run_if(&run, RunStatus::Running).await? {
            return self.reload(run_id).await;
        }

        match &run.error {
            None => tracing::info!(run_id = %run_id, duration_ms, "Workflow run completed"),
            Some(e) => tracing::error!(run_id = %run_id, error = %e, "Workflow run failed"),
        }
        self.emit_completed(&run, duration_ms);
        Ok(run)
    }

    fn emit_completed(&self, run: &WorkflowRun, duration_ms: u64) {
        self.event_bus.emit(ExecutionEvent::RunCompleted {
            run_id: run.id,
            status: run.status,
            error: run.error.clone(),
            duration_ms,
            timestamp: Utc::now(),
        });
    }

    async fn reload(&self, run_id: RunId) -> Result<WorkflowRun, FlowError> {
        Ok(self
            .runs
            .load_run(run_id)
            .await?
            .ok_or(RunError::RunNotFound(run_id))?)
    }

    /// Walk `steps` (plan indices, in plan order) within one loop scope
    fn walk<'a>(
        &'a self,
        state: &'a mut RunState,
        steps: &'a [usize],
        frame: &'a Frame,
    ) -> BoxFuture<'a, Result<(), Halt>> {
        async move {
            let plan = state.plan.clone();
            let mut started_groups: HashSet<String> = HashSet::new();
            let mut deferred: Vec<String> = Vec::new();

            for &idx in steps {
                match &plan.steps[idx].parallel_group {
                    Some(group) => {
                        if started_groups.contains(group) || deferred.contains(group) {
                            continue;
                        }
                        if group_ready(state, steps, group, frame) {
                            started_groups.insert(group.clone());
                            self.run_group(state, steps, group, frame).await?;
                        } else {
                            deferred.push(group.clone());
                        }
                    }
                    None => self.run_step(state, idx, frame).await?,
                }

                let ready: Vec<String> = deferred
                    .iter()
                    .filter(|g| group_ready(state, steps, g, frame))
                    .cloned()
                    .collect();
                for group in ready {
                    deferred.retain(|g| g != &group);
                    started_groups.insert(group.clone());
                    self.run_group(state, steps, &group, frame).await?;
                }
            }

            for group in deferred {
                self.run_group(state, steps, &group, frame).await?;
            }
            Ok(())
        }
        .boxed()
    }

    async fn run_step(&self, state: &mut RunState, idx: usize, frame: &Frame) -> Result<(), Halt> {
        match self.prepare(state, idx, frame).await? {
            Prepared::Settled => Ok(()),
            Prepared::Loop => self.run_loop(state, idx, frame).await,
            Prepared::Dispatch(job) => {
                let done = spawn_job(job).await;
                self.complete(state, done).await
            }
        }
    }

    /// Dispatch a parallel group as a DAG of its own, at most `max_parallel`
    /// members at a time. A failing member stops new launches; members
    /// already in flight are still awaited before the failure surfaces.
    async fn run_group(
        &self,
        state: &mut RunState,
        steps: &[usize],
        group: &str,
        frame: &Frame,
    ) -> Result<(), Halt> {
        let plan = state.plan.clone();
        let members: Vec<usize> = steps
            .iter()
            .copied()
            .filter(|&i| plan.steps[i].parallel_group.as_deref() == Some(group))
            .collect();
        let member_ids: HashSet<&str> = members.iter().map(|&i| plan.steps[i].node_id.as_str()).collect();

        tracing::debug!(
            run_id = %state.run.id,
            group,
            members = members.len(),
            "Dispatching parallel group"
        );

        let mut pending: VecDeque<usize> = members.iter().copied().collect();
        let mut running = FuturesUnordered::new();
        let mut halt: Option<Halt> = None;

        loop {
            let mut loops = Vec::new();
            let mut i = 0;
            while halt.is_none() && i < pending.len() && running.len() < self.max_parallel {
                let idx = pending[i];
                let deps_done = plan.steps[idx]
                    .dependencies
                    .iter()
                    .filter(|d| member_ids.contains(d.as_str()))
                    .all(|d| state.is_settled(d, frame));
                if !deps_done {
                    i += 1;
                    continue;
                }
                pending.remove(i);
                match self.prepare(state, idx, frame).await {
                    Ok(Prepared::Settled) => i = 0,
                    Ok(Prepared::Loop) => loops.push(idx),
                    Ok(Prepared::Dispatch(job)) => running.push(spawn_job(job)),
                    Err(h) => halt = Some(h),
                }
            }

            // spawned members keep running while a loop walks its body here
            let walked_loop = !loops.is_empty();
            for idx in loops {
                if halt.is_none() {
                    if let Err(h) = self.run_loop(state, idx, frame).await {
                        halt = Some(h);
                    }
                }
            }
            if walked_loop && halt.is_none() {
                continue;
            }

            let Some(done) = running.next().await else {
                break;
            };
            if let Err(h) = self.complete(state, done).await {
                halt.get_or_insert(h);
            }
        }

        if let Some(h) = halt {
            return Err(h);
        }
        for idx in pending {
            self.run_step(state, idx, frame).await?;
        }
        Ok(())
    }

    /// Replay, skip, or get a step ready to dispatch
    async fn prepare(&self, state: &mut RunState, idx: usize, frame: &Frame) -> Result<Prepared, Halt> {
        let plan = state.plan.clone();
        let step = &plan.steps[idx];
        let key = execution_key(&step.node_id, &frame.iteration);

        if state.records.get(&key).map_or(false, |r| r.status.is_terminal()) {
            state.replay(&key);
            return Ok(Prepared::Settled);
        }
        state.check_halt()?;

        if !is_live(state, step, frame) {
            self.skip(state, step, key, frame).await?;
            return Ok(Prepared::Settled);
        }
        if node_types::is_loop(&step.node_type) {
            return Ok(Prepared::Loop);
        }

        let node = match self.registry.create_node(&step.node_type, &step.config) {
            Ok(node) => node,
            Err(e) => {
                let message = e.to_string();
                let mut record = take_record(state, &key, step, frame);
                record.error = Some(message.clone());
                record.transition(NodeExecutionStatus::Failed)?;
                self.save_record(state, key, record).await?;
                return Err(Halt::Failed(message));
            }
        };

        let record = self.begin(state, &key, step, frame).await?;
        tracing::debug!(node_id = %step.node_id, attempt = record.attempt + 1, "Dispatching node");
        let ctx = self.build_context(state, step, frame);
        Ok(Prepared::Dispatch(DispatchJob {
            step_idx: idx,
            key,
            node,
            ctx,
            retry: step.retry_policy.clone(),
            timeout: state.remaining(),
        }))
    }

    /// Mark a record RUNNING (unless resumed mid-flight) and announce it
    async fn begin(
        &self,
        state: &mut RunState,
        key: &str,
        step: &ExecutionStep,
        frame: &Frame,
    ) -> Result<NodeExecution, Halt> {
        let mut record = take_record(state, key, step, frame);
        if record.status == NodeExecutionStatus::Pending {
            record.transition(NodeExecutionStatus::Running)?;
        }
        let snapshot = record.clone();
        self.save_record(state, key.to_string(), record).await?;
        self.event_bus.emit(ExecutionEvent::NodeStarted {
            run_id: state.run.id,
            node_id: step.node_id.clone(),
            node_type: step.node_type.clone(),
            attempt: snapshot.attempt + 1,
            timestamp: Utc::now(),
        });
        Ok(snapshot)
    }

    async fn skip(
        &self,
        state: &mut RunState,
        step: &ExecutionStep,
        key: String,
        frame: &Frame,
    ) -> Result<(), Halt> {
        let mut record = take_record(state, &key, step, frame);
        record.transition(NodeExecutionStatus::Skipped)?;
        self.save_record(state, key, record).await?;
        tracing::debug!(run_id = %state.run.id, node_id = %step.node_id, "Node skipped");
        self.event_bus.emit(ExecutionEvent::NodeSkipped {
            run_id: state.run.id,
            node_id: step.node_id.clone(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    /// Record the result of a dispatch and decide whether the walk goes on
    async fn complete(&self, state: &mut RunState, done: Dispatched) -> Result<(), Halt> {
        let plan = state.plan.clone();
        let step = &plan.steps[done.step_idx];
        let mut record = state
            .records
            .remove(&done.key)
            .unwrap_or_else(|| NodeExecution::new(state.run.id, step.node_id.clone(), Vec::new()));
        record.attempt += done.attempts;

        match done.outcome {
            Outcome::Completed(output) => {
                let ports = output
                    .selected_ports()
                    .unwrap_or_else(|| default_ports(&plan, &step.node_id));
                record.routed_ports = ports.clone();
                record.output = Some(output.data.clone());
                record.transition(NodeExecutionStatus::Completed)?;
                state.outputs.insert(step.node_id.clone(), output.data);
                self.save_record(state, done.key, record).await?;

                if !output.variables.is_empty() {
                    state.run.variables.extend(output.variables);
                    self.checkpoint(state).await?;
                }

                tracing::info!(
                    run_id = %state.run.id,
                    node_id = %step.node_id,
                    duration_ms = done.duration_ms,
                    ports = ?ports,
                    "Node completed"
                );
                self.event_bus.emit(ExecutionEvent::NodeCompleted {
                    run_id: state.run.id,
                    node_id: step.node_id.clone(),
                    ports,
                    duration_ms: done.duration_ms,
                    timestamp: Utc::now(),
                });
                Ok(())
            }
            Outcome::Failed {
                message,
                output,
                kind,
            } => {
                let kind = state.failure_kind(kind);
                let routed = kind == FailureKind::Error && has_error_route(&plan, &step.node_id);
                record.error = Some(message.clone());
                record.output = output.map(|o| o.data);
                if routed {
                    let data = record
                        .output
                        .clone()
                        .filter(|d| !d.is_null())
                        .unwrap_or_else(|| error_value(&message));
                    record.output = Some(data.clone());
                    record.routed_ports = vec![ports::ERROR.to_string()];
                    state.outputs.insert(step.node_id.clone(), data);
                }
                record.transition(if kind == FailureKind::Cancelled {
                    NodeExecutionStatus::Cancelled
                } else {
                    NodeExecutionStatus::Failed
                })?;
                self.save_record(state, done.key, record).await?;

                self.event_bus.emit(ExecutionEvent::NodeFailed {
                    run_id: state.run.id,
                    node_id: step.node_id.clone(),
                    error: message.clone(),
                    timestamp: Utc::now(),
                });

                match kind {
                    FailureKind::Cancelled => Err(Halt::Cancelled),
                    FailureKind::Deadline => Err(Halt::TimedOut),
                    FailureKind::Error if routed => {
                        tracing::warn!(
                            run_id = %state.run.id,
                            node_id = %step.node_id,
                            error = %message,
                            "Node failed; continuing on its error port"
                        );
                        Ok(())
                    }
                    FailureKind::Error => {
                        tracing::error!(
                            run_id = %state.run.id,
                            node_id = %step.node_id,
                            error = %message,
                            "Node failed"
                        );
                        Err(Halt::Failed(message))
                    }
                }
            }
        }
    }

    /// Drive a forEach/while node: evaluate it, walk its body once per
    /// iteration, then complete it down its exit ports.
    async fn run_loop(&self, state: &mut RunState, idx: usize, frame: &Frame) -> Result<(), Halt> {
        let plan = state.plan.clone();
        let step = &plan.steps[idx];
        let key = execution_key(&step.node_id, &frame.iteration);
        let started = Instant::now();
        self.begin(state, &key, step, frame).await?;

        let body: Vec<usize> = plan
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.loop_parent.as_deref() == Some(step.node_id.as_str()))
            .map(|(i, _)| i)
            .collect();
        let limit = step
            .config
            .get("max_iterations")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.max_loop_iterations);

        let result = if step.node_type == node_types::FOR_EACH {
            self.for_each(state, step, frame, &body, limit).await
        } else {
            self.while_loop(state, step, frame, &body, limit).await
        };

        let outcome = match result {
            Ok(Ok(summary)) => {
                let exit_ports: Vec<String> = default_ports(&plan, &step.node_id)
                    .into_iter()
                    .filter(|p| p != ports::BODY)
                    .collect();
                let ports = if exit_ports.is_empty() {
                    vec![ports::DONE.to_string()]
                } else {
                    exit_ports
                };
                Outcome::Completed(NodeOutput::new().with_data(summary).with_ports(ports))
            }
            Ok(Err(message)) => Outcome::Failed {
                message,
                output: None,
                kind: FailureKind::Error,
            },
            Err(halt) => {
                let (message, status) = match &halt {
                    Halt::Cancelled => ("Cancelled".to_string(), NodeExecutionStatus::Cancelled),
                    Halt::Failed(m) => (m.clone(), NodeExecutionStatus::Failed),
                    Halt::TimedOut => ("Run timed out".to_string(), NodeExecutionStatus::Failed),
                    Halt::Error(e) => (e.to_string(), NodeExecutionStatus::Failed),
                };
                let mut record = take_record(state, &key, step, frame);
                if record.status.can_transition_to(status) {
                    record.error = Some(message);
                    record.transition(status)?;
                    self.save_record(state, key, record).await?;
                } else {
                    state.records.insert(key, record);
                }
                return Err(halt);
            }
        };

        self.complete(
            state,
            Dispatched {
                step_idx: idx,
                key,
                outcome,
                attempts: 1,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        )
        .await
    }

    async fn for_each(
        &self,
        state: &mut RunState,
        step: &ExecutionStep,
        frame: &Frame,
        body: &[usize],
        limit: usize,
    ) -> Result<Result<Value, String>, Halt> {
        let items = match self.ask_loop(state, step, frame, 0, &frame.locals).await? {
            Ok(Value::Array(items)) => items,
            Ok(Value::Null) => Vec::new(),
            Ok(other) => {
                return Ok(Err(format!(
                    "forEach items must evaluate to an array, got {}",
                    other.type_name()
                )))
            }
            Err(message) => return Ok(Err(message)),
        };
        if items.len() > limit {
            return Ok(Err(format!(
                "forEach over {} items exceeds the iteration limit of {}",
                items.len(),
                limit
            )));
        }

        let count = items.len();
        for (index, item) in items.into_iter().enumerate() {
            let mut locals = frame.locals.clone();
            locals.insert("item".to_string(), item);
            locals.insert("index".to_string(), Value::from(index));
            locals.insert("loop".to_string(), loop_info(index, Some(count)));
            let child = frame.child(index as u32, &step.node_id, locals);
            self.walk(state, body, &child).await?;
        }

        let mut summary = BTreeMap::new();
        summary.insert("count".to_string(), Value::from(count));
        Ok(Ok(Value::Object(summary)))
    }

    async fn while_loop(
        &self,
        state: &mut RunState,
        step: &ExecutionStep,
        frame: &Frame,
        body: &[usize],
        limit: usize,
    ) -> Result<Result<Value, String>, Halt> {
        let delay = step
            .config
            .get("delay_ms")
            .and_then(Value::as_u64)
            .map(Duration::from_millis);
        let mut index: usize = 0;

        loop {
            let mut locals = frame.locals.clone();
            locals.insert("index".to_string(), Value::from(index));
            locals.insert("loop".to_string(), loop_info(index, None));

            let proceed = match self.ask_loop(state, step, frame, index as u32, &locals).await? {
                Ok(value) => value.is_truthy(),
                Err(message) => return Ok(Err(message)),
            };
            if !proceed {
                break;
            }
            if index >= limit {
                return Ok(Err(format!("while loop exceeded {} iterations", limit)));
            }

            let child = frame.child(index as u32, &step.node_id, locals);
            self.walk(state, body, &child).await?;
            index += 1;

            if let Some(delay) = delay {
                let cancelled = tokio::select! {
                    _ = tokio::time::sleep(delay) => false,
                    _ = state.cancellation.cancelled() => true,
                };
                if cancelled {
                    return Err(Halt::Cancelled);
                }
            }
        }

        let mut summary = BTreeMap::new();
        summary.insert("iterations".to_string(), Value::from(index));
        Ok(Ok(Value::Object(summary)))
    }

    /// Invoke a loop node's own executor for iteration `index`. The result
    /// is recorded under the loop's id with the iteration appended, so a
    /// resumed walk sees the same items and the same condition outcomes.
    async fn ask_loop(
        &self,
        state: &mut RunState,
        step: &ExecutionStep,
        frame: &Frame,
        index: u32,
        locals: &BTreeMap<String, Value>,
    ) -> Result<Result<Value, String>, Halt> {
        let mut iteration = frame.iteration.clone();
        iteration.push(index);
        let key = execution_key(&step.node_id, &iteration);

        if let Some(record) = state.records.get(&key) {
            if record.status == NodeExecutionStatus::Completed {
                return Ok(Ok(record.output.clone().unwrap_or_default()));
            }
        }
        state.check_halt()?;

        let node = match self.registry.create_node(&step.node_type, &step.config) {
            Ok(node) => node,
            Err(e) => return Ok(Err(e.to_string())),
        };

        let mut record = state
            .records
            .remove(&key)
            .unwrap_or_else(|| NodeExecution::new(state.run.id, step.node_id.clone(), iteration));
        if record.status == NodeExecutionStatus::Pending {
            record.transition(NodeExecutionStatus::Running)?;
        }
        self.runs.save_node_execution(&record).await?;

        let loop_frame = Frame {
            iteration: frame.iteration.clone(),
            locals: locals.clone(),
            loop_node: frame.loop_node.clone(),
        };
        let ctx = self.build_context(state, step, &loop_frame);
        let done = spawn_job(DispatchJob {
            step_idx: 0,
            key: key.clone(),
            node,
            ctx,
            retry: None,
            timeout: state.remaining(),
        })
        .await;

        record.attempt += done.attempts;
        let result = match done.outcome {
            Outcome::Completed(output) => {
                record.output = Some(output.data.clone());
                record.transition(NodeExecutionStatus::Completed)?;
                Ok(Ok(output.data))
            }
            Outcome::Failed { message, kind, .. } => {
                let kind = state.failure_kind(kind);
                record.error = Some(message.clone());
                record.transition(if kind == FailureKind::Cancelled {
                    NodeExecutionStatus::Cancelled
                } else {
                    NodeExecutionStatus::Failed
                })?;
                match kind {
                    FailureKind::Cancelled => Err(Halt::Cancelled),
                    FailureKind::Deadline => Err(Halt::TimedOut),
                    FailureKind::Error => Ok(Err(message)),
                }
            }
        };
        self.runs.save_node_execution(&record).await?;
        state.records.insert(key, record);
        result
    }

    fn build_context(&self, state: &RunState, step: &ExecutionStep, frame: &Frame) -> NodeContext {
        let run = &state.run;
        let mut grouped: BTreeMap<String, Vec<(String, Value)>> = BTreeMap::new();
        let incoming: Vec<&Connection> = dependency_edges(&state.plan, step).collect();

        for conn in &incoming {
            if !edge_live(state, conn, frame) {
                continue;
            }
            let data = if frame.loop_node.as_deref() == Some(conn.source.as_str()) {
                frame.locals.get("item").cloned().unwrap_or_default()
            } else {
                state
                    .source_key(&conn.source, frame)
                    .and_then(|key| state.records.get(&key))
                    .and_then(|r| r.output.clone())
                    .unwrap_or_default()
            };
            grouped
                .entry(conn.target_port.clone())
                .or_default()
                .push((conn.source.clone(), data));
        }

        let mut inputs: BTreeMap<String, Value> = grouped
            .into_iter()
            .map(|(port, mut sources)| {
                let value = if sources.len() == 1 {
                    sources.remove(0).1
                } else {
                    Value::Object(sources.into_iter().collect())
                };
                (port, value)
            })
            .collect();
        if incoming.is_empty() {
            inputs.insert(ports::IN.to_string(), run.input.clone());
        }

        NodeContext {
            node_id: step.node_id.clone(),
            node_type: step.node_type.clone(),
            iteration: frame.iteration.clone(),
            config: step.config.clone(),
            inputs,
            variables: run.variables.clone(),
            node_outputs: state.outputs.clone(),
            locals: frame.locals.clone(),
            run_input: run.input.clone(),
            tenant_id: run.tenant_id.clone(),
            run_id: run.id,
            is_test: run.is_test,
            mock_response: if run.is_test {
                step.config.get("mock_response").cloned()
            } else {
                None
            },
            deadline: run.deadline,
            events: self.event_bus.create_emitter(run.id, step.node_id.clone()),
            cancellation: state.cancellation.child_token(),
        }
    }

    async fn save_record(&self, state: &mut RunState, key: String, record: NodeExecution) -> Result<(), Halt> {
        self.runs.save_node_execution(&record).await?;
        state.last_keys.insert(record.node_id.clone(), key.clone());
        state.records.insert(key, record);
        Ok(())
    }

    /// Persist variables; a run cancelled meanwhile stops the walk
    async fn checkpoint(&self, state: &mut RunState) -> Result<(), Halt> {
        if self.runs.update_run_if(&state.run, RunStatus::Running).await? {
            Ok(())
        } else {
            Err(Halt::Cancelled)
        }
    }
}

fn take_record(state: &mut RunState, key: &str, step: &ExecutionStep, frame: &Frame) -> NodeExecution {
    state
        .records
        .remove(key)
        .unwrap_or_else(|| NodeExecution::new(state.run.id, step.node_id.clone(), frame.iteration.clone()))
}

/// Incoming connections that count as dependencies (loop-backs excluded)
fn dependency_edges<'a>(
    plan: &'a ExecutionPlan,
    step: &'a ExecutionStep,
) -> impl Iterator<Item = &'a Connection> + 'a {
    plan.incoming(&step.node_id)
        .filter(move |c| step.dependencies.contains(&c.source))
}

/// A connection carries control when its source is terminal and routed
/// down the connection's port. Inside a loop body, the loop's own `body`
/// port is live for the current iteration.
fn edge_live(state: &RunState, conn: &Connection, frame: &Frame) -> bool {
    if frame.loop_node.as_deref() == Some(conn.source.as_str()) {
        return conn.source_port == ports::BODY;
    }
    let Some(record) = state
        .source_key(&conn.source, frame)
        .and_then(|key| state.records.get(&key))
    else {
        return false;
    };
    matches!(
        record.status,
        NodeExecutionStatus::Completed | NodeExecutionStatus::Failed
    ) && record.routed_ports.iter().any(|p| p == &conn.source_port)
}

/// A step runs when its branch was taken and at least one incoming
/// dependency edge is live. Steps without dependencies always run.
fn is_live(state: &RunState, step: &ExecutionStep, frame: &Frame) -> bool {
    if let Some((decision, port)) = step.branch() {
        let taken = state
            .source_key(decision, frame)
            .and_then(|key| state.records.get(&key))
            .map(|r| r.routed_ports.iter().any(|p| p == port))
            .unwrap_or(false);
        if !taken {
            return false;
        }
    }
    let mut incoming = dependency_edges(&state.plan, step).peekable();
    if incoming.peek().is_none() {
        return true;
    }
    incoming.any(|conn| edge_live(state, conn, frame))
}

/// A deferred group may start once its members' dependencies outside the
/// group, within the current scope, are terminal
fn group_ready(state: &RunState, steps: &[usize], group: &str, frame: &Frame) -> bool {
    let plan = &state.plan;
    let in_scope: HashSet<&str> = steps.iter().map(|&i| plan.steps[i].node_id.as_str()).collect();
    steps
        .iter()
        .map(|&i| &plan.steps[i])
        .filter(|s| s.parallel_group.as_deref() == Some(group))
        .flat_map(|s| s.dependencies.iter())
        .filter(|d| in_scope.contains(d.as_str()))
        .filter(|d| {
            plan.step(d)
                .map(|s| s.parallel_group.as_deref() != Some(group))
                .unwrap_or(false)
        })
        .all(|d| state.is_settled(d, frame))
}

/// Ports a node continues down when its executor selects none: every
/// connected output port except `error`
fn default_ports(plan: &ExecutionPlan, node_id: &str) -> Vec<String> {
    let mut ports_out: Vec<String> = Vec::new();
    for conn in plan.outgoing(node_id) {
        if conn.source_port != ports::ERROR && !ports_out.contains(&conn.source_port) {
            ports_out.push(conn.source_port.clone());
        }
    }
    if ports_out.is_empty() {
        ports_out.push(ports::OUT.to_string());
    }
    ports_out
}

fn has_error_route(plan: &ExecutionPlan, node_id: &str) -> bool {
    plan.outgoing(node_id).any(|c| c.source_port == ports::ERROR)
}

fn error_value(message: &str) -> Value {
    let mut map = BTreeMap::new();
    map.insert("error".to_string(), Value::from(message));
    Value::Object(map)
}

fn loop_info(index: usize, count: Option<usize>) -> Value {
    let mut map = BTreeMap::new();
    map.insert("index".to_string(), Value::from(index));
    map.insert("first".to_string(), Value::Bool(index == 0));
    if let Some(count) = count {
        map.insert("count".to_string(), Value::from(count));
        map.insert("last".to_string(), Value::Bool(index + 1 == count));
    }
    Value::Object(map)
}

/// Number of enclosing loops per node
fn loop_depths(plan: &ExecutionPlan) -> HashMap<NodeId, usize> {
    plan.steps
        .iter()
        .map(|step| {
            let mut depth = 0;
            let mut parent = step.loop_parent.as_deref();
            while let Some(id) = parent {
                depth += 1;
                if depth > plan.steps.len() {
                    break;
                }
                parent = plan.step(id).and_then(|s| s.loop_parent.as_deref());
            }
            (step.node_id.clone(), depth)
        })
        .collect()
}

/// Output of the end node reached, or an object keyed by end node id when
/// several were
fn run_output(state: &RunState) -> Value {
    let mut ends: Vec<(String, Value)> = state
        .plan
        .steps
        .iter()
        .filter(|s| s.node_type == node_types::END && s.loop_parent.is_none())
        .filter_map(|s| {
            let record = state.records.get(&s.node_id)?;
            if record.status != NodeExecutionStatus::Completed {
                return None;
            }
            Some((s.node_id.clone(), record.output.clone().unwrap_or_default()))
        })
        .collect();
    match ends.len() {
        0 => Value::Null,
        1 => ends.remove(0).1,
        _ => Value::Object(ends.into_iter().collect()),
    }
}
