use crate::compiler::compile_definition;
use crate::registry::NodeRegistry;
use crate::store::Stores;
use crate::validator::GraphValidator;
use crate::WorkflowExecutor;
use chrono::Utc;
use flowcore::{
    DefinitionId, DefinitionStatus, EventBus, ExecutionEvent, ExecutionPlan, FlowError, Graph,
    NodeExecution, RunError, RunId, RunStatus, ValidationReport, Value, WorkflowDefinition,
    WorkflowRun,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

/// Main runtime: owns definitions and runs, and the walkers driving them
pub struct FlowRuntime {
    stores: Stores,
    validator: GraphValidator,
    executor: Arc<WorkflowExecutor>,
    event_bus: Arc<EventBus>,
    active: Arc<RwLock<HashMap<RunId, ActiveRun>>>,
}

/// Walker currently driving a run in this process
struct ActiveRun {
    cancellation: CancellationToken,
    done: watch::Receiver<bool>,
}

impl FlowRuntime {
    /// Create a runtime over explicit stores and event bus. Node types that
    /// publish events (the approval gate) should share `event_bus`.
    pub fn new(
        config: RuntimeConfig,
        registry: Arc<NodeRegistry>,
        stores: Stores,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let executor = Arc::new(WorkflowExecutor::new(
            registry.clone(),
            stores.runs.clone(),
            event_bus.clone(),
            config.max_parallel_nodes,
            config.max_loop_iterations,
        ));

        Self {
            validator: GraphValidator::new(registry),
            stores,
            executor,
            event_bus,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Subscribe to execution events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.event_bus.subscribe()
    }

    /// Check a graph without compiling it
    pub fn validate(&self, graph: &Graph) -> ValidationReport {
        self.validator.validate(graph)
    }

    /// Store a definition as is. Drafts are saved even when their graph
    /// does not validate.
    pub async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), FlowError> {
        self.stores.definitions.save_definition(definition).await?;
        tracing::debug!(
            definition_id = %definition.id,
            version = definition.version,
            "Saved workflow definition"
        );
        Ok(())
    }

    /// Validate, compile and activate the latest version of a definition.
    /// Validation errors block publishing and are returned in full.
    pub async fn publish(
        &self,
        tenant_id: &str,
        definition_id: DefinitionId,
    ) -> Result<WorkflowDefinition, FlowError> {
        let mut definition = self.load_latest(tenant_id, definition_id).await?;
        let graph = definition
            .graph
            .as_ref()
            .ok_or(RunError::NoGraph(definition_id))?;

        let report = self.validator.validate_or_raise(graph)?;
        for warning in &report.warnings {
            tracing::warn!(definition_id = %definition_id, "{}", warning);
        }

        definition.plan = Some(compile_definition(&definition)?);
        definition.status = DefinitionStatus::Active;
        self.stores.definitions.save_definition(&definition).await?;

        tracing::info!(
            definition_id = %definition_id,
            version = definition.version,
            "Published workflow definition"
        );
        Ok(definition)
    }

    /// Compile a definition without storing the plan (draft and test runs)
    pub fn compile_plan(&self, definition: &WorkflowDefinition) -> Result<ExecutionPlan, FlowError> {
        compile_definition(definition)
    }

    /// Create a run of the latest definition version and start walking it.
    ///
    /// Unless `is_test`, the definition must be active and below its
    /// concurrency limit. Nothing is recorded when a check fails.
    pub async fn start(
        &self,
        tenant_id: &str,
        definition_id: DefinitionId,
        input: Value,
        is_test: bool,
    ) -> Result<WorkflowRun, FlowError> {
        let definition = self.load_latest(tenant_id, definition_id).await?;
        if !is_test && definition.status != DefinitionStatus::Active {
            return Err(RunError::DefinitionNotActive(definition_id).into());
        }
        if definition.graph.is_none() {
            return Err(RunError::NoGraph(definition_id).into());
        }

        let plan = match &definition.plan {
            Some(plan) => plan.clone(),
            None => self.compile_plan(&definition)?,
        };

        let mut run = WorkflowRun::new(tenant_id, definition_id, definition.version, input, is_test);
        run.variables = plan.variables.clone();
        self.admit(&run, &definition).await?;

        tracing::info!(
            run_id = %run.id,
            definition_id = %definition_id,
            version = definition.version,
            is_test,
            "Created workflow run"
        );
        self.spawn_walker(run.id, Arc::new(plan)).await;
        Ok(run)
    }

    /// Cancel a PENDING or RUNNING run. The walker stops before its next
    /// step; a step already in flight sees its cancellation token fire.
    pub async fn cancel(&self, tenant_id: &str, run_id: RunId) -> Result<WorkflowRun, FlowError> {
        let mut run = self.get_run(tenant_id, run_id).await?;
        loop {
            if run.status.is_terminal() {
                return Err(RunError::InvalidTransition {
                    run_id,
                    status: run.status,
                    action: "cancel".to_string(),
                }
                .into());
            }

            let expected = run.status;
            let mut next = run.clone();
            next.transition(RunStatus::Cancelled)?;
            if self.stores.runs.update_run_if(&next, expected).await? {
                if let Some(active) = self.active.read().await.get(&run_id) {
                    active.cancellation.cancel();
                }
                tracing::info!(run_id = %run_id, "Cancelled workflow run");
                self.event_bus.emit(ExecutionEvent::RunCompleted {
                    run_id,
                    status: RunStatus::Cancelled,
                    error: None,
                    duration_ms: next
                        .started_at
                        .map(|at| (Utc::now() - at).num_milliseconds().max(0) as u64)
                        .unwrap_or_default(),
                    timestamp: Utc::now(),
                });
                return Ok(next);
            }

            // the walker moved the run on meanwhile
            run = self.get_run(tenant_id, run_id).await?;
        }
    }

    /// Start a new run from a FAILED one: same definition version and
    /// input, plan recompiled from that version.
    pub async fn retry(&self, tenant_id: &str, run_id: RunId) -> Result<WorkflowRun, FlowError> {
        let failed = self.get_run(tenant_id, run_id).await?;
        if failed.status != RunStatus::Failed {
            return Err(RunError::InvalidTransition {
                run_id,
                status: failed.status,
                action: "retry".to_string(),
            }
            .into());
        }

        let definition = self
            .stores
            .definitions
            .load_definition(failed.definition_id, failed.version)
            .await?
            .ok_or(RunError::DefinitionNotFound(failed.definition_id))?;
        let plan = compile_definition(&definition)?;

        let mut run = WorkflowRun::new(
            tenant_id,
            failed.definition_id,
            failed.version,
            failed.input.clone(),
            failed.is_test,
        );
        run.variables = plan.variables.clone();
        run.retry_of = Some(failed.id);
        self.admit(&run, &definition).await?;

        tracing::info!(run_id = %run.id, retry_of = %failed.id, "Retrying workflow run");
        self.spawn_walker(run.id, Arc::new(plan)).await;
        Ok(run)
    }

    pub async fn get_run(&self, tenant_id: &str, run_id: RunId) -> Result<WorkflowRun, FlowError> {
        self.stores
            .runs
            .load_run(run_id)
            .await?
            .filter(|run| run.tenant_id == tenant_id)
            .ok_or_else(|| RunError::RunNotFound(run_id).into())
    }

    pub async fn list_runs(&self, tenant_id: &str) -> Result<Vec<WorkflowRun>, FlowError> {
        Ok(self.stores.runs.list_runs(tenant_id).await?)
    }

    /// Node execution records of a run, loop iterations included
    pub async fn node_executions(
        &self,
        tenant_id: &str,
        run_id: RunId,
    ) -> Result<Vec<NodeExecution>, FlowError> {
        self.get_run(tenant_id, run_id).await?;
        Ok(self.stores.runs.list_node_executions(run_id).await?)
    }

    /// Re-spawn walkers for PENDING/RUNNING runs found in the store that no
    /// walker in this process is driving. Returns how many were resumed.
    pub async fn resume_incomplete(&self) -> Result<usize, FlowError> {
        let mut resumed = 0;
        for run in self.stores.runs.list_active_runs().await? {
            if self.active.read().await.contains_key(&run.id) {
                continue;
            }

            let plan = match self
                .stores
                .definitions
                .load_definition(run.definition_id, run.version)
                .await?
            {
                Some(definition) => match definition.plan.clone() {
                    Some(plan) => Ok(plan),
                    None => compile_definition(&definition),
                },
                None => Err(RunError::DefinitionNotFound(run.definition_id).into()),
            };

            match plan {
                Ok(plan) => {
                    tracing::info!(run_id = %run.id, status = %run.status, "Resuming incomplete run");
                    self.spawn_walker(run.id, Arc::new(plan)).await;
                    resumed += 1;
                }
                Err(e) => {
                    tracing::error!(run_id = %run.id, error = %e, "Cannot resume run");
                    let expected = run.status;
                    let mut failed = run;
                    failed.error = Some(e.to_string());
                    failed.transition(RunStatus::Failed)?;
                    self.stores.runs.update_run_if(&failed, expected).await?;
                }
            }
        }
        Ok(resumed)
    }

    /// Wait until the walker for `run_id` finishes, then return the run as
    /// stored. Returns immediately when no walker is driving it.
    pub async fn wait_for_completion(&self, run_id: RunId) -> Result<WorkflowRun, FlowError> {
        let done = self
            .active
            .read()
            .await
            .get(&run_id)
            .map(|active| active.done.clone());
        if let Some(mut done) = done {
            // a dropped sender means the walker is gone either way
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.stores
            .runs
            .load_run(run_id)
            .await?
            .ok_or_else(|| RunError::RunNotFound(run_id).into())
    }

    async fn load_latest(
        &self,
        tenant_id: &str,
        definition_id: DefinitionId,
    ) -> Result<WorkflowDefinition, FlowError> {
        self.stores
            .definitions
            .latest_definition(definition_id)
            .await?
            .filter(|d| d.tenant_id == tenant_id)
            .ok_or_else(|| RunError::DefinitionNotFound(definition_id).into())
    }

    /// Insert the run record, applying the definition's concurrency limit
    /// to non-test runs
    async fn admit(&self, run: &WorkflowRun, definition: &WorkflowDefinition) -> Result<(), FlowError> {
        let limit = (!run.is_test).then_some(definition.max_concurrent);
        if !self.stores.runs.create_run(run, limit).await? {
            tracing::warn!(
                definition_id = %definition.id,
                limit = definition.max_concurrent,
                "Concurrency limit reached"
            );
            return Err(RunError::ConcurrencyLimit {
                definition_id: definition.id,
                limit: definition.max_concurrent,
            }
            .into());
        }
        Ok(())
    }

    async fn spawn_walker(&self, run_id: RunId, plan: Arc<ExecutionPlan>) {
        let cancellation = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        self.active.write().await.insert(
            run_id,
            ActiveRun {
                cancellation: cancellation.clone(),
                done: done_rx,
            },
        );

        let executor = self.executor.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            match executor.execute(run_id, plan, cancellation).await {
                Ok(run) => tracing::debug!(run_id = %run_id, status = %run.status, "Walker finished"),
                Err(e) => tracing::error!(run_id = %run_id, error = %e, "Walker stopped with an error"),
            }
            active.write().await.remove(&run_id);
            let _ = done_tx.send(true);
        });
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Cap on concurrently dispatched members of one parallel group
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Guard for `while` and `forEach` nodes without their own limit
    pub max_loop_iterations: usize,
    pub notification_timeout_ms: u64,
    /// Directory for the JSON-file stores; in-memory when unset
    pub state_dir: Option<PathBuf>,
    pub resume_on_start: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            max_loop_iterations: 1000,
            notification_timeout_ms: 5000,
            state_dir: None,
            resume_on_start: true,
        }
    }
}
