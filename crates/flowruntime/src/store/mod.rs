//! Persistence seams for definitions, runs, node execution records and
//! approval requests.
//!
//! Two backends ship: an in-memory store for tests and embedding, and a
//! JSON-file store rooted at a state directory for durable runs.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use crate::RuntimeConfig;
use async_trait::async_trait;
use flowcore::{
    ApprovalRequest, DefinitionId, NodeExecution, RequestId, RunId, RunStatus, StoreError,
    WorkflowDefinition, WorkflowRun,
};
use std::sync::Arc;

#[async_trait]
pub trait DefinitionStore: Send + Sync {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError>;

    async fn load_definition(
        &self,
        id: DefinitionId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    /// Highest stored version
    async fn latest_definition(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert `run` unless `limit` runs of the same definition are already
    /// PENDING or RUNNING. Check and insert happen under one lock.
    async fn create_run(&self, run: &WorkflowRun, limit: Option<u32>) -> Result<bool, StoreError>;

    async fn load_run(&self, id: RunId) -> Result<Option<WorkflowRun>, StoreError>;

    /// Overwrite the stored run only if its stored status is still `expected`
    async fn update_run_if(&self, run: &WorkflowRun, expected: RunStatus) -> Result<bool, StoreError>;

    async fn list_runs(&self, tenant_id: &str) -> Result<Vec<WorkflowRun>, StoreError>;

    /// Runs in PENDING or RUNNING across all tenants
    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError>;

    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError>;

    async fn list_node_executions(&self, run_id: RunId) -> Result<Vec<NodeExecution>, StoreError>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn save_request(&self, request: &ApprovalRequest) -> Result<(), StoreError>;

    async fn load_request(&self, id: RequestId) -> Result<Option<ApprovalRequest>, StoreError>;

    /// The request opened by a given node execution of a run
    async fn find_request(
        &self,
        run_id: RunId,
        node_key: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError>;

    async fn list_requests(&self, tenant_id: &str) -> Result<Vec<ApprovalRequest>, StoreError>;
}

/// The three stores the runtime needs, usually backed by one object
#[derive(Clone)]
pub struct Stores {
    pub definitions: Arc<dyn DefinitionStore>,
    pub runs: Arc<dyn RunStore>,
    pub approvals: Arc<dyn ApprovalStore>,
}

impl Stores {
    pub fn memory() -> Self {
        let store = Arc::new(MemoryStore::new());
        Self {
            definitions: store.clone(),
            runs: store.clone(),
            approvals: store,
        }
    }

    pub fn file(root: impl Into<std::path::PathBuf>) -> Self {
        let store = Arc::new(FileStore::new(root));
        Self {
            definitions: store.clone(),
            runs: store.clone(),
            approvals: store,
        }
    }

    /// File-backed when `state_dir` is set, in-memory otherwise
    pub fn from_config(config: &RuntimeConfig) -> Self {
        match &config.state_dir {
            Some(dir) => Self::file(dir.clone()),
            None => Self::memory(),
        }
    }
}

fn active_count<'a>(runs: impl Iterator<Item = &'a WorkflowRun>, definition_id: DefinitionId) -> u32 {
    runs.filter(|r| r.definition_id == definition_id && r.status.is_active())
        .count() as u32
}
