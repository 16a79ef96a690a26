use super::{active_count, ApprovalStore, DefinitionStore, RunStore};
use async_trait::async_trait;
use flowcore::{
    ApprovalRequest, DefinitionId, NodeExecution, RequestId, RunId, RunStatus, StoreError,
    WorkflowDefinition, WorkflowRun,
};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct MemoryState {
    definitions: HashMap<(DefinitionId, u32), WorkflowDefinition>,
    runs: HashMap<RunId, WorkflowRun>,
    nodes: HashMap<RunId, Vec<NodeExecution>>,
    approvals: HashMap<RequestId, ApprovalRequest>,
}

/// Process-local store; state is lost when the process exits
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionStore for MemoryStore {
    async fn save_definition(&self, definition: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .definitions
            .insert((definition.id, definition.version), definition.clone());
        Ok(())
    }

    async fn load_definition(
        &self,
        id: DefinitionId,
        version: u32,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.definitions.get(&(id, version)).cloned())
    }

    async fn latest_definition(&self, id: DefinitionId) -> Result<Option<WorkflowDefinition>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .definitions
            .values()
            .filter(|d| d.id == id)
            .max_by_key(|d| d.version)
            .cloned())
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, run: &WorkflowRun, limit: Option<u32>) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if let Some(limit) = limit {
            if active_count(state.runs.values(), run.definition_id) >= limit {
                return Ok(false);
            }
        }
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict(format!("run {} already exists", run.id)));
        }
        state.runs.insert(run.id, run.clone());
        Ok(true)
    }

    async fn load_run(&self, id: RunId) -> Result<Option<WorkflowRun>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.runs.get(&id).cloned())
    }

    async fn update_run_if(&self, run: &WorkflowRun, expected: RunStatus) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run.id) {
            Some(stored) if stored.status == expected => {
                *stored = run.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_runs(&self, tenant_id: &str) -> Result<Vec<WorkflowRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn list_active_runs(&self) -> Result<Vec<WorkflowRun>, StoreError> {
        let state = self.state.lock().await;
        let mut runs: Vec<_> = state
            .runs
            .values()
            .filter(|r| r.status.is_active())
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.created_at);
        Ok(runs)
    }

    async fn save_node_execution(&self, record: &NodeExecution) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let records = state.nodes.entry(record.run_id).or_default();
        let key = record.key();
        match records.iter_mut().find(|r| r.key() == key) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        Ok(())
    }

    async fn list_node_executions(&self, run_id: RunId) -> Result<Vec<NodeExecution>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.nodes.get(&run_id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl ApprovalStore for MemoryStore {
    async fn save_request(&self, request: &ApprovalRequest) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.approvals.insert(request.id, request.clone());
        Ok(())
    }

    async fn load_request(&self, id: RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.approvals.get(&id).cloned())
    }

    async fn find_request(
        &self,
        run_id: RunId,
        node_key: &str,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .approvals
            .values()
            .find(|r| r.run_id == Some(run_id) && r.node_key.as_deref() == Some(node_key))
            .cloned())
    }

    async fn list_requests(&self, tenant_id: &str) -> Result<Vec<ApprovalRequest>, StoreError> {
        let state = self.state.lock().await;
        let mut requests: Vec<_> = state
            .approvals
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.created_at);
        Ok(requests)
    }
}
