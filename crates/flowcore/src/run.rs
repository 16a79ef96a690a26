use crate::{DefinitionId, NodeId, RunError, TenantId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Running)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Pending, Cancelled)
                | (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// One execution of a definition against specific input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: RunId,
    pub tenant_id: TenantId,
    pub definition_id: DefinitionId,
    pub version: u32,
    pub status: RunStatus,
    pub input: Value,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub is_test: bool,
    /// Variable bindings, checkpointed whenever a step updates them
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    /// Absolute wall-clock deadline derived from the plan timeout
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_of: Option<RunId>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowRun {
    pub fn new(
        tenant_id: impl Into<String>,
        definition_id: DefinitionId,
        version: u32,
        input: Value,
        is_test: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            definition_id,
            version,
            status: RunStatus::Pending,
            input,
            output: None,
            error: None,
            is_test,
            variables: BTreeMap::new(),
            deadline: None,
            retry_of: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping timestamps. Terminal states are final.
    pub fn transition(&mut self, next: RunStatus) -> Result<(), RunError> {
        if !self.status.can_transition_to(next) {
            return Err(RunError::InvalidTransition {
                run_id: self.id,
                status: self.status,
                action: next.to_string(),
            });
        }
        self.status = next;
        let now = Utc::now();
        if next == RunStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeExecutionStatus::Pending | NodeExecutionStatus::Running)
    }

    fn rank(self) -> u8 {
        match self {
            NodeExecutionStatus::Pending => 0,
            NodeExecutionStatus::Running => 1,
            _ => 2,
        }
    }

    /// Forward-only: pending -> running -> terminal, or pending -> terminal.
    pub fn can_transition_to(self, next: NodeExecutionStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl fmt::Display for NodeExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeExecutionStatus::Pending => "PENDING",
            NodeExecutionStatus::Running => "RUNNING",
            NodeExecutionStatus::Completed => "COMPLETED",
            NodeExecutionStatus::Failed => "FAILED",
            NodeExecutionStatus::Skipped => "SKIPPED",
            NodeExecutionStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Per (run, node, loop iteration) execution record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub run_id: RunId,
    pub node_id: NodeId,
    /// Loop iteration path; empty outside loop bodies
    #[serde(default)]
    pub iteration: Vec<u32>,
    pub status: NodeExecutionStatus,
    #[serde(default)]
    pub output: Option<Value>,
    /// Output ports the walk continues down once terminal
    #[serde(default)]
    pub routed_ports: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
}

impl NodeExecution {
    pub fn new(run_id: RunId, node_id: impl Into<String>, iteration: Vec<u32>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            iteration,
            status: NodeExecutionStatus::Pending,
            output: None,
            routed_ports: Vec::new(),
            error: None,
            started_at: None,
            completed_at: None,
            attempt: 0,
        }
    }

    /// Storage key: `node` or `node@0.3` inside loop bodies
    pub fn key(&self) -> String {
        execution_key(&self.node_id, &self.iteration)
    }

    pub fn transition(&mut self, next: NodeExecutionStatus) -> Result<(), RunError> {
        if !self.status.can_transition_to(next) {
            return Err(RunError::InvalidNodeTransition {
                node_id: self.key(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        let now = Utc::now();
        if next == NodeExecutionStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        Ok(())
    }
}

pub fn execution_key(node_id: &str, iteration: &[u32]) -> String {
    if iteration.is_empty() {
        node_id.to_string()
    } else {
        let path: Vec<String> = iteration.iter().map(|i| i.to_string()).collect();
        format!("{}@{}", node_id, path.join("."))
    }
}
