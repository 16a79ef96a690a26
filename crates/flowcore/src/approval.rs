use crate::{RunId, TenantId, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type RequestId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainMode {
    Sequential,
    Parallel,
    Quorum,
}

impl ChainMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "sequential" => Some(ChainMode::Sequential),
            "parallel" => Some(ChainMode::Parallel),
            "quorum" => Some(ChainMode::Quorum),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Cancelled,
}

impl ApprovalStatus {
    pub fn is_terminal(self) -> bool {
        self != ApprovalStatus::Pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Approved,
    Rejected,
    Delegated,
    Skipped,
    Expired,
}

impl StepStatus {
    /// Delegated steps still await the delegate's decision
    pub fn is_undecided(self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Delegated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
}

impl Decision {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "approve" | "approved" => Some(Decision::Approve),
            "reject" | "rejected" => Some(Decision::Reject),
            _ => None,
        }
    }
}

/// One approver's slot in a chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: String,
    pub approver_id: String,
    #[serde(default)]
    pub delegate_to: Option<String>,
    pub status: StepStatus,
    #[serde(default)]
    pub decided_by: Option<String>,
    #[serde(default)]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notified: bool,
}

impl ApprovalStep {
    pub fn new(id: impl Into<String>, approver_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            approver_id: approver_id.into(),
            delegate_to: None,
            status: StepStatus::Pending,
            decided_by: None,
            decided_at: None,
            reason: None,
            notified: false,
        }
    }

    /// Whoever currently holds the pending decision
    pub fn assignee(&self) -> &str {
        self.delegate_to.as_deref().unwrap_or(&self.approver_id)
    }
}

/// Audit trail line kept on the request itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
}

/// Everything needed to open an approval chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalSpec {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mode: ChainMode,
    #[serde(default)]
    pub approvers: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub quorum_required: Option<u32>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub escalation: Vec<String>,
}

impl ApprovalSpec {
    pub fn new(title: impl Into<String>, mode: ChainMode) -> Self {
        Self {
            title: title.into(),
            description: None,
            mode,
            approvers: Vec::new(),
            roles: Vec::new(),
            quorum_required: None,
            timeout_secs: None,
            escalation: Vec::new(),
        }
    }

    pub fn with_approvers<I, S>(mut self, approvers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.approvers = approvers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_quorum(mut self, quorum: u32) -> Self {
        self.quorum_required = Some(quorum);
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_escalation<I, S>(mut self, contacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.escalation = contacts.into_iter().map(Into::into).collect();
        self
    }
}

/// Persisted state of one approval chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub tenant_id: TenantId,
    /// Owning run and node execution key when opened by an approval gate
    #[serde(default)]
    pub run_id: Option<RunId>,
    #[serde(default)]
    pub node_key: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub mode: ChainMode,
    pub required_approvals: u32,
    pub status: ApprovalStatus,
    pub steps: Vec<ApprovalStep>,
    #[serde(default)]
    pub escalation: Vec<String>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub trail: Vec<TrailEntry>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn step(&self, step_id: &str) -> Option<&ApprovalStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn approvals(&self) -> u32 {
        self.count(StepStatus::Approved)
    }

    pub fn rejections(&self) -> u32 {
        self.count(StepStatus::Rejected)
    }

    /// Steps still awaiting a decision, delegated ones included
    pub fn remaining(&self) -> u32 {
        self.steps.iter().filter(|s| s.status.is_undecided()).count() as u32
    }

    fn count(&self, status: StepStatus) -> u32 {
        self.steps.iter().filter(|s| s.status == status).count() as u32
    }

    pub fn outcome(&self) -> ApprovalOutcome {
        ApprovalOutcome {
            approved: self.status == ApprovalStatus::Approved,
            status: self.status,
            request_id: self.id,
            steps: self.steps.clone(),
            trail: self.trail.clone(),
        }
    }
}

/// Terminal result handed back to the approval gate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalOutcome {
    pub approved: bool,
    pub status: ApprovalStatus,
    pub request_id: RequestId,
    pub steps: Vec<ApprovalStep>,
    pub trail: Vec<TrailEntry>,
}

impl ApprovalOutcome {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self)
            .map(Value::from)
            .unwrap_or(Value::Null)
    }
}
