use crate::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub type NodeId = String;
pub type DefinitionId = Uuid;
pub type TenantId = String;

/// Node type identifiers the validator, compiler and walker treat specially
pub mod node_types {
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const CONDITION: &str = "condition";
    pub const SWITCH: &str = "switch";
    pub const FOR_EACH: &str = "forEach";
    pub const WHILE: &str = "while";
    pub const PARALLEL: &str = "parallel";
    pub const MERGE: &str = "merge";
    pub const SCRIPT: &str = "script";
    pub const APPROVAL_GATE: &str = "approval_gate";

    pub fn is_start(node_type: &str) -> bool {
        node_type == START
    }

    pub fn is_loop(node_type: &str) -> bool {
        node_type == FOR_EACH || node_type == WHILE
    }

    pub fn is_decision(node_type: &str) -> bool {
        node_type == CONDITION || node_type == SWITCH
    }
}

/// Well-known port names
pub mod ports {
    pub const IN: &str = "in";
    pub const OUT: &str = "out";
    pub const ERROR: &str = "error";
    pub const BODY: &str = "body";
    pub const DONE: &str = "done";
    pub const TRUE: &str = "true";
    pub const FALSE: &str = "false";
    pub const DEFAULT: &str = "default";
    pub const APPROVED: &str = "approved";
    pub const REJECTED: &str = "rejected";
}

/// Author-time workflow graph. Connections may reference missing nodes;
/// the validator reports them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub connections: Vec<Connection>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: NodeSpec) -> NodeId {
        let id = node.id.clone();
        self.nodes.push(node);
        id
    }

    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn connect(
        &mut self,
        source: impl Into<String>,
        source_port: impl Into<String>,
        target: impl Into<String>,
        target_port: impl Into<String>,
    ) {
        self.connections.push(Connection {
            source: source.into(),
            source_port: source_port.into(),
            target: target.into(),
            target_port: target_port.into(),
        });
    }

    /// Connect `source.out -> target.in`
    pub fn link(mut self, source: &str, target: &str) -> Self {
        self.connect(source, ports::OUT, target, ports::IN);
        self
    }

    /// Connect from a named source port into `target.in`
    pub fn link_port(mut self, source: &str, source_port: &str, target: &str) -> Self {
        self.connect(source, source_port, target, ports::IN);
        self
    }

    /// Builder form of [`Graph::connect`]
    pub fn connect_ports(mut self, source: &str, source_port: &str, target: &str, target_port: &str) -> Self {
        self.connect(source, source_port, target, target_port);
        self
    }

    pub fn find_node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Node specification in a graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    /// Display only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            name: None,
            config: BTreeMap::new(),
            position: None,
            retry_policy: None,
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_position(mut self, x: f32, y: f32) -> Self {
        self.position = Some(Position { x, y });
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, delay_ms: u64) -> Self {
        self.retry_policy = Some(RetryPolicy {
            max_attempts,
            delay_ms,
            backoff_multiplier: 1.0,
        });
        self
    }
}

fn default_in() -> String {
    ports::IN.to_string()
}

fn default_out() -> String {
    ports::OUT.to_string()
}

/// Directed connection between two node ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub source: NodeId,
    #[serde(default = "default_out")]
    pub source_port: String,
    pub target: NodeId,
    #[serde(default = "default_in")]
    pub target_port: String,
}

/// Node position in visual editor
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
}

/// Retry policy for node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub backoff_multiplier: f64,
}

fn default_backoff() -> f64 {
    1.0
}

impl RetryPolicy {
    /// Delay before the given (1-based) retry attempt
    pub fn delay_for(&self, attempt: u32) -> std::time::Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        std::time::Duration::from_millis((self.delay_ms as f64 * factor) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    Draft,
    Active,
    Archived,
}

/// A versioned workflow definition as held by the definition store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: DefinitionId,
    pub tenant_id: TenantId,
    pub name: String,
    pub version: u32,
    pub status: DefinitionStatus,
    pub max_concurrent: u32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub graph: Option<Graph>,
    /// Compiled at publish; absent for drafts
    #[serde(default)]
    pub plan: Option<crate::ExecutionPlan>,
    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    pub fn new(tenant_id: impl Into<String>, name: impl Into<String>, graph: Graph) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            name: name.into(),
            version: 1,
            status: DefinitionStatus::Draft,
            max_concurrent: 10,
            timeout_secs: None,
            variables: BTreeMap::new(),
            graph: Some(graph),
            plan: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_max_concurrent(mut self, max_concurrent: u32) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn activate(mut self) -> Self {
        self.status = DefinitionStatus::Active;
        self
    }
}
