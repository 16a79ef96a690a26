use crate::{DefinitionId, NodeId, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Compiled, ordered and tagged form of a graph. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub definition_id: DefinitionId,
    pub version: u32,
    pub steps: Vec<ExecutionStep>,
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Connections retained for input mapping and edge liveness at run time
    #[serde(default)]
    pub connections: Vec<crate::Connection>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStep {
    pub node_id: NodeId,
    pub node_type: String,
    #[serde(default)]
    pub config: BTreeMap<String, Value>,
    #[serde(default)]
    pub dependencies: BTreeSet<NodeId>,
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub loop_parent: Option<NodeId>,
    /// `"<decision node id>:<port>"`
    #[serde(default)]
    pub branch_key: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<crate::RetryPolicy>,
}

impl ExecutionStep {
    /// Split the branch key into decision node id and port
    pub fn branch(&self) -> Option<(&str, &str)> {
        self.branch_key.as_deref().and_then(|key| key.rsplit_once(':'))
    }
}

impl ExecutionPlan {
    pub fn step(&self, node_id: &str) -> Option<&ExecutionStep> {
        self.steps.iter().find(|s| s.node_id == node_id)
    }

    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.node_id == node_id)
    }

    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.node_id.as_str()).collect()
    }

    /// Connections arriving at a node, in declaration order
    pub fn incoming<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a crate::Connection> {
        self.connections.iter().filter(move |c| c.target == node_id)
    }

    pub fn outgoing<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a crate::Connection> {
        self.connections.iter().filter(move |c| c.source == node_id)
    }
}
