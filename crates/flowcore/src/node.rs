use crate::expression::{self, EvalScope};
use crate::{events::EventEmitter, NodeError, NodeId, RunId, TenantId, Value};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Executor contract every node type implements.
///
/// Executors must tolerate being invoked again for the same step: a step
/// whose result was not yet recorded when the process stopped is re-dispatched
/// on resume.
#[async_trait]
pub trait Node: Send + Sync {
    /// Unique type identifier (e.g., "condition", "approval_gate")
    fn node_type(&self) -> &str;

    /// Execute the node with given context
    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError>;
}

/// Execution context passed to each node
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub node_type: String,

    /// Loop iteration path; empty outside loop bodies
    pub iteration: Vec<u32>,

    /// Static configuration for this node
    pub config: BTreeMap<String, Value>,

    /// Input values from live incoming connections, keyed by target port
    pub inputs: BTreeMap<String, Value>,

    /// Accumulated variable bindings of the run
    pub variables: BTreeMap<String, Value>,

    /// Output data of nodes completed so far, keyed by node id
    pub node_outputs: BTreeMap<NodeId, Value>,

    /// Loop-scoped bindings (`item`, `index`, `loop`)
    pub locals: BTreeMap<String, Value>,

    pub run_input: Value,
    pub tenant_id: TenantId,
    pub run_id: RunId,
    pub is_test: bool,
    pub mock_response: Option<Value>,

    /// Wall-clock deadline the executor should respect
    pub deadline: Option<DateTime<Utc>>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancelled when the owning run is cancelled
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl NodeContext {
    /// Execution key of this invocation (`node` or `node@0.1`)
    pub fn execution_key(&self) -> String {
        crate::execution_key(&self.node_id, &self.iteration)
    }

    /// Get config value or return error
    pub fn require_config(&self, name: &str) -> Result<&Value, NodeError> {
        self.config
            .get(name)
            .ok_or_else(|| NodeError::Configuration(format!("Missing config: {}", name)))
    }

    pub fn scope(&self) -> EvalScope<'_> {
        EvalScope::new(&self.variables, &self.node_outputs, &self.run_input).with_locals(&self.locals)
    }

    /// Config value with `${...}` interpolated against the current scope
    pub fn resolve_config(&self, name: &str) -> Result<Option<Value>, NodeError> {
        let Some(raw) = self.config.get(name) else {
            return Ok(None);
        };
        expression::interpolate(raw, &self.scope())
            .map(Some)
            .map_err(|source| NodeError::Expression {
                field: name.to_string(),
                source,
            })
    }

    /// Evaluate an expression-bearing config field (bare or `${}` form)
    pub fn evaluate_config(&self, name: &str) -> Result<Value, NodeError> {
        let raw = self.require_config(name)?;
        match raw {
            Value::String(src) => {
                expression::evaluate(src, &self.scope()).map_err(|source| NodeError::Expression {
                    field: name.to_string(),
                    source,
                })
            }
            other => Ok(other.clone()),
        }
    }

    /// Mock payload to return instead of side effects during test runs
    pub fn test_mock(&self) -> Option<&Value> {
        if self.is_test {
            self.mock_response.as_ref()
        } else {
            None
        }
    }
}

/// Result of one executor invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeOutput {
    pub data: Value,

    /// Single output port to continue down
    #[serde(default)]
    pub next_port: Option<String>,

    /// Several output ports to continue down (fan-out)
    #[serde(default)]
    pub next_ports: Vec<String>,

    /// Soft failure; routed to the node's error port when one is connected
    #[serde(default)]
    pub error: Option<String>,

    /// Variable bindings to merge into the run
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
}

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = data.into();
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.next_port = Some(port.into());
        self
    }

    pub fn with_ports<I, S>(mut self, ports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.next_ports = ports.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    /// Ports explicitly selected by the executor, if any
    pub fn selected_ports(&self) -> Option<Vec<String>> {
        if !self.next_ports.is_empty() {
            Some(self.next_ports.clone())
        } else {
            self.next_port.clone().map(|p| vec![p])
        }
    }
}
