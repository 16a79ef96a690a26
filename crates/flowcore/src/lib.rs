//! Core abstractions for the flow engine
//!
//! This crate provides the fundamental types and traits that all other
//! components depend on: the graph and plan data model, run and approval
//! records, the dynamic `Value`, the expression evaluator, the executor
//! contract and the event bus.

mod approval;
mod diagnostics;
mod error;
pub mod events;
pub mod expression;
mod graph;
mod node;
mod plan;
mod run;
mod value;

pub use approval::{
    ApprovalOutcome, ApprovalRequest, ApprovalSpec, ApprovalStatus, ApprovalStep, ChainMode,
    Decision, RequestId, StepStatus, TrailEntry,
};
pub use diagnostics::{Diagnostic, Severity, ValidationReport};
pub use error::{
    ApprovalError, ExpressionError, FlowError, NodeError, RunError, StoreError, WorkflowError,
};
pub use events::*;
pub use graph::{
    node_types, ports, Connection, DefinitionId, DefinitionStatus, Graph, NodeId, NodeSpec,
    Position, RetryPolicy, TenantId, WorkflowDefinition,
};
pub use node::{Node, NodeContext, NodeOutput};
pub use plan::{ExecutionPlan, ExecutionStep};
pub use run::{execution_key, NodeExecution, NodeExecutionStatus, RunId, RunStatus, WorkflowRun};
pub use value::Value;

/// Result type for flow operations
pub type Result<T> = std::result::Result<T, FlowError>;
