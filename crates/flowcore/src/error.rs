use crate::{DefinitionId, NodeExecutionStatus, RunId, RunStatus, ValidationReport};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Run error: {0}")]
    Run(#[from] RunError),

    #[error("Approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Expression error in '{field}': {source}")]
    Expression {
        field: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,
}

/// Graph-level and compilation errors
#[derive(Error, Debug, Clone)]
pub enum WorkflowError {
    #[error("Invalid workflow: {0}")]
    Invalid(String),

    #[error("Graph validation failed: {0}")]
    Validation(ValidationReport),

    #[error("Graph has no nodes")]
    EmptyGraph,

    #[error("Cyclic dependency detected among nodes: {}", nodes.join(", "))]
    CyclicDependency { nodes: Vec<String> },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Unknown node type: {0}")]
    UnknownNodeType(String),

    #[error("Invalid connection: {0}")]
    InvalidConnection(String),
}

/// Start-time and run lifecycle errors
#[derive(Error, Debug, Clone)]
pub enum RunError {
    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(DefinitionId),

    #[error("Workflow definition {0} is not active")]
    DefinitionNotActive(DefinitionId),

    #[error("Workflow definition {0} has no graph")]
    NoGraph(DefinitionId),

    #[error("Concurrency limit of {limit} reached for definition {definition_id}")]
    ConcurrencyLimit {
        definition_id: DefinitionId,
        limit: u32,
    },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Cannot {action} run {run_id} in status {status}")]
    InvalidTransition {
        run_id: RunId,
        status: RunStatus,
        action: String,
    },

    #[error("Node execution '{node_id}' cannot move from {from} to {to}")]
    InvalidNodeTransition {
        node_id: String,
        from: NodeExecutionStatus,
        to: NodeExecutionStatus,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApprovalError {
    #[error("Approval chain resolved to an empty approver set")]
    NoApprovers,

    #[error("Quorum of {quorum} is not satisfiable with {approvers} approver(s)")]
    InvalidQuorum { quorum: u32, approvers: u32 },

    #[error("Approval request not found: {0}")]
    RequestNotFound(String),

    #[error("Unknown approval step: {0}")]
    UnknownStep(String),

    #[error("Approval step {0} is not awaiting a decision yet")]
    StepNotActive(String),

    #[error("Approval step {0} has already been decided")]
    StepAlreadyDecided(String),

    #[error("User {actor} is not the assignee of step {step_id}")]
    NotAssignee { step_id: String, actor: String },

    #[error("Approval request {0} is already resolved")]
    AlreadyResolved(String),

    #[error("Role resolution failed: {0}")]
    RoleResolution(String),

    #[error("Invalid approval configuration: {0}")]
    Configuration(String),
}

/// Lexing, parsing or evaluation failure with the byte offset it occurred at
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("Unexpected character '{ch}' at {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("Unterminated string starting at {pos}")]
    UnterminatedString { pos: usize },

    #[error("Unterminated interpolation starting at {pos}")]
    UnterminatedTemplate { pos: usize },

    #[error("Expected {expected} at {pos}, found {found}")]
    UnexpectedToken {
        expected: String,
        found: String,
        pos: usize,
    },

    #[error("Empty expression")]
    Empty,

    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Division by zero")]
    DivisionByZero,
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conflict: {0}")]
    Conflict(String),
}
