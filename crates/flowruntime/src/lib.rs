//! Workflow execution runtime
//!
//! This crate turns graphs into execution plans and drives them: the node
//! registry, the structural validator, the plan compiler, the durable step
//! walker, the persistence seams and the approval chain process used by the
//! `approval_gate` node type.

pub mod approval;
mod compiler;
mod executor;
mod registry;
mod runtime;
pub mod store;
mod topology;
mod validator;

pub use approval::ApprovalService;
pub use compiler::{compile, compile_definition};
pub use executor::WorkflowExecutor;
pub use registry::{
    ConfigField, FieldKind, NodeFactory, NodeMetadata, NodeRegistry, PortDefinition, PortKind,
};
pub use runtime::{FlowRuntime, RuntimeConfig};
pub use store::{ApprovalStore, DefinitionStore, FileStore, MemoryStore, RunStore, Stores};
pub use topology::GraphTopology;
pub use validator::{rules, GraphValidator};
