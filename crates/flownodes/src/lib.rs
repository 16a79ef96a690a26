//! Standard node library
//!
//! Built-in node types: control flow, loops, variables, timing, logging and
//! the approval gate.

mod approval;
mod control;
mod debug;
mod loops;
mod script;
mod time;

pub use approval::{ApprovalGateNode, ApprovalGateNodeFactory};
pub use control::{ConditionNode, EndNode, MergeNode, ParallelNode, StartNode, SwitchNode};
pub use debug::{LogNode, LOG};
pub use loops::{ForEachNode, WhileNode};
pub use script::ScriptNode;
pub use time::{DelayNode, DELAY};

use flowruntime::{ApprovalService, NodeRegistry};
use std::sync::Arc;

/// Register all standard nodes with a registry. Approval gates open their
/// chains through `approvals`.
pub fn register_all(registry: &mut NodeRegistry, approvals: Arc<ApprovalService>) {
    registry.register(Arc::new(control::StartNodeFactory));
    registry.register(Arc::new(control::EndNodeFactory));
    registry.register(Arc::new(control::ConditionNodeFactory));
    registry.register(Arc::new(control::SwitchNodeFactory));
    registry.register(Arc::new(control::ParallelNodeFactory));
    registry.register(Arc::new(control::MergeNodeFactory));
    registry.register(Arc::new(loops::ForEachNodeFactory));
    registry.register(Arc::new(loops::WhileNodeFactory));
    registry.register(Arc::new(script::ScriptNodeFactory));
    registry.register(Arc::new(time::DelayNodeFactory));
    registry.register(Arc::new(debug::LogNodeFactory));
    registry.register(Arc::new(ApprovalGateNodeFactory::new(approvals)));
}
