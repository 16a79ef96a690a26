//! Approval chain process run by the `approval_gate` node type.
//!
//! `chain` holds the pure state machine over an [`ApprovalRequest`];
//! `service` persists requests, applies external signals and lets a gate
//! wait for the terminal outcome; `collaborators` are the outbound seams
//! (notification, audit, role resolution).
//!
//! [`ApprovalRequest`]: flowcore::ApprovalRequest

pub mod chain;
mod collaborators;
mod service;

pub use chain::{ChainEffect, NotificationKind};
pub use collaborators::{
    AuditRecord, AuditSink, ChannelAuditSink, LogNotifier, Notification, Notifier,
    RecordingNotifier, RoleResolver, StaticRoleResolver,
};
pub use service::ApprovalService;
