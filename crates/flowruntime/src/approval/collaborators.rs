use super::chain::NotificationKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowcore::{ApprovalError, RequestId, TenantId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Message handed to the notification collaborator
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub tenant_id: TenantId,
    pub request_id: RequestId,
    pub kind: NotificationKind,
    pub recipients: Vec<String>,
    pub title: String,
    pub step_id: Option<String>,
}

/// Delivers approval notifications. Failures are logged by the caller and
/// never fail the chain.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<(), String>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), String> {
        tracing::info!(
            request_id = %notification.request_id,
            kind = ?notification.kind,
            recipients = ?notification.recipients,
            "Approval notification: {}",
            notification.title
        );
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }

    /// Everyone notified so far, in order
    pub fn recipients(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .flat_map(|n| n.recipients)
            .collect()
    }

    pub fn was_notified(&self, user: &str) -> bool {
        self.recipients().iter().any(|r| r == user)
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: &Notification) -> Result<(), String> {
        self.sent
            .lock()
            .map_err(|_| "notification log poisoned".to_string())?
            .push(notification.clone());
        Ok(())
    }
}

/// One audit line per approval signal or resolution
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub at: DateTime<Utc>,
    pub tenant_id: TenantId,
    pub request_id: RequestId,
    pub actor: String,
    pub action: String,
    pub step_id: Option<String>,
    pub details: Option<String>,
}

/// Fire-and-forget audit consumer; `record` must return immediately
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Queues audit records on an unbounded channel drained by a background worker
#[derive(Clone)]
pub struct ChannelAuditSink {
    sender: mpsc::UnboundedSender<AuditRecord>,
}

impl ChannelAuditSink {
    /// Sink plus the receiving end for a custom consumer
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditRecord>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Sink whose records are written to the log by a spawned worker.
    /// Outside a tokio runtime the records are dropped.
    pub fn spawn_logger() -> Self {
        let (sink, mut receiver) = Self::new();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    while let Some(record) = receiver.recv().await {
                        tracing::info!(
                            target: "audit",
                            tenant_id = %record.tenant_id,
                            request_id = %record.request_id,
                            actor = %record.actor,
                            action = %record.action,
                            step_id = ?record.step_id,
                            details = ?record.details,
                            "approval audit"
                        );
                    }
                });
            }
            Err(_) => tracing::warn!("No tokio runtime; approval audit records will be dropped"),
        }
        sink
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, record: AuditRecord) {
        if self.sender.send(record).is_err() {
            tracing::debug!("Audit receiver gone; record dropped");
        }
    }
}

/// Resolves a named role to approver ids at gate start. An unknown role
/// resolves to nobody; the chain then refuses to open.
#[async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve(&self, tenant_id: &str, role: &str) -> Result<Vec<String>, ApprovalError>;
}

/// Fixed role table
#[derive(Default, Clone)]
pub struct StaticRoleResolver {
    roles: HashMap<String, Vec<String>>,
}

impl StaticRoleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role<I, S>(mut self, role: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles
            .insert(role.into(), members.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl RoleResolver for StaticRoleResolver {
    async fn resolve(&self, _tenant_id: &str, role: &str) -> Result<Vec<String>, ApprovalError> {
        Ok(self.roles.get(role).cloned().unwrap_or_default())
    }
}
