use super::chain::{self, ChainEffect, NotificationKind, SYSTEM_ACTOR};
use super::collaborators::{
    AuditRecord, AuditSink, ChannelAuditSink, LogNotifier, Notification, Notifier, RoleResolver,
    StaticRoleResolver,
};
use crate::store::ApprovalStore;
use chrono::{DateTime, Utc};
use flowcore::{
    ApprovalError, ApprovalOutcome, ApprovalRequest, ApprovalSpec, Decision, EventBus,
    ExecutionEvent, FlowError, RequestId, RunId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Durable approval chains: persisted requests, external signals, and a
/// wait that survives restarts because the deadline is stored on the request.
pub struct ApprovalService {
    store: Arc<dyn ApprovalStore>,
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditSink>,
    roles: Arc<dyn RoleResolver>,
    events: Option<Arc<EventBus>>,
    notification_timeout: Duration,
    /// Serializes load-apply-save of requests
    lock: Mutex<()>,
    waiters: std::sync::Mutex<HashMap<RequestId, Arc<Notify>>>,
}

impl ApprovalService {
    pub fn new(store: Arc<dyn ApprovalStore>) -> Self {
        Self {
            store,
            notifier: Arc::new(LogNotifier),
            audit: Arc::new(ChannelAuditSink::spawn_logger()),
            roles: Arc::new(StaticRoleResolver::new()),
            events: None,
            notification_timeout: Duration::from_millis(5000),
            lock: Mutex::new(()),
            waiters: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_roles(mut self, roles: Arc<dyn RoleResolver>) -> Self {
        self.roles = roles;
        self
    }

    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_notification_timeout(mut self, timeout: Duration) -> Self {
        self.notification_timeout = timeout;
        self
    }

    /// Open a chain. Explicit approvers come first, then role members in
    /// role order.
    pub async fn open(
        &self,
        tenant_id: &str,
        spec: &ApprovalSpec,
        origin: Option<(RunId, String)>,
    ) -> Result<ApprovalRequest, FlowError> {
        let mut approvers = spec.approvers.clone();
        for role in &spec.roles {
            approvers.extend(self.roles.resolve(tenant_id, role).await?);
        }

        let (mut request, effects) =
            chain::open(Uuid::new_v4(), tenant_id, spec, approvers, Utc::now())?;
        if let Some((run_id, node_key)) = origin {
            request.run_id = Some(run_id);
            request.node_key = Some(node_key);
        }
        self.store.save_request(&request).await?;

        tracing::info!(
            request_id = %request.id,
            tenant_id = %tenant_id,
            mode = ?request.mode,
            approvers = request.steps.len(),
            "Approval chain opened"
        );
        if let Some(events) = &self.events {
            events.emit(ExecutionEvent::ApprovalRequested {
                request_id: request.id,
                run_id: request.run_id,
                approvers: request.steps.iter().map(|s| s.approver_id.clone()).collect(),
                timestamp: Utc::now(),
            });
        }
        self.publish(&request, 0, effects).await;
        Ok(request)
    }

    /// The request a node execution already opened, or a fresh one. Lets a
    /// re-dispatched gate pick up its chain after a restart.
    pub async fn open_for_node(
        &self,
        tenant_id: &str,
        run_id: RunId,
        node_key: &str,
        spec: &ApprovalSpec,
    ) -> Result<ApprovalRequest, FlowError> {
        if let Some(existing) = self.store.find_request(run_id, node_key).await? {
            tracing::info!(request_id = %existing.id, node_key, "Resuming approval chain");
            return Ok(existing);
        }
        self.open(tenant_id, spec, Some((run_id, node_key.to_string()))).await
    }

    pub async fn get(&self, request_id: RequestId) -> Result<ApprovalRequest, FlowError> {
        self.store
            .load_request(request_id)
            .await?
            .ok_or_else(|| ApprovalError::RequestNotFound(request_id.to_string()).into())
    }

    pub async fn list(&self, tenant_id: &str) -> Result<Vec<ApprovalRequest>, FlowError> {
        Ok(self.store.list_requests(tenant_id).await?)
    }

    pub async fn submit_decision(
        &self,
        request_id: RequestId,
        step_id: &str,
        actor: &str,
        decision: Decision,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, FlowError> {
        self.apply(request_id, |request, now| {
            chain::decide(request, step_id, actor, decision, reason, now)
        })
        .await
    }

    pub async fn delegate(
        &self,
        request_id: RequestId,
        step_id: &str,
        actor: &str,
        delegate_to: &str,
    ) -> Result<ApprovalRequest, FlowError> {
        self.apply(request_id, |request, now| {
            chain::delegate(request, step_id, actor, delegate_to, now)
        })
        .await
    }

    pub async fn cancel(
        &self,
        request_id: RequestId,
        actor: &str,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, FlowError> {
        self.apply(request_id, |request, now| chain::cancel(request, actor, reason, now))
            .await
    }

    /// Resolve as EXPIRED; called when the stored deadline passes
    pub async fn expire(&self, request_id: RequestId) -> Result<ApprovalRequest, FlowError> {
        self.apply(request_id, chain::expire).await
    }

    /// Block until the request is terminal. Expires it when its deadline
    /// passes and cancels it when `cancellation` fires.
    pub async fn wait_for_outcome(
        &self,
        request_id: RequestId,
        cancellation: &CancellationToken,
    ) -> Result<ApprovalOutcome, FlowError> {
        let notify = self.waiter(request_id);
        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let request = self.get(request_id).await?;
            if request.status.is_terminal() {
                self.drop_waiter(request_id);
                return Ok(request.outcome());
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = cancellation.cancelled() => {
                    settle(self.cancel(request_id, SYSTEM_ACTOR, Some("run cancelled".to_string())).await)?;
                }
                _ = sleep_until(request.deadline) => {
                    settle(self.expire(request_id).await)?;
                }
            }
        }
    }

    async fn apply<F>(&self, request_id: RequestId, op: F) -> Result<ApprovalRequest, FlowError>
    where
        F: FnOnce(&mut ApprovalRequest, DateTime<Utc>) -> Result<Vec<ChainEffect>, ApprovalError> + Send,
    {
        let (request, trail_from, effects) = {
            let _guard = self.lock.lock().await;
            let mut request = self.get(request_id).await?;
            let trail_from = request.trail.len();
            let effects = op(&mut request, Utc::now()).map_err(|e| {
                tracing::debug!(request_id = %request_id, error = %e, "Approval signal rejected");
                e
            })?;
            self.store.save_request(&request).await?;
            (request, trail_from, effects)
        };
        self.publish(&request, trail_from, effects).await;
        Ok(request)
    }

    /// Forward new trail entries to the audit sink, deliver notifications,
    /// and wake waiters on resolution.
    async fn publish(&self, request: &ApprovalRequest, trail_from: usize, effects: Vec<ChainEffect>) {
        for entry in request.trail.iter().skip(trail_from) {
            self.audit.record(AuditRecord {
                at: entry.at,
                tenant_id: request.tenant_id.clone(),
                request_id: request.id,
                actor: entry.actor.clone(),
                action: entry.action.clone(),
                step_id: entry.step_id.clone(),
                details: entry.details.clone(),
            });
        }

        for effect in effects {
            match effect {
                ChainEffect::Notify {
                    kind,
                    recipients,
                    step_id,
                } => self.notify(request, kind, recipients, step_id).await,
                ChainEffect::Resolved(status) => {
                    tracing::info!(request_id = %request.id, status = ?status, "Approval chain resolved");
                    if let Some(events) = &self.events {
                        events.emit(ExecutionEvent::ApprovalResolved {
                            request_id: request.id,
                            run_id: request.run_id,
                            status,
                            timestamp: Utc::now(),
                        });
                    }
                    if let Some(notify) = self.existing_waiter(request.id) {
                        notify.notify_waiters();
                    }
                }
            }
        }
    }

    async fn notify(
        &self,
        request: &ApprovalRequest,
        kind: NotificationKind,
        recipients: Vec<String>,
        step_id: Option<String>,
    ) {
        let notification = Notification {
            tenant_id: request.tenant_id.clone(),
            request_id: request.id,
            kind,
            recipients,
            title: request.title.clone(),
            step_id,
        };
        match tokio::time::timeout(self.notification_timeout, self.notifier.notify(&notification)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(request_id = %request.id, error = %e, "Notification failed"),
            Err(_) => tracing::warn!(request_id = %request.id, "Notification timed out"),
        }
    }

    fn waiter(&self, request_id: RequestId) -> Arc<Notify> {
        match self.waiters.lock() {
            Ok(mut waiters) => waiters.entry(request_id).or_default().clone(),
            Err(_) => Arc::new(Notify::new()),
        }
    }

    fn existing_waiter(&self, request_id: RequestId) -> Option<Arc<Notify>> {
        self.waiters
            .lock()
            .ok()
            .and_then(|waiters| waiters.get(&request_id).cloned())
    }

    fn drop_waiter(&self, request_id: RequestId) {
        if let Ok(mut waiters) = self.waiters.lock() {
            waiters.remove(&request_id);
        }
    }
}

/// A signal racing another resolution is not an error for the waiter
fn settle(result: Result<ApprovalRequest, FlowError>) -> Result<(), FlowError> {
    match result {
        Ok(_) | Err(FlowError::Approval(ApprovalError::AlreadyResolved(_))) => Ok(()),
        Err(e) => Err(e),
    }
}

async fn sleep_until(deadline: Option<DateTime<Utc>>) {
    match deadline {
        Some(deadline) => {
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await
        }
        None => std::future::pending().await,
    }
}
