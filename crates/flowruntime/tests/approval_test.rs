use flowcore::{
    ApprovalError, ApprovalRequest, ApprovalSpec, ApprovalStatus, ChainMode, Decision, FlowError,
    StepStatus,
};
use flowruntime::approval::{
    ChannelAuditSink, NotificationKind, RecordingNotifier, StaticRoleResolver,
};
use flowruntime::{ApprovalService, MemoryStore};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const TENANT: &str = "acme";

struct Fixture {
    service: Arc<ApprovalService>,
    notifier: Arc<RecordingNotifier>,
}

fn fixture() -> Fixture {
    let notifier = Arc::new(RecordingNotifier::new());
    let service = ApprovalService::new(Arc::new(MemoryStore::new())).with_notifier(notifier.clone());
    Fixture {
        service: Arc::new(service),
        notifier,
    }
}

fn spec(mode: ChainMode, approvers: &[&str]) -> ApprovalSpec {
    ApprovalSpec::new("Release 4.2", mode).with_approvers(approvers.iter().copied())
}

fn approval_err(err: FlowError) -> ApprovalError {
    match err {
        FlowError::Approval(e) => e,
        other => panic!("expected an approval error, got {}", other),
    }
}

async fn approve(service: &ApprovalService, request: &ApprovalRequest, step: &str, actor: &str) -> ApprovalRequest {
    service
        .submit_decision(request.id, step, actor, Decision::Approve, None)
        .await
        .unwrap()
}

async fn reject(service: &ApprovalService, request: &ApprovalRequest, step: &str, actor: &str) -> ApprovalRequest {
    service
        .submit_decision(request.id, step, actor, Decision::Reject, Some("not ready".to_string()))
        .await
        .unwrap()
}

#[tokio::test]
async fn quorum_approves_as_soon_as_enough_say_yes() {
    let f = fixture();
    let request = f
        .service
        .open(
            TENANT,
            &spec(ChainMode::Quorum, &["u1", "u2", "u3", "u4", "u5"]).with_quorum(3),
            None,
        )
        .await
        .unwrap();
    assert_eq!(request.required_approvals, 3);
    assert_eq!(f.notifier.recipients(), vec!["u1", "u2", "u3", "u4", "u5"]);

    approve(&f.service, &request, "s1", "u1").await;
    approve(&f.service, &request, "s2", "u2").await;
    let resolved = approve(&f.service, &request, "s4", "u4").await;

    assert_eq!(resolved.status, ApprovalStatus::Approved);
    assert_eq!(resolved.step("s3").unwrap().status, StepStatus::Skipped);
    assert_eq!(resolved.step("s5").unwrap().status, StepStatus::Skipped);

    let err = f
        .service
        .submit_decision(request.id, "s5", "u5", Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(approval_err(err), ApprovalError::AlreadyResolved(_)));
}

#[tokio::test]
async fn quorum_rejects_once_approval_is_out_of_reach() {
    let f = fixture();
    let request = f
        .service
        .open(
            TENANT,
            &spec(ChainMode::Quorum, &["u1", "u2", "u3", "u4", "u5"]).with_quorum(3),
            None,
        )
        .await
        .unwrap();

    approve(&f.service, &request, "s1", "u1").await;
    let still_open = reject(&f.service, &request, "s2", "u2").await;
    assert_eq!(still_open.status, ApprovalStatus::Pending);
    let still_open = reject(&f.service, &request, "s3", "u3").await;
    assert_eq!(still_open.status, ApprovalStatus::Pending);

    // 1 approval + 1 remaining can no longer reach 3
    let resolved = reject(&f.service, &request, "s4", "u4").await;
    assert_eq!(resolved.status, ApprovalStatus::Rejected);
    assert_eq!(resolved.step("s5").unwrap().status, StepStatus::Skipped);
}

#[tokio::test]
async fn delegated_step_still_counts_toward_quorum() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Quorum, &["u1", "u2", "u3"]).with_quorum(2), None)
        .await
        .unwrap();

    reject(&f.service, &request, "s1", "u1").await;
    f.service.delegate(request.id, "s2", "u2", "u7").await.unwrap();
    let pending = f.service.get(request.id).await.unwrap();
    assert_eq!(pending.status, ApprovalStatus::Pending);
    assert_eq!(pending.remaining(), 2);

    approve(&f.service, &request, "s2", "u7").await;
    let resolved = approve(&f.service, &request, "s3", "u3").await;
    assert_eq!(resolved.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn parallel_rejects_on_first_no() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Parallel, &["u1", "u2", "u3"]), None)
        .await
        .unwrap();

    let resolved = reject(&f.service, &request, "s2", "u2").await;
    assert_eq!(resolved.status, ApprovalStatus::Rejected);
    assert!(resolved
        .steps
        .iter()
        .filter(|s| s.id != "s2")
        .all(|s| s.status == StepStatus::Skipped));
    assert_eq!(resolved.step("s2").unwrap().reason.as_deref(), Some("not ready"));
}

#[tokio::test]
async fn parallel_approves_when_everyone_does() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Parallel, &["u1", "u2"]), None)
        .await
        .unwrap();

    let partial = approve(&f.service, &request, "s2", "u2").await;
    assert_eq!(partial.status, ApprovalStatus::Pending);
    let resolved = approve(&f.service, &request, "s1", "u1").await;
    assert_eq!(resolved.status, ApprovalStatus::Approved);
    assert!(resolved.resolved_at.is_some());
}

#[tokio::test]
async fn simultaneous_decisions_are_all_kept() {
    let f = fixture();
    let approvers = ["u1", "u2", "u3", "u4"];
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Parallel, &approvers), None)
        .await
        .unwrap();
    let request_id = request.id;

    let decisions = approvers.iter().enumerate().map(|(i, actor)| {
        let service = f.service.clone();
        let step = format!("s{}", i + 1);
        let actor = actor.to_string();
        tokio::spawn(async move {
            service
                .submit_decision(request_id, &step, &actor, Decision::Approve, None)
                .await
        })
    });
    for result in futures::future::join_all(decisions).await {
        result.unwrap().unwrap();
    }

    let stored = f.service.get(request.id).await.unwrap();
    assert_eq!(stored.status, ApprovalStatus::Approved);
    assert!(stored.steps.iter().all(|s| s.status == StepStatus::Approved));
}

#[tokio::test]
async fn sequential_rejection_short_circuits_the_rest() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Sequential, &["u1", "u2", "u3"]), None)
        .await
        .unwrap();
    assert_eq!(f.notifier.recipients(), vec!["u1"]);

    let err = f
        .service
        .submit_decision(request.id, "s2", "u2", Decision::Approve, None)
        .await
        .unwrap_err();
    assert_eq!(approval_err(err), ApprovalError::StepNotActive("s2".to_string()));

    approve(&f.service, &request, "s1", "u1").await;
    assert!(f.notifier.was_notified("u2"));
    let resolved = reject(&f.service, &request, "s2", "u2").await;

    assert_eq!(resolved.status, ApprovalStatus::Rejected);
    assert_eq!(resolved.step("s3").unwrap().status, StepStatus::Skipped);
    assert!(!f.notifier.was_notified("u3"));
}

#[tokio::test]
async fn delegation_hands_the_step_to_someone_else() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Sequential, &["u1", "u2"]), None)
        .await
        .unwrap();

    let delegated = f.service.delegate(request.id, "s1", "u1", "u9").await.unwrap();
    let step = delegated.step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Delegated);
    assert_eq!(step.delegate_to.as_deref(), Some("u9"));
    assert!(f
        .notifier
        .sent()
        .iter()
        .any(|n| n.kind == NotificationKind::Delegated && n.recipients == vec!["u9"]));

    let err = f
        .service
        .submit_decision(request.id, "s1", "u1", Decision::Approve, None)
        .await
        .unwrap_err();
    assert_eq!(
        approval_err(err),
        ApprovalError::NotAssignee {
            step_id: "s1".to_string(),
            actor: "u1".to_string(),
        }
    );

    let decided = approve(&f.service, &request, "s1", "u9").await;
    let step = decided.step("s1").unwrap();
    assert_eq!(step.status, StepStatus::Approved);
    assert_eq!(step.decided_by.as_deref(), Some("u9"));

    let actions: Vec<&str> = decided
        .trail
        .iter()
        .filter(|t| t.step_id.as_deref() == Some("s1"))
        .map(|t| t.action.as_str())
        .collect();
    assert_eq!(actions, vec!["delegated", "approved"]);
}

#[tokio::test]
async fn open_rejects_bad_chains() {
    let f = fixture();

    let err = f
        .service
        .open(TENANT, &spec(ChainMode::Quorum, &["u1", "u2"]).with_quorum(3), None)
        .await
        .unwrap_err();
    assert_eq!(
        approval_err(err),
        ApprovalError::InvalidQuorum {
            quorum: 3,
            approvers: 2,
        }
    );

    let err = f
        .service
        .open(TENANT, &spec(ChainMode::Parallel, &[]), None)
        .await
        .unwrap_err();
    assert_eq!(approval_err(err), ApprovalError::NoApprovers);
    assert!(f.service.list(TENANT).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_step_and_unknown_request() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Parallel, &["u1"]), None)
        .await
        .unwrap();

    let err = f
        .service
        .submit_decision(request.id, "s9", "u1", Decision::Approve, None)
        .await
        .unwrap_err();
    assert_eq!(approval_err(err), ApprovalError::UnknownStep("s9".to_string()));

    let err = f.service.get(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(approval_err(err), ApprovalError::RequestNotFound(_)));
}

#[tokio::test]
async fn role_members_are_appended_after_explicit_approvers() {
    let roles = StaticRoleResolver::new().with_role("finance", ["f1", "u1", "f2"]);
    let service = ApprovalService::new(Arc::new(MemoryStore::new())).with_roles(Arc::new(roles));

    let request = service
        .open(
            TENANT,
            &spec(ChainMode::Parallel, &["u1"]).with_roles(["finance"]),
            None,
        )
        .await
        .unwrap();

    let approvers: Vec<&str> = request.steps.iter().map(|s| s.approver_id.as_str()).collect();
    assert_eq!(approvers, vec!["u1", "f1", "f2"]);
}

#[tokio::test]
async fn waiter_sees_decision_made_elsewhere() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Sequential, &["u1"]), None)
        .await
        .unwrap();

    let service = f.service.clone();
    let id = request.id;
    let waiter = tokio::spawn(async move {
        service.wait_for_outcome(id, &CancellationToken::new()).await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    approve(&f.service, &request, "s1", "u1").await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert!(outcome.approved);
    assert_eq!(outcome.status, ApprovalStatus::Approved);
}

#[tokio::test]
async fn deadline_expires_the_chain_and_escalates() {
    let f = fixture();
    let request = f
        .service
        .open(
            TENANT,
            &spec(ChainMode::Parallel, &["u1", "u2"])
                .with_timeout(1)
                .with_escalation(["boss"]),
            None,
        )
        .await
        .unwrap();
    assert!(request.deadline.is_some());

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        f.service.wait_for_outcome(request.id, &CancellationToken::new()),
    )
    .await
    .unwrap()
    .unwrap();

    assert!(!outcome.approved);
    assert_eq!(outcome.status, ApprovalStatus::Expired);
    assert!(outcome.steps.iter().all(|s| s.status == StepStatus::Expired));
    assert!(f
        .notifier
        .sent()
        .iter()
        .any(|n| n.kind == NotificationKind::Escalation && n.recipients == vec!["boss"]));
}

#[tokio::test]
async fn cancelled_wait_cancels_the_chain() {
    let f = fixture();
    let request = f
        .service
        .open(TENANT, &spec(ChainMode::Parallel, &["u1"]), None)
        .await
        .unwrap();

    let token = CancellationToken::new();
    let service = f.service.clone();
    let id = request.id;
    let wait_token = token.clone();
    let waiter = tokio::spawn(async move { service.wait_for_outcome(id, &wait_token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    token.cancel();

    let outcome = waiter.await.unwrap().unwrap();
    assert_eq!(outcome.status, ApprovalStatus::Cancelled);

    let err = f
        .service
        .submit_decision(request.id, "s1", "u1", Decision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(approval_err(err), ApprovalError::AlreadyResolved(_)));
}

#[tokio::test]
async fn reopening_for_the_same_node_returns_the_existing_chain() {
    let f = fixture();
    let run_id = Uuid::new_v4();
    let chain = spec(ChainMode::Sequential, &["u1", "u2"]);

    let first = f
        .service
        .open_for_node(TENANT, run_id, "gate", &chain)
        .await
        .unwrap();
    let second = f
        .service
        .open_for_node(TENANT, run_id, "gate", &chain)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.run_id, Some(run_id));
    assert_eq!(first.node_key.as_deref(), Some("gate"));

    let other = f
        .service
        .open_for_node(TENANT, run_id, "gate@1", &chain)
        .await
        .unwrap();
    assert_ne!(other.id, first.id);
    assert_eq!(f.service.list(TENANT).await.unwrap().len(), 2);
    // the repeated open for "gate" notified nobody
    assert_eq!(f.notifier.recipients(), vec!["u1", "u1"]);
}

#[tokio::test]
async fn every_signal_reaches_the_audit_sink() {
    let (sink, mut audit) = ChannelAuditSink::new();
    let service = ApprovalService::new(Arc::new(MemoryStore::new())).with_audit(Arc::new(sink));

    let request = service
        .open(TENANT, &spec(ChainMode::Sequential, &["u1"]), None)
        .await
        .unwrap();
    service
        .submit_decision(request.id, "s1", "u1", Decision::Approve, None)
        .await
        .unwrap();

    let mut actions = Vec::new();
    while let Ok(record) = audit.try_recv() {
        assert_eq!(record.request_id, request.id);
        actions.push(record.action);
    }
    assert_eq!(actions, vec!["requested", "approved", "resolved"]);
}
