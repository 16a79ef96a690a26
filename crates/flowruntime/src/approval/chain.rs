//! Sequential, parallel and quorum approval semantics as pure transitions.
//!
//! Every operation validates first and only then mutates, so a rejected
//! signal leaves the request untouched. Operations return the side effects
//! the caller must carry out (notifications, resolution).

use chrono::{DateTime, Duration, Utc};
use flowcore::{
    ApprovalError, ApprovalRequest, ApprovalSpec, ApprovalStatus, ApprovalStep, ChainMode,
    Decision, RequestId, StepStatus, TrailEntry,
};
use serde::Serialize;

pub const SYSTEM_ACTOR: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ApprovalRequired,
    Delegated,
    Escalation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChainEffect {
    Notify {
        kind: NotificationKind,
        recipients: Vec<String>,
        step_id: Option<String>,
    },
    Resolved(ApprovalStatus),
}

/// Build a new pending request over an already resolved approver list.
/// Duplicate approvers collapse to their first occurrence.
pub fn open(
    id: RequestId,
    tenant_id: &str,
    spec: &ApprovalSpec,
    approvers: Vec<String>,
    now: DateTime<Utc>,
) -> Result<(ApprovalRequest, Vec<ChainEffect>), ApprovalError> {
    let mut unique: Vec<String> = Vec::new();
    for approver in approvers {
        let approver = approver.trim().to_string();
        if !approver.is_empty() && !unique.contains(&approver) {
            unique.push(approver);
        }
    }
    if unique.is_empty() {
        return Err(ApprovalError::NoApprovers);
    }

    let total = unique.len() as u32;
    let required_approvals = match spec.mode {
        ChainMode::Quorum => {
            let quorum = spec.quorum_required.ok_or_else(|| {
                ApprovalError::Configuration("quorum mode requires quorum_required".to_string())
            })?;
            if quorum == 0 || quorum > total {
                return Err(ApprovalError::InvalidQuorum {
                    quorum,
                    approvers: total,
                });
            }
            quorum
        }
        ChainMode::Sequential | ChainMode::Parallel => total,
    };

    let steps = unique
        .into_iter()
        .enumerate()
        .map(|(i, approver)| ApprovalStep::new(format!("s{}", i + 1), approver))
        .collect();

    let mut request = ApprovalRequest {
        id,
        tenant_id: tenant_id.to_string(),
        run_id: None,
        node_key: None,
        title: spec.title.clone(),
        description: spec.description.clone(),
        mode: spec.mode,
        required_approvals,
        status: ApprovalStatus::Pending,
        steps,
        escalation: spec.escalation.clone(),
        deadline: spec
            .timeout_secs
            .map(|secs| now + Duration::seconds(secs as i64)),
        trail: Vec::new(),
        created_at: now,
        resolved_at: None,
    };
    request.trail.push(TrailEntry {
        at: now,
        actor: SYSTEM_ACTOR.to_string(),
        action: "requested".to_string(),
        step_id: None,
        details: Some(format!(
            "{:?} chain over {} approver(s), {} required",
            request.mode, total, required_approvals
        )),
    });

    let effects = activate(&mut request);
    Ok((request, effects))
}

pub fn decide(
    request: &mut ApprovalRequest,
    step_id: &str,
    actor: &str,
    decision: Decision,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<ChainEffect>, ApprovalError> {
    let idx = open_step(request, step_id)?;
    if request.steps[idx].assignee() != actor {
        return Err(ApprovalError::NotAssignee {
            step_id: step_id.to_string(),
            actor: actor.to_string(),
        });
    }

    let step = &mut request.steps[idx];
    step.status = match decision {
        Decision::Approve => StepStatus::Approved,
        Decision::Reject => StepStatus::Rejected,
    };
    step.decided_by = Some(actor.to_string());
    step.decided_at = Some(now);
    step.reason = reason.clone();

    request.trail.push(TrailEntry {
        at: now,
        actor: actor.to_string(),
        action: match decision {
            Decision::Approve => "approved",
            Decision::Reject => "rejected",
        }
        .to_string(),
        step_id: Some(step_id.to_string()),
        details: reason,
    });

    match evaluate(request) {
        Some(status) => Ok(resolve(request, status, StepStatus::Skipped, now)),
        None => Ok(activate(request)),
    }
}

/// Reassign an undecided step. The step keeps its identity; only the
/// current assignee may hand it on.
pub fn delegate(
    request: &mut ApprovalRequest,
    step_id: &str,
    actor: &str,
    delegate_to: &str,
    now: DateTime<Utc>,
) -> Result<Vec<ChainEffect>, ApprovalError> {
    let delegate_to = delegate_to.trim();
    ensure_pending(request)?;
    let idx = step_index(request, step_id)?;
    if !request.steps[idx].status.is_undecided() {
        return Err(ApprovalError::StepAlreadyDecided(step_id.to_string()));
    }
    if request.steps[idx].assignee() != actor {
        return Err(ApprovalError::NotAssignee {
            step_id: step_id.to_string(),
            actor: actor.to_string(),
        });
    }
    if delegate_to.is_empty() || delegate_to == actor {
        return Err(ApprovalError::Configuration(format!(
            "cannot delegate step {} to '{}'",
            step_id, delegate_to
        )));
    }

    let active = is_active(request, idx);
    let step = &mut request.steps[idx];
    step.delegate_to = Some(delegate_to.to_string());
    step.status = StepStatus::Delegated;
    step.notified = active;

    request.trail.push(TrailEntry {
        at: now,
        actor: actor.to_string(),
        action: "delegated".to_string(),
        step_id: Some(step_id.to_string()),
        details: Some(format!("to {}", delegate_to)),
    });

    if active {
        Ok(vec![ChainEffect::Notify {
            kind: NotificationKind::Delegated,
            recipients: vec![delegate_to.to_string()],
            step_id: Some(step_id.to_string()),
        }])
    } else {
        Ok(Vec::new())
    }
}

/// Ends the chain regardless of mode
pub fn cancel(
    request: &mut ApprovalRequest,
    actor: &str,
    reason: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<ChainEffect>, ApprovalError> {
    ensure_pending(request)?;
    request.trail.push(TrailEntry {
        at: now,
        actor: actor.to_string(),
        action: "cancelled".to_string(),
        step_id: None,
        details: reason,
    });
    Ok(resolve(request, ApprovalStatus::Cancelled, StepStatus::Skipped, now))
}

/// Deadline elapsed without resolution
pub fn expire(request: &mut ApprovalRequest, now: DateTime<Utc>) -> Result<Vec<ChainEffect>, ApprovalError> {
    ensure_pending(request)?;
    request.trail.push(TrailEntry {
        at: now,
        actor: SYSTEM_ACTOR.to_string(),
        action: "expired".to_string(),
        step_id: None,
        details: request.deadline.map(|d| format!("deadline {}", d.to_rfc3339())),
    });
    let mut effects = resolve(request, ApprovalStatus::Expired, StepStatus::Expired, now);
    if !request.escalation.is_empty() {
        effects.push(ChainEffect::Notify {
            kind: NotificationKind::Escalation,
            recipients: request.escalation.clone(),
            step_id: None,
        });
    }
    Ok(effects)
}

/// Terminal status implied by the current step tallies, if any
pub fn evaluate(request: &ApprovalRequest) -> Option<ApprovalStatus> {
    let approvals = request.approvals();
    let rejections = request.rejections();
    let remaining = request.remaining();
    let required = request.required_approvals;

    match request.mode {
        ChainMode::Sequential | ChainMode::Parallel => {
            if rejections > 0 {
                Some(ApprovalStatus::Rejected)
            } else if approvals >= required {
                Some(ApprovalStatus::Approved)
            } else {
                None
            }
        }
        ChainMode::Quorum => {
            if approvals >= required {
                Some(ApprovalStatus::Approved)
            } else if approvals + remaining < required {
                Some(ApprovalStatus::Rejected)
            } else {
                None
            }
        }
    }
}

fn resolve(
    request: &mut ApprovalRequest,
    status: ApprovalStatus,
    undecided_to: StepStatus,
    now: DateTime<Utc>,
) -> Vec<ChainEffect> {
    for step in request.steps.iter_mut().filter(|s| s.status.is_undecided()) {
        step.status = undecided_to;
    }
    request.status = status;
    request.resolved_at = Some(now);
    request.trail.push(TrailEntry {
        at: now,
        actor: SYSTEM_ACTOR.to_string(),
        action: "resolved".to_string(),
        step_id: None,
        details: Some(format!("{:?}", status).to_uppercase()),
    });
    vec![ChainEffect::Resolved(status)]
}

/// Notify whoever is due and not yet told: the first undecided step in
/// sequential mode, every undecided step otherwise.
fn activate(request: &mut ApprovalRequest) -> Vec<ChainEffect> {
    let due: Vec<usize> = match request.mode {
        ChainMode::Sequential => request
            .steps
            .iter()
            .position(|s| s.status.is_undecided())
            .into_iter()
            .collect(),
        ChainMode::Parallel | ChainMode::Quorum => request
            .steps
            .iter()
            .enumerate()
            .filter(|(_, s)| s.status.is_undecided())
            .map(|(i, _)| i)
            .collect(),
    };

    let mut effects = Vec::new();
    for idx in due {
        let step = &mut request.steps[idx];
        if step.notified {
            continue;
        }
        step.notified = true;
        let kind = if step.status == StepStatus::Delegated {
            NotificationKind::Delegated
        } else {
            NotificationKind::ApprovalRequired
        };
        effects.push(ChainEffect::Notify {
            kind,
            recipients: vec![step.assignee().to_string()],
            step_id: Some(step.id.clone()),
        });
    }
    effects
}

fn is_active(request: &ApprovalRequest, idx: usize) -> bool {
    match request.mode {
        ChainMode::Sequential => request.steps.iter().position(|s| s.status.is_undecided()) == Some(idx),
        ChainMode::Parallel | ChainMode::Quorum => true,
    }
}

fn ensure_pending(request: &ApprovalRequest) -> Result<(), ApprovalError> {
    if request.status.is_terminal() {
        Err(ApprovalError::AlreadyResolved(request.id.to_string()))
    } else {
        Ok(())
    }
}

fn step_index(request: &ApprovalRequest, step_id: &str) -> Result<usize, ApprovalError> {
    request
        .steps
        .iter()
        .position(|s| s.id == step_id)
        .ok_or_else(|| ApprovalError::UnknownStep(step_id.to_string()))
}

/// Index of a step that may take a decision right now
fn open_step(request: &ApprovalRequest, step_id: &str) -> Result<usize, ApprovalError> {
    ensure_pending(request)?;
    let idx = step_index(request, step_id)?;
    if !request.steps[idx].status.is_undecided() {
        return Err(ApprovalError::StepAlreadyDecided(step_id.to_string()));
    }
    if !is_active(request, idx) {
        return Err(ApprovalError::StepNotActive(step_id.to_string()));
    }
    Ok(idx)
}
