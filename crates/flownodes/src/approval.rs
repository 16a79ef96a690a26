use async_trait::async_trait;
use flowcore::{
    node_types, ports, ApprovalSpec, ChainMode, Node, NodeContext, NodeError, NodeOutput, Value,
};
use flowruntime::{ApprovalService, ConfigField, NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Suspends the run on an approval chain and routes on its outcome.
///
/// `approved` is taken only for an APPROVED chain; REJECTED, EXPIRED and
/// CANCELLED all leave through `rejected`.
pub struct ApprovalGateNode {
    service: Arc<ApprovalService>,
}

#[async_trait]
impl Node for ApprovalGateNode {
    fn node_type(&self) -> &str {
        node_types::APPROVAL_GATE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(mock) = ctx.test_mock() {
            let approved = mock.get("approved").map(Value::is_truthy).unwrap_or(true);
            return Ok(NodeOutput::new()
                .with_data(mock.clone())
                .with_port(if approved { ports::APPROVED } else { ports::REJECTED }));
        }

        let spec = approval_spec(&ctx)?;
        let request = self
            .service
            .open_for_node(&ctx.tenant_id, ctx.run_id, &ctx.execution_key(), &spec)
            .await
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        ctx.events
            .info(format!("Waiting on approval request {}", request.id));

        let outcome = self
            .service
            .wait_for_outcome(request.id, &ctx.cancellation)
            .await
            .map_err(|e| NodeError::ExecutionFailed(e.to_string()))?;
        if ctx.cancellation.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        tracing::info!(
            run_id = %ctx.run_id,
            node_id = %ctx.node_id,
            request_id = %outcome.request_id,
            status = ?outcome.status,
            "Approval gate resolved"
        );
        let port = if outcome.approved {
            ports::APPROVED
        } else {
            ports::REJECTED
        };
        Ok(NodeOutput::new().with_data(outcome.to_value()).with_port(port))
    }
}

/// Build the chain spec from config, `${...}` resolved against the run
fn approval_spec(ctx: &NodeContext) -> Result<ApprovalSpec, NodeError> {
    let title = ctx
        .resolve_config("title")?
        .map(|t| t.to_display_string())
        .unwrap_or_else(|| ctx.node_id.clone());

    let mode = match ctx.resolve_config("mode")? {
        None | Some(Value::Null) => ChainMode::Sequential,
        Some(value) => parse_mode(&value.to_display_string())?,
    };

    let mut spec = ApprovalSpec::new(title, mode)
        .with_approvers(string_list(ctx, "approvers")?)
        .with_roles(string_list(ctx, "roles")?)
        .with_escalation(string_list(ctx, "escalation")?);
    spec.description = ctx
        .resolve_config("description")?
        .filter(|d| !d.is_null())
        .map(|d| d.to_display_string());
    spec.quorum_required = optional_u64(ctx, "quorum_required")?.map(|q| q as u32);
    spec.timeout_secs = optional_u64(ctx, "timeout_secs")?;
    Ok(spec)
}

fn parse_mode(raw: &str) -> Result<ChainMode, NodeError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "sequential" => Ok(ChainMode::Sequential),
        "parallel" => Ok(ChainMode::Parallel),
        "quorum" => Ok(ChainMode::Quorum),
        other => Err(NodeError::Configuration(format!(
            "Unknown approval mode '{}'",
            other
        ))),
    }
}

/// Array of ids, or a comma-separated string
fn string_list(ctx: &NodeContext, name: &str) -> Result<Vec<String>, NodeError> {
    match ctx.resolve_config(name)? {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.iter().map(Value::to_display_string).collect()),
        Some(Value::String(s)) => Ok(s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()),
        Some(other) => Err(NodeError::InvalidInputType {
            field: name.to_string(),
            expected: "array".to_string(),
            actual: other.type_name().to_string(),
        }),
    }
}

fn optional_u64(ctx: &NodeContext, name: &str) -> Result<Option<u64>, NodeError> {
    match ctx.resolve_config(name)? {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| NodeError::InvalidInputType {
                field: name.to_string(),
                expected: "non-negative number".to_string(),
                actual: value.type_name().to_string(),
            }),
    }
}

pub struct ApprovalGateNodeFactory {
    service: Arc<ApprovalService>,
}

impl ApprovalGateNodeFactory {
    pub fn new(service: Arc<ApprovalService>) -> Self {
        Self { service }
    }
}

impl NodeFactory for ApprovalGateNodeFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        if let Some(Value::String(mode)) = config.get("mode") {
            if !flowcore::expression::is_template(mode) {
                parse_mode(mode)?;
            }
        }
        Ok(Box::new(ApprovalGateNode {
            service: self.service.clone(),
        }))
    }

    fn node_type(&self) -> &str {
        node_types::APPROVAL_GATE
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Waits for an approval chain to resolve", "approval")
            .with_outputs(vec![
                PortDefinition::data(ports::APPROVED),
                PortDefinition::data(ports::REJECTED),
                PortDefinition::flow(ports::ERROR),
            ])
            .with_config(ConfigField::value("title", "Request title"))
            .with_config(ConfigField::value("description", "Request description"))
            .with_config(ConfigField::value("mode", "sequential, parallel or quorum"))
            .with_config(ConfigField::value("approvers", "Approver ids"))
            .with_config(ConfigField::value("roles", "Roles whose members approve"))
            .with_config(ConfigField::value("quorum_required", "Approvals needed in quorum mode"))
            .with_config(ConfigField::value("timeout_secs", "Seconds before the request expires"))
            .with_config(ConfigField::value("escalation", "Contacts notified on expiry"))
    }
}
