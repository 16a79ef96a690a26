use async_trait::async_trait;
use flowcore::{ports, Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{ConfigField, NodeFactory, NodeMetadata};
use std::collections::BTreeMap;

pub const LOG: &str = "log";

/// Logs a message rendered against the run, passing its input through
pub struct LogNode;

#[async_trait]
impl Node for LogNode {
    fn node_type(&self) -> &str {
        LOG
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(mock) = ctx.test_mock() {
            return Ok(NodeOutput::new().with_data(mock.clone()));
        }

        let message = ctx
            .resolve_config("message")?
            .map(|m| m.to_display_string())
            .unwrap_or_else(|| "(no message)".to_string());
        let level = ctx
            .config
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("info");

        match level {
            "warn" | "warning" => {
                tracing::warn!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
                ctx.events.warn(message.clone());
            }
            "debug" => {
                tracing::debug!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
                ctx.events.info(message.clone());
            }
            _ => {
                tracing::info!(run_id = %ctx.run_id, node_id = %ctx.node_id, "{}", message);
                ctx.events.info(message.clone());
            }
        }

        let data = ctx.inputs.get(ports::IN).cloned().unwrap_or_default();
        Ok(NodeOutput::new().with_data(data))
    }
}

pub struct LogNodeFactory;

impl NodeFactory for LogNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(LogNode))
    }

    fn node_type(&self) -> &str {
        LOG
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Logs a message for debugging", "debug")
            .with_config(ConfigField::value("message", "Message template"))
            .with_config(ConfigField::value("level", "info, warn or debug"))
    }
}
