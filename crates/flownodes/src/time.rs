use async_trait::async_trait;
use flowcore::{ports, Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{ConfigField, NodeFactory, NodeMetadata};
use std::collections::BTreeMap;
use tokio::time::{sleep, Duration};

pub const DELAY: &str = "delay";

/// Delay execution for a specified duration, then pass the input through
pub struct DelayNode;

#[async_trait]
impl Node for DelayNode {
    fn node_type(&self) -> &str {
        DELAY
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        if let Some(mock) = ctx.test_mock() {
            return Ok(NodeOutput::new().with_data(mock.clone()));
        }

        let delay_ms = match ctx.resolve_config("delay_ms")? {
            Some(value) => value.as_u64().ok_or_else(|| NodeError::InvalidInputType {
                field: "delay_ms".to_string(),
                expected: "non-negative number".to_string(),
                actual: value.type_name().to_string(),
            })?,
            // Default to 1 second if not specified
            None => 1000,
        };

        ctx.events.info(format!("Delaying for {}ms", delay_ms));

        tokio::select! {
            _ = sleep(Duration::from_millis(delay_ms)) => {}
            _ = ctx.cancellation.cancelled() => return Err(NodeError::Cancelled),
        }

        let data = ctx.inputs.get(ports::IN).cloned().unwrap_or_default();
        Ok(NodeOutput::new().with_data(data))
    }
}

pub struct DelayNodeFactory;

impl NodeFactory for DelayNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(DelayNode))
    }

    fn node_type(&self) -> &str {
        DELAY
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Delay execution for specified milliseconds", "time")
            .with_config(ConfigField::value("delay_ms", "Milliseconds to wait (default 1000)"))
    }
}
