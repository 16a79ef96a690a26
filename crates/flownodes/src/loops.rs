//! Loop node types.
//!
//! The walker owns iteration: it invokes these executors to learn what to
//! iterate over (`forEach`) or whether to go round again (`while`), and
//! walks the body itself.

use async_trait::async_trait;
use flowcore::{node_types, ports, Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{ConfigField, NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;

fn loop_ports() -> Vec<PortDefinition> {
    vec![
        PortDefinition::flow(ports::BODY).describe("Entered once per iteration"),
        PortDefinition::flow(ports::DONE).describe("Taken after the last iteration"),
        PortDefinition::flow(ports::ERROR),
    ]
}

/// Evaluates `items` to the array the body runs over
pub struct ForEachNode;

#[async_trait]
impl Node for ForEachNode {
    fn node_type(&self) -> &str {
        node_types::FOR_EACH
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let items = ctx.evaluate_config("items")?;
        match &items {
            Value::Array(list) => {
                ctx.events.info(format!("Iterating over {} items", list.len()));
            }
            Value::Null => {}
            other => {
                return Err(NodeError::InvalidInputType {
                    field: "items".to_string(),
                    expected: "array".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        }
        Ok(NodeOutput::new().with_data(items))
    }
}

pub struct ForEachNodeFactory;

impl NodeFactory for ForEachNodeFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        if !config.contains_key("items") {
            return Err(NodeError::Configuration("Missing config: items".to_string()));
        }
        Ok(Box::new(ForEachNode))
    }

    fn node_type(&self) -> &str {
        node_types::FOR_EACH
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Runs its body once per item", "loop")
            .with_outputs(loop_ports())
            .with_config(ConfigField::expression("items", "Array expression").required())
            .with_config(ConfigField::value("max_iterations", "Upper bound on items"))
    }
}

/// Evaluates `condition` before every iteration
pub struct WhileNode;

#[async_trait]
impl Node for WhileNode {
    fn node_type(&self) -> &str {
        node_types::WHILE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let proceed = ctx.evaluate_config("condition")?.is_truthy();
        Ok(NodeOutput::new().with_data(Value::Bool(proceed)))
    }
}

pub struct WhileNodeFactory;

impl NodeFactory for WhileNodeFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        if !config.contains_key("condition") {
            return Err(NodeError::Configuration("Missing config: condition".to_string()));
        }
        Ok(Box::new(WhileNode))
    }

    fn node_type(&self) -> &str {
        node_types::WHILE
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Runs its body while a condition holds", "loop")
            .with_outputs(loop_ports())
            .with_config(ConfigField::expression("condition", "Checked before each iteration").required())
            .with_config(ConfigField::value("max_iterations", "Upper bound on iterations"))
            .with_config(ConfigField::value("delay_ms", "Pause between iterations"))
    }
}
