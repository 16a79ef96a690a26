//! Structural node types: entry, exit, branching and parallel fan-out/in.

use async_trait::async_trait;
use flowcore::{node_types, ports, Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{ConfigField, NodeFactory, NodeMetadata, PortDefinition};
use std::collections::BTreeMap;

/// Data arriving on the default input port, or the run input for a node
/// nothing feeds
fn passthrough(ctx: &NodeContext) -> Value {
    ctx.inputs
        .get(ports::IN)
        .cloned()
        .unwrap_or_else(|| ctx.run_input.clone())
}

/// Entry point; hands the run input to its successors
pub struct StartNode;

#[async_trait]
impl Node for StartNode {
    fn node_type(&self) -> &str {
        node_types::START
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new().with_data(ctx.run_input.clone()))
    }
}

pub struct StartNodeFactory;

impl NodeFactory for StartNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(StartNode))
    }

    fn node_type(&self) -> &str {
        node_types::START
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Entry point of a workflow", "control").with_inputs(vec![])
    }
}

/// Exit point; its data becomes the run output
pub struct EndNode;

#[async_trait]
impl Node for EndNode {
    fn node_type(&self) -> &str {
        node_types::END
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let data = match ctx.resolve_config("output")? {
            Some(output) => output,
            None => passthrough(&ctx),
        };
        Ok(NodeOutput::new().with_data(data))
    }
}

pub struct EndNodeFactory;

impl NodeFactory for EndNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(EndNode))
    }

    fn node_type(&self) -> &str {
        node_types::END
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Exit point; its data becomes the run output", "control")
            .with_outputs(vec![])
            .with_config(ConfigField::value(
                "output",
                "Output template; defaults to the incoming data",
            ))
    }
}

/// Two-way branch on a boolean expression
pub struct ConditionNode;

#[async_trait]
impl Node for ConditionNode {
    fn node_type(&self) -> &str {
        node_types::CONDITION
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let result = ctx.evaluate_config("condition")?.is_truthy();
        ctx.events.info(format!("Condition evaluated to {}", result));

        let port = if result { ports::TRUE } else { ports::FALSE };
        Ok(NodeOutput::new().with_data(passthrough(&ctx)).with_port(port))
    }
}

pub struct ConditionNodeFactory;

impl NodeFactory for ConditionNodeFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        if !config.contains_key("condition") {
            return Err(NodeError::Configuration("Missing config: condition".to_string()));
        }
        Ok(Box::new(ConditionNode))
    }

    fn node_type(&self) -> &str {
        node_types::CONDITION
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Routes to 'true' or 'false'", "control")
            .with_outputs(vec![
                PortDefinition::flow(ports::TRUE),
                PortDefinition::flow(ports::FALSE),
                PortDefinition::flow(ports::ERROR),
            ])
            .with_config(ConfigField::expression("condition", "Boolean expression").required())
    }
}

/// Multi-way branch: the first truthy case wins, `default` otherwise
pub struct SwitchNode {
    cases: usize,
}

#[async_trait]
impl Node for SwitchNode {
    fn node_type(&self) -> &str {
        node_types::SWITCH
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let cases = match ctx.require_config("cases")? {
            Value::Array(cases) => cases.clone(),
            other => {
                return Err(NodeError::InvalidInputType {
                    field: "cases".to_string(),
                    expected: "array".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        };

        let scope = ctx.scope();
        let mut port = ports::DEFAULT.to_string();
        for (i, case) in cases.iter().take(self.cases).enumerate() {
            let matched = match case {
                Value::String(src) => flowcore::expression::evaluate(src, &scope)
                    .map_err(|source| NodeError::Expression {
                        field: format!("cases[{}]", i),
                        source,
                    })?
                    .is_truthy(),
                other => other.is_truthy(),
            };
            if matched {
                port = format!("case_{}", i);
                break;
            }
        }

        tracing::debug!(node_id = %ctx.node_id, port = %port, "Switch selected port");
        Ok(NodeOutput::new().with_data(passthrough(&ctx)).with_port(port))
    }
}

pub struct SwitchNodeFactory;

impl NodeFactory for SwitchNodeFactory {
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        let cases = config
            .get("cases")
            .and_then(Value::as_array)
            .map(Vec::len)
            .ok_or_else(|| NodeError::Configuration("'cases' must be an array".to_string()))?;
        Ok(Box::new(SwitchNode { cases }))
    }

    fn node_type(&self) -> &str {
        node_types::SWITCH
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Routes to 'case_<i>' of the first truthy case, or 'default'", "control")
            .with_outputs(vec![
                PortDefinition::flow("case_<i>"),
                PortDefinition::flow(ports::DEFAULT),
            ])
            .with_config(ConfigField::expression_list("cases", "Case expressions").required())
    }
}

/// Opens a parallel region; every connected output port runs
pub struct ParallelNode;

#[async_trait]
impl Node for ParallelNode {
    fn node_type(&self) -> &str {
        node_types::PARALLEL
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::new().with_data(passthrough(&ctx)))
    }
}

pub struct ParallelNodeFactory;

impl NodeFactory for ParallelNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ParallelNode))
    }

    fn node_type(&self) -> &str {
        node_types::PARALLEL
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Runs all outgoing branches concurrently", "control")
    }
}

/// Join point of a parallel region; emits the collected branch data
pub struct MergeNode;

#[async_trait]
impl Node for MergeNode {
    fn node_type(&self) -> &str {
        node_types::MERGE
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let data = if ctx.inputs.len() == 1 {
            ctx.inputs.values().next().cloned().unwrap_or_default()
        } else {
            Value::Object(ctx.inputs.clone())
        };
        Ok(NodeOutput::new().with_data(data))
    }
}

pub struct MergeNodeFactory;

impl NodeFactory for MergeNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(MergeNode))
    }

    fn node_type(&self) -> &str {
        node_types::MERGE
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Joins the branches of a parallel region", "control")
            .with_inputs(vec![PortDefinition::data(ports::IN).describe("Branch data, keyed by source")])
    }
}
