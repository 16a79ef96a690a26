use async_trait::async_trait;
use flowcore::expression::{self, EvalScope};
use flowcore::{node_types, Node, NodeContext, NodeError, NodeOutput, Value};
use flowruntime::{ConfigField, NodeFactory, NodeMetadata};
use std::collections::BTreeMap;

/// Assigns run variables from expressions.
///
/// Assignments apply in key order, and each one sees the variables set by
/// those before it.
pub struct ScriptNode;

#[async_trait]
impl Node for ScriptNode {
    fn node_type(&self) -> &str {
        node_types::SCRIPT
    }

    async fn execute(&self, ctx: NodeContext) -> Result<NodeOutput, NodeError> {
        let assignments = match ctx.config.get("assignments") {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(NodeError::InvalidInputType {
                    field: "assignments".to_string(),
                    expected: "object".to_string(),
                    actual: other.type_name().to_string(),
                })
            }
            None => BTreeMap::new(),
        };

        let mut variables = ctx.variables.clone();
        let mut assigned = BTreeMap::new();
        for (name, raw) in assignments {
            let value = {
                let scope = EvalScope::new(&variables, &ctx.node_outputs, &ctx.run_input)
                    .with_locals(&ctx.locals);
                match &raw {
                    Value::String(src) => expression::evaluate(src, &scope),
                    other => expression::interpolate(other, &scope),
                }
                .map_err(|source| NodeError::Expression {
                    field: format!("assignments.{}", name),
                    source,
                })?
            };
            variables.insert(name.clone(), value.clone());
            assigned.insert(name, value);
        }

        let mut output = NodeOutput::new().with_data(Value::Object(assigned.clone()));
        output.variables = assigned;
        Ok(output)
    }
}

pub struct ScriptNodeFactory;

impl NodeFactory for ScriptNodeFactory {
    fn create(&self, _config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError> {
        Ok(Box::new(ScriptNode))
    }

    fn node_type(&self) -> &str {
        node_types::SCRIPT
    }

    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::new("Sets run variables from expressions", "data").with_config(
            ConfigField::assignments("assignments", "Variable name to expression").required(),
        )
    }
}
