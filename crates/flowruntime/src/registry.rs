use flowcore::{Node, NodeError, Value, WorkflowError};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Factory trait for creating node instances
pub trait NodeFactory: Send + Sync {
    /// Create a new instance of the node with given configuration
    fn create(&self, config: &BTreeMap<String, Value>) -> Result<Box<dyn Node>, NodeError>;

    /// Get node type identifier
    fn node_type(&self) -> &str;

    /// Port set and configuration schema of the node type
    fn metadata(&self) -> NodeMetadata {
        NodeMetadata::default()
    }
}

/// Metadata about a node type
#[derive(Debug, Clone, Serialize)]
pub struct NodeMetadata {
    pub description: String,
    pub category: String,
    pub inputs: Vec<PortDefinition>,
    pub outputs: Vec<PortDefinition>,
    pub config: Vec<ConfigField>,
}

impl Default for NodeMetadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            category: "general".to_string(),
            inputs: vec![PortDefinition::flow("in")],
            outputs: vec![PortDefinition::flow("out")],
            config: Vec::new(),
        }
    }
}

impl NodeMetadata {
    pub fn new(description: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            category: category.into(),
            ..Self::default()
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<PortDefinition>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PortDefinition>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_config(mut self, field: ConfigField) -> Self {
        self.config.push(field);
        self
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &PortDefinition> {
        self.inputs.iter().filter(|p| p.required)
    }

    pub fn expression_fields(&self) -> impl Iterator<Item = &ConfigField> {
        self.config.iter().filter(|f| f.kind != FieldKind::Value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PortKind {
    /// Sequencing only
    Flow,
    /// Carries a payload
    Data,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortDefinition {
    pub name: String,
    pub description: String,
    pub kind: PortKind,
    pub required: bool,
}

impl PortDefinition {
    pub fn flow(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            kind: PortKind::Flow,
            required: false,
        }
    }

    pub fn data(name: impl Into<String>) -> Self {
        Self {
            kind: PortKind::Data,
            ..Self::flow(name)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// How the validator treats a configuration field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Opaque value; `${...}` templates inside strings are still syntax-checked
    Value,
    /// A single expression, bare or `${...}`
    Expression,
    /// An array of expressions
    ExpressionList,
    /// An object whose values are expressions (script assignments)
    Assignments,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigField {
    pub name: String,
    pub description: String,
    pub kind: FieldKind,
    pub required: bool,
}

impl ConfigField {
    pub fn value(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            kind: FieldKind::Value,
            required: false,
        }
    }

    pub fn expression(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Expression,
            ..Self::value(name, description)
        }
    }

    pub fn expression_list(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::ExpressionList,
            ..Self::value(name, description)
        }
    }

    pub fn assignments(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            kind: FieldKind::Assignments,
            ..Self::value(name, description)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Registry of available node types.
///
/// Populated once at startup and shared read-only behind an `Arc` afterwards.
pub struct NodeRegistry {
    factories: HashMap<String, Arc<dyn NodeFactory>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a node factory
    pub fn register(&mut self, factory: Arc<dyn NodeFactory>) {
        let node_type = factory.node_type().to_string();
        tracing::debug!(node_type = %node_type, "Registering node type");
        self.factories.insert(node_type, factory);
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.factories.contains_key(node_type)
    }

    /// Create a node instance from a node type and config
    pub fn create_node(
        &self,
        node_type: &str,
        config: &BTreeMap<String, Value>,
    ) -> Result<Box<dyn Node>, WorkflowError> {
        let factory = self
            .factories
            .get(node_type)
            .ok_or_else(|| WorkflowError::UnknownNodeType(node_type.to_string()))?;

        factory
            .create(config)
            .map_err(|e| WorkflowError::Invalid(format!("Failed to create node: {}", e)))
    }

    /// Get all registered node types, sorted
    pub fn list_node_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.factories.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get metadata for a node type
    pub fn get_metadata(&self, node_type: &str) -> Option<NodeMetadata> {
        self.factories.get(node_type).map(|f| f.metadata())
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}
