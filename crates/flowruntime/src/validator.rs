//! Structural and semantic checks run on a raw graph before publish.
//!
//! Every rule runs independently and all findings are kept, so an author can
//! fix a graph in one pass. Reachability is the only rule with a
//! prerequisite: it needs a start node to walk from.

use crate::registry::{FieldKind, NodeRegistry};
use crate::topology::GraphTopology;
use flowcore::expression;
use flowcore::{node_types, Diagnostic, Graph, NodeSpec, ValidationReport, Value, WorkflowError};
use std::collections::HashSet;
use std::sync::Arc;

pub mod rules {
    pub const DUPLICATE_NODE: &str = "duplicate_node";
    pub const START_NODE: &str = "start_node";
    pub const END_NODE: &str = "end_node";
    pub const UNKNOWN_TYPE: &str = "unknown_type";
    pub const DANGLING_CONNECTION: &str = "dangling_connection";
    pub const SELF_CONNECTION: &str = "self_connection";
    pub const UNREACHABLE: &str = "unreachable";
    pub const DEAD_END: &str = "dead_end";
    pub const CYCLE: &str = "cycle";
    pub const PARALLEL_BALANCE: &str = "parallel_balance";
    pub const EXPRESSION_SYNTAX: &str = "expression_syntax";
    pub const MISSING_CONFIG: &str = "missing_config";
    pub const REQUIRED_INPUT: &str = "required_input";
}

pub struct GraphValidator {
    registry: Arc<NodeRegistry>,
}

impl GraphValidator {
    pub fn new(registry: Arc<NodeRegistry>) -> Self {
        Self { registry }
    }

    /// Run every rule. Never mutates the graph.
    pub fn validate(&self, graph: &Graph) -> ValidationReport {
        let topology = GraphTopology::build(graph);
        let mut diagnostics = Vec::new();

        diagnostics.extend(rule_duplicate_nodes(graph));
        diagnostics.extend(rule_start_node(graph));
        diagnostics.extend(rule_end_node(graph));
        diagnostics.extend(self.rule_known_types(graph));
        diagnostics.extend(rule_connection_endpoints(graph));
        diagnostics.extend(rule_reachability(graph, &topology));
        diagnostics.extend(rule_dead_ends(graph));
        diagnostics.extend(rule_cycles(&topology));
        diagnostics.extend(rule_parallel_balance(graph));
        diagnostics.extend(self.rule_expression_syntax(graph));
        diagnostics.extend(self.rule_required_config(graph));
        diagnostics.extend(self.rule_required_inputs(graph));

        let report = ValidationReport::from_diagnostics(diagnostics);
        tracing::debug!(
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "Graph validated"
        );
        report
    }

    /// Validate and turn a failing report into an error carrying all findings
    pub fn validate_or_raise(&self, graph: &Graph) -> Result<ValidationReport, WorkflowError> {
        let report = self.validate(graph);
        if report.valid {
            Ok(report)
        } else {
            Err(WorkflowError::Validation(report))
        }
    }

    fn rule_known_types(&self, graph: &Graph) -> Vec<Diagnostic> {
        graph
            .nodes
            .iter()
            .filter(|node| !self.registry.contains(&node.node_type))
            .map(|node| {
                Diagnostic::error(
                    rules::UNKNOWN_TYPE,
                    format!("unknown node type '{}'", node.node_type),
                )
                .with_node_id(&node.id)
            })
            .collect()
    }

    fn rule_expression_syntax(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in &graph.nodes {
            let metadata = self.registry.get_metadata(&node.node_type);
            let mut declared = HashSet::new();

            if let Some(metadata) = &metadata {
                for field in metadata.expression_fields() {
                    declared.insert(field.name.as_str());
                    let Some(value) = node.config.get(&field.name) else {
                        continue;
                    };
                    diagnostics.extend(check_expression_field(node, &field.name, field.kind, value));
                }
            }

            // `${...}` in any other field is interpolated at run time
            for (name, value) in &node.config {
                if declared.contains(name.as_str()) {
                    continue;
                }
                check_templates(node, name, value, &mut diagnostics);
            }
        }
        diagnostics
    }

    fn rule_required_config(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in &graph.nodes {
            let Some(metadata) = self.registry.get_metadata(&node.node_type) else {
                continue;
            };
            for field in metadata.config.iter().filter(|f| f.required) {
                if !node.config.contains_key(&field.name) {
                    diagnostics.push(
                        Diagnostic::error(
                            rules::MISSING_CONFIG,
                            format!("missing required configuration '{}'", field.name),
                        )
                        .with_node_id(&node.id)
                        .with_field(&field.name),
                    );
                }
            }
        }
        diagnostics
    }

    fn rule_required_inputs(&self, graph: &Graph) -> Vec<Diagnostic> {
        let mut diagnostics = Vec::new();
        for node in &graph.nodes {
            if node.node_type == node_types::START {
                continue;
            }
            let Some(metadata) = self.registry.get_metadata(&node.node_type) else {
                continue;
            };
            for port in metadata.required_inputs() {
                let connected = graph
                    .connections
                    .iter()
                    .any(|c| c.target == node.id && c.target_port == port.name);
                if !connected {
                    diagnostics.push(
                        Diagnostic::warning(
                            rules::REQUIRED_INPUT,
                            format!("required input port '{}' has no incoming connection", port.name),
                        )
                        .with_node_id(&node.id),
                    );
                }
            }
        }
        diagnostics
    }
}

fn rule_duplicate_nodes(graph: &Graph) -> Vec<Diagnostic> {
    let mut seen = HashSet::new();
    graph
        .nodes
        .iter()
        .filter(|node| !seen.insert(node.id.as_str()))
        .map(|node| {
            Diagnostic::error(rules::DUPLICATE_NODE, format!("duplicate node id '{}'", node.id))
                .with_node_id(&node.id)
        })
        .collect()
}

fn rule_start_node(graph: &Graph) -> Vec<Diagnostic> {
    let starts = count_type(graph, node_types::START);
    if starts == 1 {
        Vec::new()
    } else {
        vec![Diagnostic::error(
            rules::START_NODE,
            format!("graph must have exactly one start node; found {}", starts),
        )]
    }
}

fn rule_end_node(graph: &Graph) -> Vec<Diagnostic> {
    if count_type(graph, node_types::END) == 0 {
        vec![Diagnostic::error(
            rules::END_NODE,
            "graph must have at least one end node",
        )]
    } else {
        Vec::new()
    }
}

fn rule_connection_endpoints(graph: &Graph) -> Vec<Diagnostic> {
    let ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();
    let mut diagnostics = Vec::new();
    for conn in &graph.connections {
        for (end, id) in [("source", &conn.source), ("target", &conn.target)] {
            if !ids.contains(id.as_str()) {
                diagnostics.push(
                    Diagnostic::error(
                        rules::DANGLING_CONNECTION,
                        format!(
                            "connection {}.{} -> {}.{} references missing {} node '{}'",
                            conn.source, conn.source_port, conn.target, conn.target_port, end, id
                        ),
                    )
                    .with_node_id(id.as_str()),
                );
            }
        }
        if conn.source == conn.target {
            diagnostics.push(
                Diagnostic::error(
                    rules::SELF_CONNECTION,
                    format!("node '{}' is connected to itself", conn.source),
                )
                .with_node_id(&conn.source),
            );
        }
    }
    diagnostics
}

fn rule_reachability(graph: &Graph, topology: &GraphTopology) -> Vec<Diagnostic> {
    let starts: Vec<_> = topology.of_type(node_types::START).collect();
    if starts.is_empty() {
        return Vec::new();
    }

    let mut reachable = HashSet::new();
    for start in starts {
        reachable.extend(topology.reachable_from(start));
    }

    let mut reported = HashSet::new();
    graph
        .nodes
        .iter()
        .filter(|node| node.node_type != node_types::START)
        .filter(|node| {
            topology
                .index_of(&node.id)
                .map(|idx| !reachable.contains(&idx))
                .unwrap_or(true)
        })
        .filter(|node| reported.insert(node.id.as_str()))
        .map(|node| {
            Diagnostic::error(
                rules::UNREACHABLE,
                format!("node '{}' is not reachable from the start node", node.id),
            )
            .with_node_id(&node.id)
        })
        .collect()
}

fn rule_dead_ends(graph: &Graph) -> Vec<Diagnostic> {
    let sources: HashSet<&str> = graph.connections.iter().map(|c| c.source.as_str()).collect();
    graph
        .nodes
        .iter()
        .filter(|node| node.node_type != node_types::END && !node_types::is_loop(&node.node_type))
        .filter(|node| !sources.contains(node.id.as_str()))
        .map(|node| {
            Diagnostic::warning(
                rules::DEAD_END,
                format!("node '{}' has no outgoing connection", node.id),
            )
            .with_node_id(&node.id)
        })
        .collect()
}

fn rule_cycles(topology: &GraphTopology) -> Vec<Diagnostic> {
    match topology.topological_order() {
        Ok(_) => Vec::new(),
        Err(nodes) => vec![Diagnostic::error(
            rules::CYCLE,
            format!(
                "cycle detected among nodes: {} (only edges back into forEach/while loops may close a cycle)",
                nodes.join(", ")
            ),
        )],
    }
}

fn rule_parallel_balance(graph: &Graph) -> Vec<Diagnostic> {
    let parallels = count_type(graph, node_types::PARALLEL);
    let merges = count_type(graph, node_types::MERGE);
    if parallels == merges {
        Vec::new()
    } else {
        vec![Diagnostic::warning(
            rules::PARALLEL_BALANCE,
            format!(
                "{} parallel node(s) but {} merge node(s); parallel regions may be unbalanced",
                parallels, merges
            ),
        )]
    }
}

fn count_type(graph: &Graph, node_type: &str) -> usize {
    graph.nodes.iter().filter(|n| n.node_type == node_type).count()
}

fn check_expression_field(node: &NodeSpec, name: &str, kind: FieldKind, value: &Value) -> Vec<Diagnostic> {
    let mut entries: Vec<(String, &str)> = Vec::new();
    match (kind, value) {
        (FieldKind::Expression, Value::String(src)) => entries.push((name.to_string(), src)),
        (FieldKind::ExpressionList, Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                if let Value::String(src) = item {
                    entries.push((format!("{}[{}]", name, i), src));
                }
            }
        }
        (FieldKind::Assignments, Value::Object(map)) => {
            for (key, item) in map {
                if let Value::String(src) = item {
                    entries.push((format!("{}.{}", name, key), src));
                }
            }
        }
        (FieldKind::ExpressionList, _) | (FieldKind::Assignments, _) => {
            return vec![Diagnostic::error(
                rules::EXPRESSION_SYNTAX,
                format!("field '{}' has the wrong shape ({})", name, value.type_name()),
            )
            .with_node_id(&node.id)
            .with_field(name)];
        }
        _ => {}
    }

    entries
        .into_iter()
        .filter_map(|(field, src)| {
            expression::check_syntax(src).err().map(|err| {
                Diagnostic::error(rules::EXPRESSION_SYNTAX, err.to_string())
                    .with_node_id(&node.id)
                    .with_field(field)
            })
        })
        .collect()
}

fn check_templates(node: &NodeSpec, field: &str, value: &Value, diagnostics: &mut Vec<Diagnostic>) {
    match value {
        Value::String(src) if expression::is_template(src) => {
            if let Err(err) = expression::check_template(src) {
                diagnostics.push(
                    Diagnostic::error(rules::EXPRESSION_SYNTAX, err.to_string())
                        .with_node_id(&node.id)
                        .with_field(field),
                );
            }
        }
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                check_templates(node, &format!("{}[{}]", field, i), item, diagnostics);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                check_templates(node, &format!("{}.{}", field, key), item, diagnostics);
            }
        }
        _ => {}
    }
}
