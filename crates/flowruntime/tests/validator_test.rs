mod common;

use common::{task, Recorder};
use flowcore::{Graph, NodeSpec, ValidationReport, WorkflowError};
use flowruntime::{compile, rules, GraphValidator};
use std::sync::Arc;
use uuid::Uuid;

fn validator() -> GraphValidator {
    GraphValidator::new(Arc::new(common::registry(&Arc::new(Recorder::default()))))
}

fn validate(graph: &Graph) -> ValidationReport {
    validator().validate(graph)
}

fn errors_for<'a>(report: &'a ValidationReport, rule: &str) -> Vec<&'a flowcore::Diagnostic> {
    report.errors.iter().filter(|d| d.rule == rule).collect()
}

fn warnings_for<'a>(report: &'a ValidationReport, rule: &str) -> Vec<&'a flowcore::Diagnostic> {
    report.warnings.iter().filter(|d| d.rule == rule).collect()
}

fn start_task_end() -> Graph {
    Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("work"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "work")
        .link("work", "end")
}

#[test]
fn well_formed_graph_is_valid() {
    let report = validate(&start_task_end());
    assert!(report.valid);
    assert!(report.errors.is_empty());
    assert!(report.warnings.is_empty());
}

#[test]
fn start_node_must_be_unique() {
    let none = Graph::new()
        .with_node(task("work"))
        .with_node(NodeSpec::new("end", "end"))
        .link("work", "end");
    assert!(validate(&none).has_rule(rules::START_NODE));

    let two = start_task_end()
        .with_node(NodeSpec::new("start2", "start"))
        .link("start2", "work");
    let report = validate(&two);
    assert!(!report.valid);
    assert_eq!(errors_for(&report, rules::START_NODE).len(), 1);
}

#[test]
fn end_node_is_required() {
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("work"))
        .link("start", "work");
    let report = validate(&graph);
    assert!(!report.valid);
    assert!(report.has_rule(rules::END_NODE));
}

#[test]
fn duplicate_ids_are_reported_once_per_repeat() {
    let graph = start_task_end().with_node(task("work"));
    let report = validate(&graph);
    let duplicates = errors_for(&report, rules::DUPLICATE_NODE);
    assert_eq!(duplicates.len(), 1);
    assert_eq!(duplicates[0].node_id.as_deref(), Some("work"));
}

#[test]
fn unknown_node_type_is_an_error() {
    let graph = start_task_end()
        .with_node(NodeSpec::new("odd", "teleport"))
        .link("work", "odd")
        .link("odd", "end");
    let report = validate(&graph);
    let unknown = errors_for(&report, rules::UNKNOWN_TYPE);
    assert_eq!(unknown.len(), 1);
    assert_eq!(unknown[0].node_id.as_deref(), Some("odd"));
}

#[test]
fn connections_must_join_two_distinct_existing_nodes() {
    let graph = start_task_end().link("work", "ghost").link("work", "work");
    let report = validate(&graph);

    let dangling = errors_for(&report, rules::DANGLING_CONNECTION);
    assert_eq!(dangling.len(), 1);
    assert_eq!(dangling[0].node_id.as_deref(), Some("ghost"));
    assert!(report.has_rule(rules::SELF_CONNECTION));
}

#[test]
fn nodes_off_the_start_path_are_unreachable() {
    let graph = start_task_end()
        .with_node(task("island"))
        .link("island", "end");
    let report = validate(&graph);
    let unreachable = errors_for(&report, rules::UNREACHABLE);
    assert_eq!(unreachable.len(), 1);
    assert_eq!(unreachable[0].node_id.as_deref(), Some("island"));
}

#[test]
fn dead_end_is_only_a_warning() {
    let graph = start_task_end()
        .with_node(task("log_and_stop"))
        .link("work", "log_and_stop");
    let report = validate(&graph);
    assert!(report.valid);
    let dead = warnings_for(&report, rules::DEAD_END);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].node_id.as_deref(), Some("log_and_stop"));
}

#[test]
fn plain_cycle_is_rejected_but_loop_back_is_not() {
    let cyclic = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("a"))
        .with_node(task("b"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "a")
        .link("a", "b")
        .link("b", "a")
        .link("b", "end");
    let report = validate(&cyclic);
    assert!(!report.valid);
    assert!(report.has_rule(rules::CYCLE));

    let looping = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("loop", "while").with_config("condition", "index < 2"))
        .with_node(task("body"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "loop")
        .link_port("loop", "body", "body")
        .link("body", "loop")
        .link_port("loop", "done", "end");
    let report = validate(&looping);
    assert!(report.valid, "unexpected errors: {:?}", report.errors);
}

#[test]
fn unbalanced_parallel_is_a_warning_and_still_compiles() {
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("fork", "parallel"))
        .with_node(task("a"))
        .with_node(task("b"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "fork")
        .link("fork", "a")
        .link("fork", "b")
        .link("a", "end")
        .link("b", "end");
    let report = validate(&graph);
    assert!(report.valid);
    assert_eq!(warnings_for(&report, rules::PARALLEL_BALANCE).len(), 1);

    let plan = compile(Uuid::new_v4(), 1, &graph, None).unwrap();
    assert_eq!(plan.steps.len(), 5);
}

#[test]
fn expression_errors_name_the_field() {
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("check", "condition").with_config("condition", "input.total >"))
        .with_node(task("call").with_config("output", "${frobnicate(input)}"))
        .with_node(task("text").with_config("output", "total: ${input.total"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "check")
        .link_port("check", "true", "call")
        .link_port("check", "false", "text")
        .link("call", "end")
        .link("text", "end");
    let report = validate(&graph);
    let syntax = errors_for(&report, rules::EXPRESSION_SYNTAX);

    let fields: Vec<(&str, &str)> = syntax
        .iter()
        .map(|d| (d.node_id.as_deref().unwrap_or(""), d.field.as_deref().unwrap_or("")))
        .collect();
    assert!(fields.contains(&("check", "condition")));
    assert!(fields.contains(&("call", "output")));
    assert!(fields.contains(&("text", "output")));
}

#[test]
fn missing_required_config_is_an_error() {
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("check", "condition"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "check")
        .link_port("check", "true", "end");
    let report = validate(&graph);
    let missing = errors_for(&report, rules::MISSING_CONFIG);
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].field.as_deref(), Some("condition"));
}

#[test]
fn unconnected_required_input_is_a_warning() {
    let graph = start_task_end()
        .with_node(NodeSpec::new("store", "sink"))
        .link("work", "store")
        .link("store", "end");
    let report = validate(&graph);
    assert!(report.valid);
    assert_eq!(warnings_for(&report, rules::REQUIRED_INPUT).len(), 1);

    let wired = start_task_end()
        .with_node(NodeSpec::new("store", "sink"))
        .connect_ports("work", "out", "store", "payload")
        .link("store", "end");
    assert!(!validate(&wired).has_rule(rules::REQUIRED_INPUT));
}

#[test]
fn every_problem_is_collected_in_one_pass() {
    let graph = Graph::new()
        .with_node(task("a"))
        .with_node(task("a"))
        .with_node(NodeSpec::new("b", "teleport"))
        .link("a", "nowhere");
    let report = validate(&graph);
    for rule in [
        rules::START_NODE,
        rules::END_NODE,
        rules::DUPLICATE_NODE,
        rules::UNKNOWN_TYPE,
        rules::DANGLING_CONNECTION,
    ] {
        assert!(report.has_rule(rule), "missing {}", rule);
    }
}

#[test]
fn validate_or_raise_carries_the_full_report() {
    let graph = Graph::new().with_node(task("lonely"));
    match validator().validate_or_raise(&graph) {
        Err(WorkflowError::Validation(report)) => {
            assert!(report.has_rule(rules::START_NODE));
            assert!(report.has_rule(rules::END_NODE));
        }
        other => panic!("expected validation failure, got {:?}", other.map(|r| r.valid)),
    }
}

#[test]
fn validation_leaves_graph_untouched() {
    let graph = start_task_end().with_node(task("island"));
    let before = serde_json::to_string(&graph).unwrap();
    let _ = validate(&graph);
    assert_eq!(serde_json::to_string(&graph).unwrap(), before);
}
