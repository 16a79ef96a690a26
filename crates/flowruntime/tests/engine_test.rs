mod common;

use common::{harness, harness_with, task, TENANT};
use flowcore::{
    ExecutionEvent, FlowError, Graph, NodeExecution, NodeExecutionStatus, NodeSpec, RunError,
    RunStatus, Value, WorkflowDefinition, WorkflowError, WorkflowRun,
};
use flowruntime::{rules, RuntimeConfig, Stores};
use std::collections::BTreeMap;
use std::time::Duration;

fn linear() -> Graph {
    Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("greet").with_config("output", "hello ${input.name}"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "greet")
        .link("greet", "end")
}

fn object(pairs: &[(&str, Value)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<BTreeMap<_, _>>(),
    )
}

fn record<'a>(records: &'a [NodeExecution], key: &str) -> &'a NodeExecution {
    records
        .iter()
        .find(|r| r.key() == key)
        .unwrap_or_else(|| panic!("no record for {}", key))
}

async fn run_to_end(
    h: &common::Harness,
    definition_id: flowcore::DefinitionId,
    input: Value,
) -> (WorkflowRun, Vec<NodeExecution>) {
    let run = h.runtime.start(TENANT, definition_id, input, false).await.unwrap();
    let run = h.runtime.wait_for_completion(run.id).await.unwrap();
    let records = h.runtime.node_executions(TENANT, run.id).await.unwrap();
    (run, records)
}

#[tokio::test]
async fn linear_run_completes_with_end_output() {
    let h = harness();
    let id = h.publish_graph(linear()).await;

    let (run, records) = run_to_end(&h, id, object(&[("name", "ada".into())])).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(Value::from("hello ada")));
    assert!(run.error.is_none());
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == NodeExecutionStatus::Completed));
    assert_eq!(h.recorder.calls(), vec!["start", "greet", "end"]);
}

#[tokio::test]
async fn untaken_branch_is_skipped_and_join_still_runs() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("check", "condition").with_config("condition", "input.go"))
        .with_node(task("yes").with_config("output", "took yes"))
        .with_node(task("no").with_config("output", "took no"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "check")
        .link_port("check", "true", "yes")
        .link_port("check", "false", "no")
        .link("yes", "end")
        .link("no", "end");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, object(&[("go", Value::Bool(true))])).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(Value::from("took yes")));
    assert_eq!(record(&records, "check").routed_ports, vec!["true"]);
    assert_eq!(record(&records, "yes").status, NodeExecutionStatus::Completed);
    assert_eq!(record(&records, "no").status, NodeExecutionStatus::Skipped);
    assert_eq!(h.recorder.call_count("no"), 0);
}

#[tokio::test]
async fn node_failure_without_error_port_fails_run_verbatim() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("risky").with_config("fail", "boom"))
        .with_node(task("after"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "risky")
        .link("risky", "after")
        .link("after", "end");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Execution failed: boom"));
    let risky = record(&records, "risky");
    assert_eq!(risky.status, NodeExecutionStatus::Failed);
    assert_eq!(risky.error.as_deref(), Some("Execution failed: boom"));
    assert!(records.iter().all(|r| r.node_id != "after"));
}

#[tokio::test]
async fn failure_routes_down_connected_error_port() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("risky").with_config("fail", "boom"))
        .with_node(NodeSpec::new("end", "end"))
        .with_node(task("recover").with_config("output", "${nodes.risky.error}"))
        .with_node(NodeSpec::new("recovered", "end"))
        .link("start", "risky")
        .link("risky", "end")
        .link_port("risky", "error", "recover")
        .link("recover", "recovered");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(Value::from("Execution failed: boom")));
    let risky = record(&records, "risky");
    assert_eq!(risky.status, NodeExecutionStatus::Failed);
    assert_eq!(risky.routed_ports, vec!["error"]);
    assert_eq!(record(&records, "end").status, NodeExecutionStatus::Skipped);
}

#[tokio::test]
async fn error_reported_in_output_keeps_its_data() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(
            task("charge")
                .with_config("output", "${input.card}")
                .with_config("report_error", "card declined"),
        )
        .with_node(NodeSpec::new("end", "end"))
        .with_node(task("notify").with_config("output", "${nodes.charge}"))
        .with_node(NodeSpec::new("declined", "end"))
        .link("start", "charge")
        .link("charge", "end")
        .link_port("charge", "error", "notify")
        .link("notify", "declined");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, serde_json::json!({ "card": "4242" }).into()).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output, Some(Value::from("4242")));
    let charge = record(&records, "charge");
    assert_eq!(charge.status, NodeExecutionStatus::Failed);
    assert_eq!(charge.error.as_deref(), Some("card declined"));
    assert_eq!(charge.output, Some(Value::from("4242")));
}

#[tokio::test]
async fn retry_policy_reinvokes_until_success() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(
            task("flaky")
                .with_config("fail_times", 2u32)
                .with_config("output", "ok")
                .with_retry(3, 10),
        )
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "flaky")
        .link("flaky", "end");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Completed);
    let flaky = record(&records, "flaky");
    assert_eq!(flaky.status, NodeExecutionStatus::Completed);
    assert_eq!(flaky.attempt, 3);
    assert_eq!(h.recorder.call_count("flaky"), 3);
}

#[tokio::test]
async fn parallel_group_runs_concurrently_and_joins() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("fork", "parallel"))
        .with_node(task("a").with_config("sleep_ms", 150u32).with_config("output", "A"))
        .with_node(task("b").with_config("sleep_ms", 150u32).with_config("output", "B"))
        .with_node(task("c").with_config("sleep_ms", 150u32).with_config("output", "C"))
        .with_node(NodeSpec::new("join", "merge"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "fork")
        .link("fork", "a")
        .link("fork", "b")
        .link("fork", "c")
        .link("a", "join")
        .link("b", "join")
        .link("c", "join")
        .link("join", "end");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert!(h.recorder.peak() >= 2, "peak concurrency was {}", h.recorder.peak());
    assert_eq!(
        run.output,
        Some(object(&[("a", "A".into()), ("b", "B".into()), ("c", "C".into())]))
    );
    assert!(records.iter().all(|r| r.status == NodeExecutionStatus::Completed));
}

#[tokio::test]
async fn parallel_member_failure_waits_for_siblings() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("fork", "parallel"))
        .with_node(task("bad").with_config("fail", "bad branch"))
        .with_node(task("slow").with_config("sleep_ms", 100u32))
        .with_node(NodeSpec::new("join", "merge"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "fork")
        .link("fork", "bad")
        .link("fork", "slow")
        .link("bad", "join")
        .link("slow", "join")
        .link("join", "end");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Execution failed: bad branch"));
    assert_eq!(record(&records, "slow").status, NodeExecutionStatus::Completed);
    assert!(records.iter().all(|r| r.node_id != "join"));
}

#[tokio::test]
async fn loop_in_parallel_group_runs_alongside_siblings() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("fork", "parallel"))
        .with_node(task("a").with_config("sleep_ms", 300u32).with_config("output", "A"))
        .with_node(NodeSpec::new("each", "forEach").with_config("items", "${input.items}"))
        .with_node(task("work").with_config("sleep_ms", 300u32))
        .with_node(NodeSpec::new("join", "merge"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "fork")
        .link("fork", "a")
        .link("fork", "each")
        .link_port("each", "body", "work")
        .link("work", "each")
        .link("a", "join")
        .link_port("each", "done", "join")
        .link("join", "end");
    let id = h.publish_graph(graph).await;

    let items = Value::Array(vec![Value::from(1i64)]);
    let (run, records) = run_to_end(&h, id, object(&[("items", items)])).await;

    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.error);
    assert!(h.recorder.peak() >= 2, "peak concurrency was {}", h.recorder.peak());
    assert_eq!(record(&records, "work@0").status, NodeExecutionStatus::Completed);
    assert_eq!(record(&records, "a").output, Some(Value::from("A")));
}

#[tokio::test]
async fn for_each_walks_body_once_per_item() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("each", "forEach").with_config("items", "${input.items}"))
        .with_node(task("work").with_config("output", "${index}:${item}"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "each")
        .link_port("each", "body", "work")
        .link("work", "each")
        .link_port("each", "done", "end");
    let id = h.publish_graph(graph).await;

    let items = Value::Array(vec!["x".into(), "y".into(), "z".into()]);
    let (run, records) = run_to_end(&h, id, object(&[("items", items)])).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(record(&records, "work@0").output, Some(Value::from("0:x")));
    assert_eq!(record(&records, "work@2").output, Some(Value::from("2:z")));
    assert!(records.iter().all(|r| r.key() != "work@3"));
    assert_eq!(record(&records, "each").routed_ports, vec!["done"]);
    assert_eq!(run.output, Some(object(&[("count", Value::from(3u32))])));
}

#[tokio::test]
async fn nested_loops_walk_inner_body_per_outer_item() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("rows", "forEach").with_config("items", "${input.rows}"))
        .with_node(NodeSpec::new("cells", "forEach").with_config("items", "${item}"))
        .with_node(task("cell").with_config("output", "${item}"))
        .with_node(task("row_done"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "rows")
        .link_port("rows", "body", "cells")
        .link_port("cells", "body", "cell")
        .link("cell", "cells")
        .link_port("cells", "done", "row_done")
        .link("row_done", "rows")
        .link_port("rows", "done", "end");
    let id = h.publish_graph(graph).await;

    let rows = Value::Array(vec![
        Value::Array(vec![Value::from(1i64), Value::from(2i64)]),
        Value::Array(vec![Value::from(3i64)]),
    ]);
    let (run, records) = run_to_end(&h, id, object(&[("rows", rows)])).await;

    assert_eq!(run.status, RunStatus::Completed, "{:?}", run.error);
    for key in ["cell@0.0", "cell@0.1", "cell@1.0"] {
        assert_eq!(h.recorder.call_count(key), 1, "{} ran once", key);
    }
    assert_eq!(record(&records, "cell@1.0").output, Some(Value::from(3i64)));
    assert!(records.iter().all(|r| r.key() != "cell@1.1"));
    assert_eq!(
        record(&records, "row_done@0").output,
        Some(object(&[("count", Value::from(2u32))]))
    );
    assert_eq!(
        record(&records, "row_done@1").output,
        Some(object(&[("count", Value::from(1u32))]))
    );
    assert_eq!(run.output, Some(object(&[("count", Value::from(2u32))])));
}

#[tokio::test]
async fn while_loop_updates_variables_until_condition_fails() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("loop", "while").with_config("condition", "vars.n < 3"))
        .with_node(task("bump").with_config(
            "set",
            object(&[("n", Value::from("${vars.n + 1}"))]),
        ))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "loop")
        .link_port("loop", "body", "bump")
        .link("bump", "loop")
        .link_port("loop", "done", "end");
    let definition = WorkflowDefinition::new(TENANT, "counter", graph).with_variable("n", 0i64);
    let id = h.publish(definition).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.variables.get("n"), Some(&Value::from(3i64)));
    assert_eq!(record(&records, "bump@2").status, NodeExecutionStatus::Completed);
    assert!(records.iter().all(|r| r.key() != "bump@3"));
    // condition checked before each of the three passes and once more to stop
    assert_eq!(h.recorder.calls().iter().filter(|c| c.starts_with("loop")).count(), 4);
}

#[tokio::test]
async fn runaway_while_loop_hits_iteration_limit() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(
            NodeSpec::new("loop", "while")
                .with_config("condition", "true")
                .with_config("max_iterations", 5u32),
        )
        .with_node(task("spin"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "loop")
        .link_port("loop", "body", "spin")
        .link("spin", "loop")
        .link_port("loop", "done", "end");
    let id = h.publish_graph(graph).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("while loop exceeded 5 iterations"));
    assert_eq!(h.recorder.call_count("spin@4"), 1);
    assert_eq!(record(&records, "loop").status, NodeExecutionStatus::Failed);
}

fn slow_graph() -> Graph {
    Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("wait").with_config("sleep_ms", 10_000u32))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "wait")
        .link("wait", "end")
}

#[tokio::test]
async fn concurrency_limit_rejects_extra_runs_but_not_test_runs() {
    let h = harness();
    let definition = WorkflowDefinition::new(TENANT, "slow", slow_graph()).with_max_concurrent(1);
    let id = h.publish(definition).await;

    let first = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap();
    let err = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Run(RunError::ConcurrencyLimit { limit: 1, .. })
    ));
    assert_eq!(h.runtime.list_runs(TENANT).await.unwrap().len(), 1);

    let test_run = h.runtime.start(TENANT, id, Value::Null, true).await.unwrap();
    assert!(test_run.is_test);

    h.runtime.cancel(TENANT, first.id).await.unwrap();
    h.runtime.cancel(TENANT, test_run.id).await.unwrap();
    h.runtime.wait_for_completion(first.id).await.unwrap();

    // capacity is back once the first run is terminal
    let again = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap();
    h.runtime.cancel(TENANT, again.id).await.unwrap();
}

#[tokio::test]
async fn concurrent_starts_admit_exactly_the_limit() {
    let h = harness();
    let definition = WorkflowDefinition::new(TENANT, "slow", slow_graph()).with_max_concurrent(2);
    let id = h.publish(definition).await;

    let results = futures::future::join_all(
        (0..6).map(|_| h.runtime.start(TENANT, id, Value::Null, false)),
    )
    .await;

    let admitted: Vec<&WorkflowRun> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(admitted.len(), 2);
    assert!(results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
        e,
        FlowError::Run(RunError::ConcurrencyLimit { limit: 2, .. })
    )));
    assert_eq!(h.runtime.list_runs(TENANT).await.unwrap().len(), 2);

    for run in admitted {
        h.runtime.cancel(TENANT, run.id).await.unwrap();
    }
}

#[tokio::test]
async fn node_reporting_cancellation_on_its_own_fails_the_run() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("quit").with_config("give_up", true))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "quit")
        .link("quit", "end");
    let definition = WorkflowDefinition::new(TENANT, "quitter", graph).with_max_concurrent(1);
    let id = h.publish(definition).await;
    let mut events = h.runtime.subscribe_events();

    let run = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap();
    let announced = loop {
        if let ExecutionEvent::RunCompleted { run_id, status, .. } = events.recv().await.unwrap() {
            assert_eq!(run_id, run.id);
            break status;
        }
    };
    assert_eq!(announced, RunStatus::Failed);

    let run = h.runtime.wait_for_completion(run.id).await.unwrap();
    let records = h.runtime.node_executions(TENANT, run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Cancelled"));
    assert_eq!(record(&records, "quit").status, NodeExecutionStatus::Failed);
    assert_eq!(h.recorder.call_count("end"), 0);

    // the failed run no longer holds the only slot
    let again = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap();
    let again = h.runtime.wait_for_completion(again.id).await.unwrap();
    assert_eq!(again.status, RunStatus::Failed);
}

#[tokio::test]
async fn cancel_stops_run_and_is_rejected_once_terminal() {
    let h = harness();
    let id = h.publish_graph(slow_graph()).await;
    let mut events = h.runtime.subscribe_events();

    let run = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap();
    loop {
        if let ExecutionEvent::NodeStarted { node_id, .. } = events.recv().await.unwrap() {
            if node_id == "wait" {
                break;
            }
        }
    }

    let cancelled = h.runtime.cancel(TENANT, run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Cancelled);

    let finished = tokio::time::timeout(Duration::from_secs(5), h.runtime.wait_for_completion(run.id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(finished.status, RunStatus::Cancelled);

    let records = h.runtime.node_executions(TENANT, run.id).await.unwrap();
    assert_eq!(record(&records, "wait").status, NodeExecutionStatus::Cancelled);
    assert!(records.iter().all(|r| r.node_id != "end"));

    let err = h.runtime.cancel(TENANT, run.id).await.unwrap_err();
    match err {
        FlowError::Run(RunError::InvalidTransition { status, action, .. }) => {
            assert_eq!(status, RunStatus::Cancelled);
            assert_eq!(action, "cancel");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn retry_creates_new_run_only_from_failed() {
    let h = harness();
    let failing = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("risky").with_config("fail", "boom"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "risky")
        .link("risky", "end");
    let id = h.publish_graph(failing).await;

    let (failed, _) = run_to_end(&h, id, object(&[("attempt", 1i64.into())])).await;
    assert_eq!(failed.status, RunStatus::Failed);

    let retried = h.runtime.retry(TENANT, failed.id).await.unwrap();
    assert_ne!(retried.id, failed.id);
    assert_eq!(retried.retry_of, Some(failed.id));
    assert_eq!(retried.input, failed.input);
    let retried = h.runtime.wait_for_completion(retried.id).await.unwrap();
    assert_eq!(retried.status, RunStatus::Failed);

    // the original record is untouched
    let original = h.runtime.get_run(TENANT, failed.id).await.unwrap();
    assert_eq!(original.status, RunStatus::Failed);

    let ok_id = h.publish_graph(linear()).await;
    let (completed, _) = run_to_end(&h, ok_id, Value::Null).await;
    let err = h.runtime.retry(TENANT, completed.id).await.unwrap_err();
    assert!(matches!(
        err,
        FlowError::Run(RunError::InvalidTransition { ref action, .. }) if action == "retry"
    ));
}

#[tokio::test]
async fn start_time_errors_create_no_run() {
    let h = harness();

    let draft = WorkflowDefinition::new(TENANT, "draft", linear());
    h.runtime.save_definition(&draft).await.unwrap();
    let err = h.runtime.start(TENANT, draft.id, Value::Null, false).await.unwrap_err();
    assert!(matches!(err, FlowError::Run(RunError::DefinitionNotActive(_))));

    let mut empty = WorkflowDefinition::new(TENANT, "no graph", Graph::new()).activate();
    empty.graph = None;
    h.runtime.save_definition(&empty).await.unwrap();
    let err = h.runtime.start(TENANT, empty.id, Value::Null, false).await.unwrap_err();
    assert!(matches!(err, FlowError::Run(RunError::NoGraph(_))));

    let err = h.runtime.start("other-tenant", draft.id, Value::Null, true).await.unwrap_err();
    assert!(matches!(err, FlowError::Run(RunError::DefinitionNotFound(_))));

    assert!(h.runtime.list_runs(TENANT).await.unwrap().is_empty());

    // a draft still runs as a test run
    let run = h.runtime.start(TENANT, draft.id, Value::Null, true).await.unwrap();
    let run = h.runtime.wait_for_completion(run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn publish_reports_every_validation_error() {
    let h = harness();
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(NodeSpec::new("mystery", "teleport"))
        .with_node(task("orphan"))
        .link("start", "mystery");
    let definition = WorkflowDefinition::new(TENANT, "broken", graph);
    h.runtime.save_definition(&definition).await.unwrap();

    let err = h.runtime.publish(TENANT, definition.id).await.unwrap_err();
    let FlowError::Workflow(WorkflowError::Validation(report)) = err else {
        panic!("expected a validation error");
    };
    assert!(report.has_rule(rules::END_NODE));
    assert!(report.has_rule(rules::UNKNOWN_TYPE));
    assert!(report.has_rule(rules::UNREACHABLE));
    assert!(report.errors.len() >= 3);

    let err = h.runtime.start(TENANT, definition.id, Value::Null, false).await.unwrap_err();
    assert!(matches!(err, FlowError::Run(RunError::DefinitionNotActive(_))));
}

#[tokio::test]
async fn drafts_are_checked_and_compiled_without_publishing() {
    let h = harness();
    assert!(h.runtime.validate(&linear()).valid);
    assert!(!h.runtime.validate(&Graph::new().with_node(task("orphan"))).valid);

    let draft = WorkflowDefinition::new(TENANT, "draft", linear()).with_timeout(30);
    let plan = h.runtime.compile_plan(&draft).unwrap();
    assert_eq!(plan.step_ids(), vec!["start", "greet", "end"]);
    assert_eq!(plan.timeout_secs, Some(30));

    // nothing was stored
    let err = h.runtime.start(TENANT, draft.id, Value::Null, true).await.unwrap_err();
    assert!(matches!(err, FlowError::Run(RunError::DefinitionNotFound(_))));
}

#[tokio::test]
async fn run_deadline_fails_the_run() {
    let h = harness();
    let definition = WorkflowDefinition::new(TENANT, "slow", slow_graph()).with_timeout(1);
    let id = h.publish(definition).await;

    let (run, records) = run_to_end(&h, id, Value::Null).await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("Run exceeded its timeout of 1s"));
    assert!(run.deadline.is_some());
    assert_eq!(record(&records, "wait").status, NodeExecutionStatus::Failed);
}

#[tokio::test]
async fn resume_replays_completed_steps_without_dispatch() {
    let stores = Stores::memory();
    let h = harness_with(stores.clone(), RuntimeConfig::default());
    let graph = Graph::new()
        .with_node(NodeSpec::new("start", "start"))
        .with_node(task("charge").with_config("output", "fresh"))
        .with_node(task("receipt").with_config("output", "${nodes.charge}"))
        .with_node(NodeSpec::new("end", "end"))
        .link("start", "charge")
        .link("charge", "receipt")
        .link("receipt", "end");
    let id = h.publish_graph(graph).await;

    // a run interrupted after `charge` completed
    let mut run = WorkflowRun::new(TENANT, id, 1, Value::Null, false);
    run.transition(RunStatus::Running).unwrap();
    assert!(stores.runs.create_run(&run, None).await.unwrap());
    for (node, output) in [("start", Value::Null), ("charge", Value::from("stored"))] {
        let mut record = NodeExecution::new(run.id, node, Vec::new());
        record.transition(NodeExecutionStatus::Running).unwrap();
        record.output = Some(output);
        record.routed_ports = vec!["out".to_string()];
        record.attempt = 1;
        record.transition(NodeExecutionStatus::Completed).unwrap();
        stores.runs.save_node_execution(&record).await.unwrap();
    }

    assert_eq!(h.runtime.resume_incomplete().await.unwrap(), 1);
    let finished = h.runtime.wait_for_completion(run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Completed);
    assert_eq!(finished.output, Some(Value::from("stored")));
    assert_eq!(h.recorder.calls(), vec!["receipt", "end"]);
}

#[tokio::test]
async fn events_trace_the_run() {
    let h = harness();
    let id = h.publish_graph(linear()).await;
    let mut events = h.runtime.subscribe_events();

    let run = h.runtime.start(TENANT, id, Value::Null, false).await.unwrap();
    let mut seen = Vec::new();
    loop {
        let event = events.recv().await.unwrap();
        let done = matches!(event, ExecutionEvent::RunCompleted { .. });
        seen.push(event);
        if done {
            break;
        }
    }

    assert!(matches!(seen.first(), Some(ExecutionEvent::RunStarted { run_id, .. }) if *run_id == run.id));
    let completed: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            ExecutionEvent::NodeCompleted { node_id, .. } => Some(node_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec!["start", "greet", "end"]);
    assert!(matches!(
        seen.last(),
        Some(ExecutionEvent::RunCompleted { status: RunStatus::Completed, .. })
    ));
}
