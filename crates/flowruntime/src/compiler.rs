//! Graph compiler: turns a validated graph into an ordered, tagged plan.
//!
//! Compilation is a pure function of its inputs. Recompiling the same graph
//! yields the same step sequence and the same tags, which is what lets the
//! engine rebuild a plan on resume instead of persisting it per run.

use crate::topology::GraphTopology;
use flowcore::{
    node_types, ports, DefinitionId, ExecutionPlan, ExecutionStep, FlowError, Graph, RunError,
    WorkflowDefinition, WorkflowError,
};
use petgraph::graph::NodeIndex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Compile a graph into an execution plan. Fails on an empty graph or a
/// cycle that does not close through a loop node; no partial plan is returned.
pub fn compile(
    definition_id: DefinitionId,
    version: u32,
    graph: &Graph,
    timeout_secs: Option<u64>,
) -> Result<ExecutionPlan, WorkflowError> {
    if graph.is_empty() {
        return Err(WorkflowError::EmptyGraph);
    }

    let topology = GraphTopology::build(graph);
    let order = topology
        .topological_order()
        .map_err(|nodes| WorkflowError::CyclicDependency { nodes })?;

    let mut steps = Vec::with_capacity(order.len());
    for &idx in &order {
        let id = &topology.node(idx).id;
        let spec = graph
            .find_node(id)
            .ok_or_else(|| WorkflowError::NodeNotFound(id.clone()))?;
        steps.push(ExecutionStep {
            node_id: spec.id.clone(),
            node_type: spec.node_type.clone(),
            config: spec.config.clone(),
            dependencies: topology.dependencies(idx),
            parallel_group: None,
            loop_parent: None,
            branch_key: None,
            retry_policy: spec.retry_policy.clone(),
        });
    }

    let position: HashMap<NodeIndex, usize> =
        order.iter().enumerate().map(|(pos, &idx)| (idx, pos)).collect();

    tag_parallel_groups(&topology, &order, &position, &mut steps);
    tag_loop_bodies(&topology, &order, &position, &mut steps);
    tag_branches(&topology, &order, &position, &mut steps);

    let connections = graph
        .connections
        .iter()
        .filter(|c| c.source != c.target)
        .filter(|c| topology.index_of(&c.source).is_some() && topology.index_of(&c.target).is_some())
        .cloned()
        .collect();

    tracing::debug!(
        definition_id = %definition_id,
        version,
        steps = steps.len(),
        "Compiled execution plan"
    );

    Ok(ExecutionPlan {
        definition_id,
        version,
        steps,
        variables: BTreeMap::new(),
        timeout_secs,
        connections,
    })
}

/// Compile a stored definition, carrying its initial variables
pub fn compile_definition(definition: &WorkflowDefinition) -> Result<ExecutionPlan, FlowError> {
    let graph = definition
        .graph
        .as_ref()
        .ok_or(RunError::NoGraph(definition.id))?;
    let mut plan = compile(definition.id, definition.version, graph, definition.timeout_secs)?;
    plan.variables = definition.variables.clone();
    Ok(plan)
}

/// Each parallel node opens a region that closes at the first merge node
/// reached on every forward path. Nodes already claimed by an earlier region
/// keep their tag.
fn tag_parallel_groups(
    topology: &GraphTopology,
    order: &[NodeIndex],
    position: &HashMap<NodeIndex, usize>,
    steps: &mut [ExecutionStep],
) {
    for &parallel in order {
        if topology.node(parallel).node_type != node_types::PARALLEL {
            continue;
        }

        let mut members = vec![parallel];
        let mut merges = Vec::new();
        let mut seen = HashSet::from([parallel]);
        let mut queue: VecDeque<NodeIndex> = VecDeque::from([parallel]);

        while let Some(current) = queue.pop_front() {
            for (_, next) in topology.forward_edges(current) {
                if !seen.insert(next) {
                    continue;
                }
                if topology.node(next).node_type == node_types::MERGE {
                    merges.push(next);
                } else {
                    members.push(next);
                    queue.push_back(next);
                }
            }
        }

        if merges.is_empty() {
            tracing::warn!(
                node_id = %topology.node(parallel).id,
                "Parallel node never reaches a merge; its branches run sequentially"
            );
            continue;
        }

        let group = format!("pg:{}", topology.node(parallel).id);
        for idx in members.into_iter().chain(merges) {
            let step = &mut steps[position[&idx]];
            if step.parallel_group.is_none() {
                step.parallel_group = Some(group.clone());
            }
        }
    }
}

/// Tag everything reached through a loop's `body` port, up to the loop node
/// itself or the region its exit ports lead to. Loops are visited in plan
/// order so an inner loop's tag overwrites the enclosing one.
fn tag_loop_bodies(
    topology: &GraphTopology,
    order: &[NodeIndex],
    position: &HashMap<NodeIndex, usize>,
    steps: &mut [ExecutionStep],
) {
    let mut visited_loops = HashSet::new();

    for &loop_idx in order {
        if !node_types::is_loop(&topology.node(loop_idx).node_type) {
            continue;
        }
        visited_loops.insert(loop_idx);

        let (body_entries, exit_entries): (Vec<_>, Vec<_>) = topology
            .forward_edges(loop_idx)
            .into_iter()
            .partition(|(port, _)| *port == ports::BODY);

        let stop: HashSet<NodeIndex> = visited_loops.iter().copied().collect();
        let exits = forward_closure(
            topology,
            exit_entries.into_iter().map(|(_, idx)| idx),
            &stop,
        );

        let mut blocked = stop;
        blocked.extend(exits);
        let body = forward_closure(
            topology,
            body_entries.into_iter().map(|(_, idx)| idx),
            &blocked,
        );

        let loop_id = topology.node(loop_idx).id.clone();
        for idx in body {
            steps[position[&idx]].loop_parent = Some(loop_id.clone());
        }
    }
}

fn forward_closure(
    topology: &GraphTopology,
    entries: impl IntoIterator<Item = NodeIndex>,
    blocked: &HashSet<NodeIndex>,
) -> HashSet<NodeIndex> {
    let mut seen = HashSet::new();
    let mut queue: VecDeque<NodeIndex> = entries
        .into_iter()
        .filter(|idx| !blocked.contains(idx))
        .collect();
    while let Some(current) = queue.pop_front() {
        if !seen.insert(current) {
            continue;
        }
        for (_, next) in topology.forward_edges(current) {
            if !blocked.contains(&next) && !seen.contains(&next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

/// A node fed only by one named port of a decision node is tagged with that
/// port. Joins fed from several ports or other nodes stay untagged and are
/// resolved by edge liveness at run time.
fn tag_branches(
    topology: &GraphTopology,
    order: &[NodeIndex],
    position: &HashMap<NodeIndex, usize>,
    steps: &mut [ExecutionStep],
) {
    for &decision in order {
        if !node_types::is_decision(&topology.node(decision).node_type) {
            continue;
        }
        for (port, target) in topology.forward_edges(decision) {
            if port == ports::OUT || port == ports::ERROR {
                continue;
            }
            let single_source = topology
                .forward_incoming(target)
                .iter()
                .all(|&(source, source_port)| source == decision && source_port == port);
            if single_source {
                steps[position[&target]].branch_key =
                    Some(format!("{}:{}", topology.node(decision).id, port));
            }
        }
    }
}
