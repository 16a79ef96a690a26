//! Index-based view of a graph shared by the validator and the compiler.
//!
//! Node indices follow declaration order, which doubles as the tie-break for
//! the topological sort. An edge is a loop-back edge when a depth-first walk
//! from the start nodes finds it pointing at a loop-type node that is still on
//! the walk's stack; such edges are kept for reachability but left out of the
//! dependency relation.

use flowcore::{node_types, Graph, NodeId};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{depth_first_search, Bfs, DfsEvent, EdgeRef};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};

#[derive(Debug, Clone)]
pub struct TopoNode {
    pub id: NodeId,
    pub node_type: String,
}

#[derive(Debug, Clone)]
pub struct TopoEdge {
    /// Index into the graph's connection list
    pub connection: usize,
    pub source_port: String,
    pub loop_back: bool,
}

pub struct GraphTopology {
    graph: DiGraph<TopoNode, TopoEdge>,
    index: HashMap<NodeId, NodeIndex>,
}

impl GraphTopology {
    /// Dangling and self connections are left out; the validator reports them.
    /// Duplicate node ids keep their first declaration.
    pub fn build(source: &Graph) -> Self {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();

        for node in &source.nodes {
            if index.contains_key(&node.id) {
                continue;
            }
            let idx = graph.add_node(TopoNode {
                id: node.id.clone(),
                node_type: node.node_type.clone(),
            });
            index.insert(node.id.clone(), idx);
        }

        for (i, conn) in source.connections.iter().enumerate() {
            let (Some(&from), Some(&to)) = (index.get(&conn.source), index.get(&conn.target)) else {
                continue;
            };
            if from == to {
                continue;
            }
            graph.add_edge(
                from,
                to,
                TopoEdge {
                    connection: i,
                    source_port: conn.source_port.clone(),
                    loop_back: false,
                },
            );
        }

        // start nodes first, then anything the walk has not reached
        let roots: Vec<NodeIndex> = graph
            .node_indices()
            .filter(|&idx| node_types::is_start(&graph[idx].node_type))
            .chain(graph.node_indices())
            .collect();
        let mut back_pairs = HashSet::new();
        depth_first_search(&graph, roots, |event| {
            if let DfsEvent::BackEdge(from, to) = event {
                if node_types::is_loop(&graph[to].node_type) {
                    back_pairs.insert((from, to));
                }
            }
        });
        let back_edges: Vec<_> = graph
            .edge_references()
            .filter(|edge| back_pairs.contains(&(edge.source(), edge.target())))
            .map(|edge| edge.id())
            .collect();
        for edge in back_edges {
            graph[edge].loop_back = true;
        }

        Self { graph, index }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn node(&self, idx: NodeIndex) -> &TopoNode {
        &self.graph[idx]
    }

    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn of_type<'a>(&'a self, node_type: &'a str) -> impl Iterator<Item = NodeIndex> + 'a {
        self.graph
            .node_indices()
            .filter(move |&idx| self.graph[idx].node_type == node_type)
    }

    /// Nodes reachable from `start` over every edge, loop-backs included
    pub fn reachable_from(&self, start: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut bfs = Bfs::new(&self.graph, start);
        while let Some(idx) = bfs.next(&self.graph) {
            seen.insert(idx);
        }
        seen
    }

    /// Forward (non loop-back) edges leaving `idx`: (source port, target)
    pub fn forward_edges(&self, idx: NodeIndex) -> Vec<(&str, NodeIndex)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|edge| !edge.weight().loop_back)
            .map(|edge| (edge.weight().connection, edge.weight().source_port.as_str(), edge.target()))
            .collect();
        edges.sort_by_key(|(connection, _, _)| *connection);
        edges.into_iter().map(|(_, port, target)| (port, target)).collect()
    }

    /// Forward edges arriving at `idx`: (source, source port)
    pub fn forward_incoming(&self, idx: NodeIndex) -> Vec<(NodeIndex, &str)> {
        let mut edges: Vec<_> = self
            .graph
            .edges_directed(idx, Direction::Incoming)
            .filter(|edge| !edge.weight().loop_back)
            .map(|edge| (edge.weight().connection, edge.source(), edge.weight().source_port.as_str()))
            .collect();
        edges.sort_by_key(|(connection, _, _)| *connection);
        edges.into_iter().map(|(_, source, port)| (source, port)).collect()
    }

    /// Ids this node waits on: sources of its incoming forward edges
    pub fn dependencies(&self, idx: NodeIndex) -> BTreeSet<NodeId> {
        self.forward_incoming(idx)
            .into_iter()
            .map(|(source, _)| self.graph[source].id.clone())
            .collect()
    }

    pub fn is_loop_back(&self, connection: usize) -> bool {
        self.graph
            .edge_references()
            .any(|edge| edge.weight().connection == connection && edge.weight().loop_back)
    }

    /// Kahn's algorithm over forward edges. Among nodes whose in-degree drops
    /// to zero together, the earliest declared goes first.
    ///
    /// On a cycle, returns the ids that could not be ordered.
    pub fn topological_order(&self) -> Result<Vec<NodeIndex>, Vec<NodeId>> {
        let mut in_degree: Vec<usize> = vec![0; self.graph.node_count()];
        for edge in self.graph.edge_references() {
            if !edge.weight().loop_back {
                in_degree[edge.target().index()] += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());
        while let Some(Reverse(i)) = ready.pop() {
            let idx = NodeIndex::new(i);
            order.push(idx);
            for (_, target) in self.forward_edges(idx) {
                let degree = &mut in_degree[target.index()];
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse(target.index()));
                }
            }
        }

        if order.len() == self.graph.node_count() {
            Ok(order)
        } else {
            let placed: HashSet<_> = order.into_iter().collect();
            Err(self
                .graph
                .node_indices()
                .filter(|idx| !placed.contains(idx))
                .map(|idx| self.graph[idx].id.clone())
                .collect())
        }
    }
}
