//! The execution graph: attaches nodes with their direct dependencies and
//! computes Kahn-style topological layers restricted to a target's ancestor
//! subgraph (`spec.md` §5.E).
//!
//! Backed by `petgraph::graphmap::DiGraphMap`, the same node-keyed adjacency
//! idiom `scarb`'s `Resolve` graph uses for its package dependency graph —
//! ancestor sets are walked on demand via `neighbors_directed` rather than
//! cached, since every query here needs a target-specific subgraph anyway.

use std::collections::{HashMap, HashSet};

use petgraph::{Direction, graphmap::DiGraphMap};

use crate::{
    error::EngineError,
    value::{ExecutableId, ExecutionNode},
};

/// A frozen-once-built DAG of [`ExecutionNode`]s.
///
/// Equality of two layer sequences compares each layer as a set (`spec.md`
/// §5.E): this type does not implement `Eq` itself, callers compare
/// `layers()` output with `HashSet` comparisons per layer.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    /// Edge `dep -> node` means `dep` must complete before `node` starts.
    graph: DiGraphMap<ExecutableId, ()>,
    nodes: HashMap<ExecutableId, ExecutionNode>,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent insert of `node` with its direct dependencies.
    pub fn attach(&mut self, node: ExecutionNode, direct_deps: impl IntoIterator<Item = ExecutableId>) {
        let id = node.executable_id;
        self.graph.add_node(id);
        self.nodes.entry(id).or_insert(node);
        for dep in direct_deps {
            self.graph.add_node(dep);
            self.graph.add_edge(dep, id, ());
        }
    }

    /// Structural lookup by a node's identifier (`spec.md` §5.G).
    pub fn find(&self, identifier: &str) -> Option<&ExecutionNode> {
        self.nodes.values().find(|node| node.identifier() == identifier)
    }

    pub fn node(&self, id: ExecutableId) -> Option<&ExecutionNode> {
        self.nodes.get(&id)
    }

    /// Every ancestor of `target` (not including `target` itself).
    fn ancestors(&self, target: ExecutableId) -> HashSet<ExecutableId> {
        let mut seen = HashSet::new();
        let mut stack = vec![target];
        while let Some(id) = stack.pop() {
            for parent in self.graph.neighbors_directed(id, Direction::Incoming) {
                if seen.insert(parent) {
                    stack.push(parent);
                }
            }
        }
        seen
    }

    /// Kahn-style topological layers restricted to `target`'s ancestor
    /// subgraph. Fails with `Cycle` if not every node in the subgraph could
    /// be emitted.
    pub fn layers(&self, target: ExecutableId) -> Result<Vec<Vec<ExecutableId>>, EngineError> {
        let mut subgraph = self.ancestors(target);
        subgraph.insert(target);

        let mut remaining: HashMap<ExecutableId, usize> = subgraph
            .iter()
            .map(|&id| {
                let degree = self
                    .graph
                    .neighbors_directed(id, Direction::Incoming)
                    .filter(|parent| subgraph.contains(parent))
                    .count();
                (id, degree)
            })
            .collect();

        let mut layers = Vec::new();
        let mut emitted = 0;
        loop {
            let mut layer: Vec<ExecutableId> =
                remaining.iter().filter(|(_, &degree)| degree == 0).map(|(&id, _)| id).collect();
            if layer.is_empty() {
                break;
            }
            layer.sort();
            for id in &layer {
                remaining.remove(id);
            }
            for id in &layer {
                for child in self.graph.neighbors_directed(*id, Direction::Outgoing) {
                    if let Some(degree) = remaining.get_mut(&child) {
                        *degree -= 1;
                    }
                }
            }
            emitted += layer.len();
            layers.push(layer);
        }

        if emitted != subgraph.len() {
            return Err(EngineError::Cycle { emitted, total: subgraph.len() });
        }
        Ok(layers)
    }

    /// Diagnostic Mermaid rendering. Node ids and edge ordering are stable
    /// (sorted by hex id) so output is reproducible across runs of the same
    /// graph; this is not meant to be visually pretty, only deterministic.
    pub fn to_mermaid(&self) -> String {
        let mut node_ids: Vec<ExecutableId> = self.nodes.keys().copied().collect();
        node_ids.sort();

        let mut lines = vec!["graph TD".to_string()];
        for id in &node_ids {
            let label = self.nodes[id].identifier();
            lines.push(format!("    {}[\"{label}\"]", id.as_hex()));
        }

        let mut edges: Vec<(ExecutableId, ExecutableId)> = self.graph.all_edges().map(|(from, to, ())| (from, to)).collect();
        edges.sort();
        for (from, to) in edges {
            lines.push(format!("    {} --> {}", from.as_hex(), to.as_hex()));
        }

        lines.join("\n")
    }
}
