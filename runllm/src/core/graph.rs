//! Dependency arena with index-based edges.
//!
//! Programs are nodes keyed by their canonical path; `uses` entries are edges
//! labelled with the parent's local dependency name. Nodes never hold
//! references to each other, so a cyclic composition cannot form a cycle in
//! memory.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub name: String,
    pub target: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub path: PathBuf,
    /// Outgoing edges in declaration order.
    pub edges: Vec<Edge>,
}

/// Back edge found while walking the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    /// Paths from the first repeated node back to itself.
    pub path: Vec<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<PathBuf, NodeId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the node for `path`, creating it if needed. The flag is true
    /// when the node was created by this call.
    pub fn insert(&mut self, path: &Path) -> (NodeId, bool) {
        if let Some(&id) = self.index.get(path) {
            return (id, false);
        }
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            path: path.to_path_buf(),
            edges: Vec::new(),
        });
        self.index.insert(path.to_path_buf(), id);
        (id, true)
    }

    pub fn add_edge(&mut self, from: NodeId, name: &str, to: NodeId) {
        self.nodes[from].edges.push(Edge {
            name: name.to_string(),
            target: to,
        });
    }

    pub fn node(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id]
    }

    pub fn id_of(&self, path: &Path) -> Option<NodeId> {
        self.index.get(path).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Children-first order of every node reachable from `root`.
    ///
    /// Walks depth-first with a "currently resolving" stack; reaching a node
    /// that is still on the stack is a cycle.
    pub fn topological_order(&self, root: NodeId) -> Result<Vec<NodeId>, Cycle> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut done = HashSet::new();
        let mut resolving = Vec::new();
        self.visit(root, &mut resolving, &mut done, &mut order)?;
        Ok(order)
    }

    fn visit(
        &self,
        id: NodeId,
        resolving: &mut Vec<NodeId>,
        done: &mut HashSet<NodeId>,
        order: &mut Vec<NodeId>,
    ) -> Result<(), Cycle> {
        if done.contains(&id) {
            return Ok(());
        }
        if let Some(start) = resolving.iter().position(|&open| open == id) {
            let mut path: Vec<PathBuf> = resolving[start..]
                .iter()
                .map(|&open| self.nodes[open].path.clone())
                .collect();
            path.push(self.nodes[id].path.clone());
            return Err(Cycle { path });
        }
        resolving.push(id);
        for edge in &self.nodes[id].edges {
            self.visit(edge.target, resolving, done, order)?;
        }
        resolving.pop();
        done.insert(id);
        order.push(id);
        Ok(())
    }
}

/// Sibling ordering problem inside one parent's `uses` list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiblingCycle {
    pub names: Vec<String>,
}

/// Group siblings into waves that can run concurrently.
///
/// `siblings` lists each dependency name with the sibling names its input
/// bindings read. Every wave only depends on earlier waves; within a wave,
/// declaration order is kept. References to unknown names are ignored.
pub fn waves(siblings: &[(String, Vec<String>)]) -> Result<Vec<Vec<usize>>, SiblingCycle> {
    let position: HashMap<&str, usize> = siblings
        .iter()
        .enumerate()
        .map(|(i, (name, _))| (name.as_str(), i))
        .collect();

    let mut pending: Vec<HashSet<usize>> = siblings
        .iter()
        .map(|(_, reads)| {
            reads
                .iter()
                .filter_map(|name| position.get(name.as_str()).copied())
                .collect()
        })
        .collect();

    let mut placed = vec![false; siblings.len()];
    let mut out = Vec::new();
    while placed.iter().any(|p| !p) {
        let wave: Vec<usize> = (0..siblings.len())
            .filter(|&i| !placed[i] && pending[i].is_empty())
            .collect();
        if wave.is_empty() {
            let names = (0..siblings.len())
                .filter(|&i| !placed[i])
                .map(|i| siblings[i].0.clone())
                .collect();
            return Err(SiblingCycle { names });
        }
        for &i in &wave {
            placed[i] = true;
        }
        for deps in &mut pending {
            for i in &wave {
                deps.remove(i);
            }
        }
        out.push(wave);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for (from, to) in edges {
            let (from_id, _) = graph.insert(Path::new(from));
            let (to_id, _) = graph.insert(Path::new(to));
            graph.add_edge(from_id, to, to_id);
        }
        graph
    }

    fn id(graph: &DependencyGraph, name: &str) -> NodeId {
        graph.id_of(Path::new(name)).expect("node")
    }

    #[test]
    fn order_places_children_before_parents() {
        let graph = graph(&[("root", "a"), ("root", "b"), ("a", "c"), ("b", "c")]);
        let order = graph.topological_order(id(&graph, "root")).expect("acyclic");
        assert_eq!(order.len(), 4);
        let pos = |name: &str| order.iter().position(|&n| n == id(&graph, name)).expect("pos");
        for node in 0..graph.len() {
            for edge in &graph.node(node).edges {
                let child = order.iter().position(|&n| n == edge.target).expect("child");
                let parent = order.iter().position(|&n| n == node).expect("parent");
                assert!(child < parent);
            }
        }
        assert_eq!(pos("root"), 3);
    }

    #[test]
    fn cycle_detected_from_every_start() {
        let graph = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("c", "d")]);
        for start in ["a", "b", "c"] {
            let err = graph
                .topological_order(id(&graph, start))
                .expect_err("cycle expected");
            assert_eq!(err.path.first(), err.path.last());
            assert_eq!(err.path.len(), 4);
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let graph = graph(&[("a", "a")]);
        let err = graph.topological_order(0).expect_err("self cycle");
        assert_eq!(err.path, vec![PathBuf::from("a"), PathBuf::from("a")]);
    }

    #[test]
    fn shared_child_is_not_a_cycle() {
        let graph = graph(&[("root", "x"), ("root", "y"), ("y", "x")]);
        let order = graph.topological_order(id(&graph, "root")).expect("diamond");
        assert_eq!(order, vec![id(&graph, "x"), id(&graph, "y"), id(&graph, "root")]);
    }

    #[test]
    fn waves_respect_sibling_reads() {
        let siblings = vec![
            ("late".to_string(), vec!["first".to_string()]),
            ("first".to_string(), vec![]),
            ("free".to_string(), vec!["unknown".to_string()]),
        ];
        assert_eq!(waves(&siblings).expect("waves"), vec![vec![1, 2], vec![0]]);
    }

    #[test]
    fn waves_reject_sibling_cycle() {
        let siblings = vec![
            ("a".to_string(), vec!["b".to_string()]),
            ("b".to_string(), vec!["a".to_string()]),
            ("c".to_string(), vec![]),
        ];
        let err = waves(&siblings).expect_err("cycle");
        assert_eq!(err.names, vec!["a".to_string(), "b".to_string()]);
    }
}
