//! Dependency graph over every task the queue knows about.
//!
//! Edges may point at ids that are not enqueued yet (forward references);
//! those ids become nodes with no dependencies of their own, so a task
//! enqueued later that closes the loop is still caught.

use ratchet_common::ValidationError;
use std::collections::HashMap;

/// Index into the node list.
type NodeIndex = usize;

#[derive(Debug, Default)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index_map: HashMap<String, NodeIndex>,
    /// node -> nodes it depends on
    dependencies: Vec<Vec<NodeIndex>>,
    /// node -> nodes that depend on it
    dependents: Vec<Vec<NodeIndex>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from `(task id, dependency ids)` pairs.
    pub fn from_edges<I>(edges: I) -> Self
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let mut graph = Self::new();
        for (id, deps) in edges {
            graph.add(&id, &deps);
        }
        graph
    }

    /// Add a task and its dependency edges.
    pub fn add(&mut self, id: &str, deps: &[String]) {
        let to = self.intern(id);
        for dep in deps {
            let from = self.intern(dep);
            if !self.dependencies[to].contains(&from) {
                self.dependencies[to].push(from);
                self.dependents[from].push(to);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    fn intern(&mut self, id: &str) -> NodeIndex {
        if let Some(&i) = self.index_map.get(id) {
            return i;
        }
        let i = self.ids.len();
        self.ids.push(id.to_string());
        self.index_map.insert(id.to_string(), i);
        self.dependencies.push(Vec::new());
        self.dependents.push(Vec::new());
        i
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    pub fn validate_acyclic(&self) -> Result<(), ValidationError> {
        let remaining = self.unsorted_nodes();
        if remaining.is_empty() {
            return Ok(());
        }
        Err(ValidationError::Cycle {
            path: self.extract_cycle(&remaining),
        })
    }

    /// Nodes Kahn's algorithm could not order; non-empty iff there is a cycle.
    fn unsorted_nodes(&self) -> Vec<bool> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut queue: Vec<NodeIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();
        let mut processed = vec![false; self.len()];

        while let Some(node) = queue.pop() {
            processed[node] = true;
            for &dependent in &self.dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed.iter().all(|&p| p) {
            Vec::new()
        } else {
            processed.into_iter().map(|p| !p).collect()
        }
    }

    /// Walk dependency edges inside the unsorted set until a node repeats.
    ///
    /// Every unsorted node has at least one unsorted dependency, so the walk
    /// always closes a loop.
    fn extract_cycle(&self, unsorted: &[bool]) -> Vec<String> {
        let Some(start) = unsorted.iter().position(|&u| u) else {
            return Vec::new();
        };
        let mut path: Vec<NodeIndex> = vec![start];
        let mut seen_at: HashMap<NodeIndex, usize> = HashMap::from([(start, 0)]);
        let mut current = start;
        loop {
            let Some(&next) = self.dependencies[current].iter().find(|&&d| unsorted[d]) else {
                break;
            };
            if let Some(&pos) = seen_at.get(&next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[next].clone());
                return cycle;
            }
            seen_at.insert(next, path.len());
            path.push(next);
            current = next;
        }
        path.into_iter().map(|i| self.ids[i].clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edges(list: &[(&str, &[&str])]) -> DependencyGraph {
        DependencyGraph::from_edges(list.iter().map(|(id, deps)| {
            (
                id.to_string(),
                deps.iter().map(|d| d.to_string()).collect::<Vec<_>>(),
            )
        }))
    }

    #[test]
    fn test_empty_graph_is_acyclic() {
        assert!(DependencyGraph::new().validate_acyclic().is_ok());
    }

    #[test]
    fn test_diamond_is_acyclic() {
        let graph = edges(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ]);
        assert_eq!(graph.len(), 4);
        assert!(graph.validate_acyclic().is_ok());
    }

    #[test]
    fn test_two_node_cycle_reports_path() {
        let graph = edges(&[("a", &["b"]), ("b", &["a"])]);
        match graph.validate_acyclic() {
            Err(ValidationError::Cycle { path }) => {
                assert_eq!(path.len(), 3);
                assert_eq!(path.first(), path.last());
            }
            other => panic!("Expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_through_forward_reference() {
        // x is referenced before it exists, then arrives closing the loop.
        let mut graph = edges(&[("a", &["x"]), ("b", &["a"])]);
        assert!(graph.contains("x"));
        assert!(graph.validate_acyclic().is_ok());
        graph.add("x", &["b".to_string()]);
        assert!(matches!(
            graph.validate_acyclic(),
            Err(ValidationError::Cycle { .. })
        ));
    }

    #[test]
    fn test_node_downstream_of_cycle_still_finds_cycle() {
        let graph = edges(&[("z", &["a"]), ("a", &["b"]), ("b", &["c"]), ("c", &["a"])]);
        let Err(ValidationError::Cycle { path }) = graph.validate_acyclic() else {
            panic!("Expected cycle");
        };
        assert!(!path.contains(&"z".to_string()));
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 4);
    }

    #[test]
    fn test_duplicate_edges_are_collapsed() {
        let graph = edges(&[("a", &[]), ("b", &["a", "a"])]);
        assert!(graph.validate_acyclic().is_ok());
    }
}
