// apps/kernel-server/src/dag.rs
// Purpose: DAG data structure with idempotent mutation and cycle protection.
// Architecture: Core Data Structure
// Dependencies: std, thiserror

use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DAGError {
    #[error("cycle detected in DAG")]
    CycleDetected,
    #[error("invalid node: {0}")]
    InvalidNode(String),
    #[error("dependency not found: {0}")]
    DependencyNotFound(String),
    #[error("edge not found: {0} -> {1}")]
    EdgeNotFound(String, String),
}

#[derive(Clone, Debug, Default)]
pub struct DAG {
    nodes: HashSet<String>,
    edges: HashMap<String, Vec<String>>, // adjacency list: source -> [targets]
}

impl DAG {
    pub fn new() -> Self {
        DAG {
            nodes: HashSet::new(),
            edges: HashMap::new(),
        }
    }

    /// Idempotent: inserting an already-known node is a no-op success.
    pub fn add_node(&mut self, node_id: String) -> Result<(), DAGError> {
        self.nodes.insert(node_id);
        Ok(())
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains(node_id)
    }

    /// Idempotent: re-adding an existing edge returns Ok without mutating.
    /// Rejects (without mutating) if either endpoint is missing or the edge
    /// would create a cycle.
    pub fn add_edge(&mut self, from: String, to: String) -> Result<(), DAGError> {
        if !self.nodes.contains(&from) {
            return Err(DAGError::InvalidNode(from));
        }
        if !self.nodes.contains(&to) {
            return Err(DAGError::InvalidNode(to));
        }

        if let Some(targets) = self.edges.get(&from) {
            if targets.contains(&to) {
                return Ok(());
            }
        }

        if from == to || self.would_create_cycle(&from, &to) {
            return Err(DAGError::CycleDetected);
        }

        self.edges.entry(from).or_insert_with(Vec::new).push(to);
        Ok(())
    }

    pub fn remove_edge(&mut self, from: &str, to: &str) -> Result<(), DAGError> {
        if let Some(targets) = self.edges.get_mut(from) {
            if let Some(pos) = targets.iter().position(|x| x == to) {
                targets.remove(pos);
                return Ok(());
            }
        }
        Err(DAGError::EdgeNotFound(from.to_string(), to.to_string()))
    }

    /// Removes every edge whose target is `id`. Used when a pending node is
    /// re-defined by delegation so its dependencies can be rewritten
    /// atomically.
    pub fn clear_incoming_edges(&mut self, id: &str) {
        for targets in self.edges.values_mut() {
            targets.retain(|t| t != id);
        }
    }

    /// Removes a node along with every edge that touches it, incoming or
    /// outgoing.
    pub fn remove_node(&mut self, node_id: &str) -> Result<(), DAGError> {
        if !self.nodes.remove(node_id) {
            return Err(DAGError::InvalidNode(node_id.to_string()));
        }
        self.edges.remove(node_id);
        for targets in self.edges.values_mut() {
            targets.retain(|t| t != node_id);
        }
        Ok(())
    }

    pub fn get_children(&self, node_id: &str) -> Vec<String> {
        self.edges.get(node_id).cloned().unwrap_or_default()
    }

    /// Alias kept for readability at call sites that think in terms of
    /// "dependents" rather than DAG-adjacency "children".
    pub fn get_dependents(&self, node_id: &str) -> Vec<String> {
        self.get_children(node_id)
    }

    fn would_create_cycle(&self, from: &str, to: &str) -> bool {
        let mut visited = HashSet::new();
        self.has_path_dfs(to, from, &mut visited)
    }

    fn has_path_dfs(&self, current: &str, target: &str, visited: &mut HashSet<String>) -> bool {
        if current == target {
            return true;
        }
        if visited.contains(current) {
            return false;
        }
        visited.insert(current.to_string());

        if let Some(neighbors) = self.edges.get(current) {
            for neighbor in neighbors {
                if self.has_path_dfs(neighbor, target, visited) {
                    return true;
                }
            }
        }
        false
    }

    /// Kahn's algorithm. Fails with CycleDetected if the emitted order is
    /// shorter than the node set.
    pub fn topological_sort(&self) -> Result<Vec<String>, DAGError> {
        let mut in_degree: HashMap<String, usize> =
            self.nodes.iter().map(|n| (n.clone(), 0)).collect();

        for neighbors in self.edges.values() {
            for neighbor in neighbors {
                if let Some(d) = in_degree.get_mut(neighbor) {
                    *d += 1;
                }
            }
        }

        let mut queue: VecDeque<String> = in_degree
            .iter()
            .filter(|(_, &degree)| degree == 0)
            .map(|(node, _)| node.clone())
            .collect();
        queue.make_contiguous().sort();

        let mut result = Vec::new();

        while let Some(node) = queue.pop_front() {
            result.push(node.clone());

            if let Some(neighbors) = self.edges.get(&node) {
                for neighbor in neighbors {
                    if let Some(degree) = in_degree.get_mut(neighbor) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(neighbor.clone());
                        }
                    }
                }
            }
        }

        if result.len() != self.nodes.len() {
            return Err(DAGError::CycleDetected);
        }

        Ok(result)
    }

    /// Reverse lookup: linear in edge count, acceptable for graph sizes in
    /// this problem (no materialized back-edge map; see DESIGN NOTES).
    pub fn get_dependencies(&self, node_id: &str) -> Vec<String> {
        let mut deps = Vec::new();
        for (source, targets) in &self.edges {
            if targets.contains(&node_id.to_string()) {
                deps.push(source.clone());
            }
        }
        deps
    }

    pub fn export_edges(&self) -> Vec<(String, String)> {
        let mut edge_list = Vec::new();
        for (source, targets) in &self.edges {
            for target in targets {
                edge_list.push((source.clone(), target.clone()));
            }
        }
        edge_list
    }

    pub fn export_nodes(&self) -> Vec<String> {
        self.nodes.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(ids: &[&str]) -> DAG {
        let mut dag = DAG::new();
        for id in ids {
            dag.add_node(id.to_string()).unwrap();
        }
        for pair in ids.windows(2) {
            dag.add_edge(pair[0].to_string(), pair[1].to_string()).unwrap();
        }
        dag
    }

    #[test]
    fn test_topological_sort() {
        let dag = chain(&["a", "b", "c"]);
        let order = dag.topological_sort().unwrap();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_cycle_detection_on_add_edge() {
        let mut dag = chain(&["a", "b"]);
        let result = dag.add_edge("b".to_string(), "a".to_string());
        assert_eq!(result, Err(DAGError::CycleDetected));
        // Rejected mutation must not have been applied.
        assert!(dag.get_children("b").is_empty());
    }

    #[test]
    fn test_self_loop_rejected() {
        let mut dag = DAG::new();
        dag.add_node("a".to_string()).unwrap();
        assert_eq!(
            dag.add_edge("a".to_string(), "a".to_string()),
            Err(DAGError::CycleDetected)
        );
    }

    #[test]
    fn test_add_edge_idempotent() {
        let mut dag = chain(&["a", "b"]);
        dag.add_edge("a".to_string(), "b".to_string()).unwrap();
        assert_eq!(dag.get_children("a"), vec!["b".to_string()]);
    }

    #[test]
    fn test_add_edge_missing_node() {
        let mut dag = DAG::new();
        dag.add_node("a".to_string()).unwrap();
        let result = dag.add_edge("a".to_string(), "ghost".to_string());
        assert_eq!(result, Err(DAGError::InvalidNode("ghost".to_string())));
    }

    #[test]
    fn test_remove_edge_missing() {
        let mut dag = chain(&["a", "b"]);
        let result = dag.remove_edge("b", "a");
        assert!(result.is_err());
    }

    #[test]
    fn test_clear_incoming_edges_only_targets_given_node() {
        let mut dag = DAG::new();
        for n in ["a", "b", "x", "y"] {
            dag.add_node(n.to_string()).unwrap();
        }
        dag.add_edge("a".to_string(), "x".to_string()).unwrap();
        dag.add_edge("b".to_string(), "x".to_string()).unwrap();
        dag.add_edge("a".to_string(), "y".to_string()).unwrap();

        dag.clear_incoming_edges("x");

        assert!(dag.get_children("a").contains(&"y".to_string()));
        assert!(!dag.get_children("a").contains(&"x".to_string()));
        assert!(dag.get_children("b").is_empty());
    }

    #[test]
    fn test_topological_sort_detects_indirect_cycle_via_export() {
        // Build a->b->c, then force an artificial cycle by direct field bypass
        // is not possible (fields are private) -- instead assert that a
        // legitimately constructed DAG never reports a cycle.
        let dag = chain(&["a", "b", "c"]);
        assert!(dag.topological_sort().is_ok());
    }

    #[test]
    fn test_remove_node_drops_incoming_and_outgoing_edges() {
        let mut dag = chain(&["a", "b", "c"]);
        dag.remove_node("b").unwrap();

        assert!(!dag.contains("b"));
        assert!(dag.get_children("a").is_empty());
        assert!(dag.get_dependencies("c").is_empty());
    }

    #[test]
    fn test_remove_node_missing_errors() {
        let mut dag = DAG::new();
        assert!(dag.remove_node("ghost").is_err());
    }

    #[test]
    fn test_two_independent_chains_interleave_validly() {
        let mut dag = DAG::new();
        for n in ["a1", "a2", "b1", "b2"] {
            dag.add_node(n.to_string()).unwrap();
        }
        dag.add_edge("a1".to_string(), "a2".to_string()).unwrap();
        dag.add_edge("b1".to_string(), "b2".to_string()).unwrap();

        let order = dag.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a1") < pos("a2"));
        assert!(pos("b1") < pos("b2"));
    }
}
