//! Topological sort for determining move order
//!
//! Owners must be created before their dependents so that ownerReferences
//! can be rebuilt with the new UIDs.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::MoveError;
use crate::graph::{GraphNode, ObjectGraph};

/// A group of objects whose owners are all placed in earlier groups
#[derive(Debug, Clone, Default)]
pub(crate) struct MoveGroup {
    /// UIDs of objects in this group, sorted by kind and name
    pub uids: Vec<String>,
}

impl MoveGroup {
    pub fn len(&self) -> usize {
        self.uids.len()
    }
}

/// Ordered sequence of groups for move operation
///
/// All owners of objects in group N are in groups 0..N-1.
#[derive(Debug)]
pub struct MoveSequence {
    groups: Vec<MoveGroup>,
    total_objects: usize,
}

impl MoveSequence {
    /// Compute the move sequence from an object graph using Kahn's algorithm.
    ///
    /// Owners that are not in the graph are treated as already placed. Within a
    /// group, objects are ordered by kind, then namespace, then name, so the
    /// sequence is stable across runs.
    pub fn from_graph(graph: &ObjectGraph) -> Result<Self, MoveError> {
        let all_uids: HashSet<String> = graph.uids().into_iter().collect();
        let total_objects = all_uids.len();

        let mut placed: HashSet<String> = HashSet::new();
        let mut groups: Vec<MoveGroup> = Vec::new();

        while placed.len() < total_objects {
            let mut ready: Vec<&GraphNode> = all_uids
                .iter()
                .filter(|uid| !placed.contains(*uid))
                .filter_map(|uid| graph.get(uid))
                .filter(|node| {
                    node.all_owners()
                        .iter()
                        .filter(|o| all_uids.contains(*o))
                        .all(|o| placed.contains(o))
                })
                .collect();

            if ready.is_empty() {
                let mut stuck: Vec<String> = all_uids
                    .iter()
                    .filter(|uid| !placed.contains(*uid))
                    .filter_map(|uid| graph.get(uid))
                    .map(|n| n.identity.display())
                    .collect();
                stuck.sort();

                return Err(MoveError::CycleDetected(format!(
                    "cannot make progress, stuck objects: {:?}",
                    stuck
                )));
            }

            ready.sort_by(|a, b| {
                (&a.identity.kind, &a.identity.namespace, &a.identity.name).cmp(&(
                    &b.identity.kind,
                    &b.identity.namespace,
                    &b.identity.name,
                ))
            });

            let group = MoveGroup {
                uids: ready.iter().map(|n| n.uid().to_string()).collect(),
            };

            debug!(group = groups.len(), objects = group.len(), "Computed move group");

            placed.extend(group.uids.iter().cloned());
            groups.push(group);
        }

        info!(
            groups = groups.len(),
            objects = total_objects,
            "Computed move sequence"
        );

        Ok(Self {
            groups,
            total_objects,
        })
    }

    #[cfg(test)]
    pub(crate) fn groups(&self) -> &[MoveGroup] {
        &self.groups
    }

    /// Get the total number of objects
    pub fn total_objects(&self) -> usize {
        self.total_objects
    }

    /// Get the number of groups
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub(crate) fn iter_groups(&self) -> impl Iterator<Item = (usize, &MoveGroup)> {
        self.groups.iter().enumerate()
    }

    /// Get all UIDs in move order (flattened)
    pub fn all_uids_in_order(&self) -> Vec<String> {
        self.groups
            .iter()
            .flat_map(|g| g.uids.iter().cloned())
            .collect()
    }

    /// Get all UIDs in reverse order for deletion
    pub fn all_uids_for_deletion(&self) -> Vec<String> {
        self.groups
            .iter()
            .rev()
            .flat_map(|g| g.uids.iter().rev().cloned())
            .collect()
    }
}

/// Extract nodes from graph for a specific group
pub(crate) fn extract_nodes_for_group<'a>(
    graph: &'a ObjectGraph,
    group: &MoveGroup,
) -> Vec<&'a GraphNode> {
    group.uids.iter().filter_map(|uid| graph.get(uid)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::tests::make_test_node;

    fn node(uid: &str, owners: Vec<&str>) -> GraphNode {
        make_test_node(uid, "Test", uid, owners)
    }

    fn make_test_graph(nodes: Vec<GraphNode>) -> ObjectGraph {
        let mut graph = ObjectGraph::new("default");
        for node in nodes {
            graph.insert(node);
        }
        graph
    }

    #[test]
    fn test_sequence_single_object() {
        let graph = make_test_graph(vec![node("a", vec![])]);

        let sequence = MoveSequence::from_graph(&graph).unwrap();

        assert_eq!(sequence.num_groups(), 1);
        assert_eq!(sequence.total_objects(), 1);
        assert_eq!(sequence.groups()[0].uids, vec!["a"]);
    }

    #[test]
    fn test_sequence_linear_chain() {
        let graph = make_test_graph(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["b"]),
        ]);

        let sequence = MoveSequence::from_graph(&graph).unwrap();

        assert_eq!(sequence.num_groups(), 3);
        assert_eq!(sequence.all_uids_in_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_sequence_diamond_dependency() {
        // a -> b -> d, a -> c -> d
        let graph = make_test_graph(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["a"]),
            node("d", vec!["b", "c"]),
        ]);

        let sequence = MoveSequence::from_graph(&graph).unwrap();

        assert_eq!(sequence.num_groups(), 3);
        assert_eq!(sequence.all_uids_in_order(), vec!["a", "b", "c", "d"]);
    }

    #[test]
    fn groups_are_ordered_by_kind_then_name() {
        let graph = make_test_graph(vec![
            make_test_node("u1", "Secret", "demo1-kubeconfig", vec![]),
            make_test_node("u2", "Cluster", "demo1", vec![]),
            make_test_node("u3", "AWSCluster", "demo1", vec![]),
        ]);

        let sequence = MoveSequence::from_graph(&graph).unwrap();
        assert_eq!(sequence.all_uids_in_order(), vec!["u3", "u2", "u1"]);
    }

    #[test]
    fn test_sequence_external_owner() {
        // b's owner is not being moved
        let graph = make_test_graph(vec![node("b", vec!["a"])]);

        let sequence = MoveSequence::from_graph(&graph).unwrap();

        assert_eq!(sequence.num_groups(), 1);
        assert_eq!(sequence.groups()[0].uids, vec!["b"]);
    }

    #[test]
    fn test_cycle_is_detected() {
        let graph = make_test_graph(vec![node("a", vec!["b"]), node("b", vec!["a"])]);

        let err = MoveSequence::from_graph(&graph).unwrap_err();
        assert!(matches!(err, MoveError::CycleDetected(_)));
    }

    #[test]
    fn test_all_uids_for_deletion() {
        let graph = make_test_graph(vec![
            node("a", vec![]),
            node("b", vec!["a"]),
            node("c", vec!["b"]),
        ]);

        let sequence = MoveSequence::from_graph(&graph).unwrap();
        assert_eq!(sequence.all_uids_for_deletion(), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_extract_nodes_for_group() {
        let graph = make_test_graph(vec![node("a", vec![]), node("b", vec![])]);

        let group = MoveGroup {
            uids: vec!["a".to_string()],
        };

        let extracted = extract_nodes_for_group(&graph, &group);
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].uid(), "a");
    }

    #[test]
    fn empty_graph_has_no_groups() {
        let graph = ObjectGraph::new("default");
        let sequence = MoveSequence::from_graph(&graph).unwrap();
        assert_eq!(sequence.num_groups(), 0);
        assert!(sequence.all_uids_in_order().is_empty());
    }
}
