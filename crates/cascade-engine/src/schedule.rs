//! Deterministic scheduling order for a validated workflow.
//!
//! Kahn's algorithm over the graph with the back edges of loop-mediated
//! cycles masked out. Ties break on declaration order so the same document
//! always schedules the same way.

use std::collections::HashSet;

use cascade_types::{CascadeError, Result};

use crate::graph::{NodeIndex, NodeKind, WorkflowGraph};
use crate::validation::find_cycles;

/// Topological order of the schedulable nodes. `excluded` nodes (unreachable
/// from every input node) are left out entirely; back edges of legal cycles,
/// the ones passing through exactly one loop node, do not count toward
/// in-degrees. Any other cycle stays intact and fails the sort.
pub fn topo_order(
    graph: &WorkflowGraph,
    excluded: &HashSet<NodeIndex>,
) -> Result<Vec<NodeIndex>> {
    let masked: HashSet<usize> = find_cycles(graph)
        .into_iter()
        .filter(|c| {
            c.nodes
                .iter()
                .filter(|&&i| matches!(graph.node(i).kind, NodeKind::Loop(_)))
                .count()
                == 1
        })
        .map(|c| c.back_edge)
        .collect();
    topo_order_masked(graph, excluded, &masked)
}

fn topo_order_masked(
    graph: &WorkflowGraph,
    excluded: &HashSet<NodeIndex>,
    masked_edges: &HashSet<usize>,
) -> Result<Vec<NodeIndex>> {
    let mut in_degree = vec![0usize; graph.len()];
    for (i, edge) in graph.edges().iter().enumerate() {
        if masked_edges.contains(&i)
            || excluded.contains(&edge.source)
            || excluded.contains(&edge.target)
        {
            continue;
        }
        in_degree[edge.target] += 1;
    }

    // Declaration-order tie-break: always pick the smallest ready index.
    // A sorted scan beats a heap at workflow sizes.
    let mut ready: Vec<NodeIndex> = (0..graph.len())
        .filter(|i| !excluded.contains(i) && in_degree[*i] == 0)
        .collect();
    let mut order = Vec::with_capacity(graph.len() - excluded.len());

    while !ready.is_empty() {
        let pos = ready
            .iter()
            .enumerate()
            .min_by_key(|(_, &n)| n)
            .map(|(p, _)| p)
            .unwrap_or(0);
        let node = ready.swap_remove(pos);
        order.push(node);

        for &edge_idx in graph.outgoing(node) {
            if masked_edges.contains(&edge_idx) {
                continue;
            }
            let target = graph.edge(edge_idx).target;
            if excluded.contains(&target) {
                continue;
            }
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                ready.push(target);
            }
        }
    }

    if order.len() != graph.len() - excluded.len() {
        let stuck: Vec<_> = (0..graph.len())
            .filter(|i| !excluded.contains(i) && !order.contains(i))
            .map(|i| graph.node(i).id.clone())
            .collect();
        return Err(CascadeError::Validation(format!(
            "workflow contains an unschedulable cycle involving: {}",
            stuck.join(", ")
        )));
    }
    Ok(order)
}

/// Scheduling order restricted to a loop body. Edges leaving or entering the
/// subset are ignored; declaration order breaks ties as in the main schedule.
pub fn body_order(graph: &WorkflowGraph, body: &[NodeIndex]) -> Result<Vec<NodeIndex>> {
    let members: HashSet<NodeIndex> = body.iter().copied().collect();
    let excluded: HashSet<NodeIndex> =
        (0..graph.len()).filter(|i| !members.contains(i)).collect();
    topo_order(graph, &excluded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::WorkflowDocument;

    fn build(json: serde_json::Value) -> WorkflowGraph {
        let doc: WorkflowDocument = serde_json::from_value(json).unwrap();
        WorkflowGraph::from_document(doc).unwrap()
    }

    fn ids(graph: &WorkflowGraph, order: &[NodeIndex]) -> Vec<String> {
        order.iter().map(|&i| graph.node(i).id.clone()).collect()
    }

    #[test]
    fn linear_chain_in_order() {
        let graph = build(serde_json::json!({
            "nodes": [
                {"id": "in", "type": "input"},
                {"id": "a", "type": "task", "template": "x"},
                {"id": "b", "type": "task", "template": "y"}
            ],
            "edges": [
                {"source": "in", "target": "a"},
                {"source": "a", "target": "b"}
            ]
        }));
        let order = topo_order(&graph, &HashSet::new()).unwrap();
        assert_eq!(ids(&graph, &order), vec!["in", "a", "b"]);
    }

    #[test]
    fn ties_break_on_declaration_order() {
        // Diamond: both branches become ready together; the earlier-declared
        // node must schedule first.
        let graph = build(serde_json::json!({
            "nodes": [
                {"id": "in", "type": "input"},
                {"id": "late", "type": "task", "template": "x"},
                {"id": "early", "type": "task", "template": "y"},
                {"id": "join", "type": "merge", "strategy": "last"}
            ],
            "edges": [
                {"source": "in", "target": "early"},
                {"source": "in", "target": "late"},
                {"source": "early", "target": "join"},
                {"source": "late", "target": "join"}
            ]
        }));
        let order = topo_order(&graph, &HashSet::new()).unwrap();
        assert_eq!(ids(&graph, &order), vec!["in", "late", "early", "join"]);
    }

    #[test]
    fn loop_back_edge_masked() {
        let graph = build(serde_json::json!({
            "nodes": [
                {"id": "in", "type": "input"},
                {"id": "draft", "type": "task", "template": "x"},
                {"id": "check", "type": "condition",
                 "predicate": {"kind": "contains", "value": "ok"}},
                {"id": "revise", "type": "task", "template": "y"},
                {"id": "refine", "type": "loop", "body": ["revise"],
                 "exit": {"kind": "contains", "value": "ok"}, "max_iterations": 3},
                {"id": "ship", "type": "task", "template": "z"}
            ],
            "edges": [
                {"source": "in", "target": "draft"},
                {"source": "draft", "target": "check"},
                {"source": "check", "target": "ship", "sourceHandle": "true"},
                {"source": "check", "target": "refine", "sourceHandle": "false"},
                {"source": "refine", "target": "revise"},
                {"source": "revise", "target": "check"}
            ]
        }));
        let order = topo_order(&graph, &HashSet::new()).unwrap();
        // Every node appears exactly once despite the cycle.
        assert_eq!(order.len(), 6);
        let position = |id: &str| {
            order
                .iter()
                .position(|&i| graph.node(i).id == id)
                .unwrap()
        };
        assert!(position("draft") < position("check"));
        assert!(position("check") < position("ship"));
    }

    #[test]
    fn cycle_without_loop_node_is_unschedulable() {
        // A plain task cycle is never masked; it must surface as an error
        // instead of being silently linearized.
        let graph = build(serde_json::json!({
            "nodes": [
                {"id": "in", "type": "input"},
                {"id": "a", "type": "task", "template": "x"},
                {"id": "b", "type": "task", "template": "y"}
            ],
            "edges": [
                {"source": "in", "target": "a"},
                {"source": "a", "target": "b"},
                {"source": "b", "target": "a"}
            ]
        }));
        let err = topo_order(&graph, &HashSet::new()).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("unschedulable cycle"), "got: {message}");
        assert!(message.contains("a, b"), "got: {message}");
    }

    #[test]
    fn excluded_nodes_skipped() {
        let graph = build(serde_json::json!({
            "nodes": [
                {"id": "in", "type": "input"},
                {"id": "a", "type": "task", "template": "x"},
                {"id": "orphan", "type": "task", "template": "y"}
            ],
            "edges": [{"source": "in", "target": "a"}]
        }));
        let excluded: HashSet<_> = [graph.index_of("orphan").unwrap()].into();
        let order = topo_order(&graph, &excluded).unwrap();
        assert_eq!(ids(&graph, &order), vec!["in", "a"]);
    }

    #[test]
    fn body_order_ignores_outside_edges() {
        let graph = build(serde_json::json!({
            "nodes": [
                {"id": "in", "type": "input"},
                {"id": "b2", "type": "task", "template": "x"},
                {"id": "b1", "type": "task", "template": "y"},
                {"id": "l", "type": "loop", "body": ["b1", "b2"],
                 "exit": {"kind": "contains", "value": "ok"}, "max_iterations": 2}
            ],
            "edges": [
                {"source": "in", "target": "l"},
                {"source": "l", "target": "b1"},
                {"source": "b1", "target": "b2"}
            ]
        }));
        let body: Vec<_> = ["b1", "b2"]
            .iter()
            .map(|id| graph.index_of(id).unwrap())
            .collect();
        let order = body_order(&graph, &body).unwrap();
        assert_eq!(ids(&graph, &order), vec!["b1", "b2"]);
    }
}
