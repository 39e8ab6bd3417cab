//! Workflow validation: lint rules and diagnostics.
//!
//! Structural and per-type checks run before any session starts.  Call
//! [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail on
//! the first `Error`-severity issue.  Unreachable nodes are warnings, not
//! errors; the engine excludes them from scheduling instead of refusing the
//! workflow.

use std::collections::{HashSet, VecDeque};

use cascade_types::{CascadeError, Result};

use crate::graph::{NodeIndex, NodeKind, WorkflowGraph};
use crate::template;

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub edge: Option<(String, String)>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Graph analysis shared with the scheduler
// ---------------------------------------------------------------------------

/// Nodes not reachable from any entry node. These are excluded from
/// scheduling and reported as warnings.
pub fn unreachable_nodes(graph: &WorkflowGraph) -> HashSet<NodeIndex> {
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    for entry in graph.entry_nodes() {
        if visited.insert(entry) {
            queue.push_back(entry);
        }
    }
    while let Some(current) = queue.pop_front() {
        for &edge_idx in graph.outgoing(current) {
            let target = graph.edge(edge_idx).target;
            if visited.insert(target) {
                queue.push_back(target);
            }
        }
    }
    (0..graph.len()).filter(|i| !visited.contains(i)).collect()
}

/// A cycle discovered by depth-first search. `back_edge` is the edge that
/// closes the cycle; `nodes` lists the cycle members in path order.
#[derive(Debug, Clone)]
pub struct Cycle {
    pub nodes: Vec<NodeIndex>,
    pub back_edge: usize,
}

/// Find one cycle per back edge via DFS in declaration order. The scheduler
/// masks the back edges of legal cycles so the remaining graph is acyclic.
pub fn find_cycles(graph: &WorkflowGraph) -> Vec<Cycle> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    let mut color = vec![Color::White; graph.len()];
    let mut cycles = Vec::new();
    let mut path: Vec<NodeIndex> = Vec::new();

    // Explicit stack: (node, next outgoing-edge position).
    for root in 0..graph.len() {
        if color[root] != Color::White {
            continue;
        }
        let mut stack: Vec<(NodeIndex, usize)> = vec![(root, 0)];
        color[root] = Color::Gray;
        path.push(root);

        while let Some(&(node, pos)) = stack.last() {
            if pos < graph.outgoing(node).len() {
                if let Some(frame) = stack.last_mut() {
                    frame.1 += 1;
                }
                let edge_idx = graph.outgoing(node)[pos];
                let target = graph.edge(edge_idx).target;
                match color[target] {
                    Color::White => {
                        color[target] = Color::Gray;
                        path.push(target);
                        stack.push((target, 0));
                    }
                    Color::Gray => {
                        let start = path.iter().position(|&n| n == target).unwrap_or(0);
                        cycles.push(Cycle {
                            nodes: path[start..].to_vec(),
                            back_edge: edge_idx,
                        });
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                path.pop();
                stack.pop();
            }
        }
    }
    cycles
}

fn node_list(graph: &WorkflowGraph, nodes: &[NodeIndex]) -> String {
    nodes
        .iter()
        .map(|&i| graph.node(i).id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct EntryNodeRule;
impl LintRule for EntryNodeRule {
    fn name(&self) -> &str { "entry_node" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        if graph.entry_nodes().is_empty() {
            vec![Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: "Workflow has no input node".into(),
                node_id: None,
                edge: None,
                fix: Some("Add a node with type=\"input\"".into()),
            }]
        } else {
            vec![]
        }
    }
}

struct InputNoIncomingRule;
impl LintRule for InputNoIncomingRule {
    fn name(&self) -> &str { "input_no_incoming" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(i, n)| matches!(n.kind, NodeKind::Input) && !graph.incoming(*i).is_empty())
            .map(|(_, n)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Error,
                message: format!("Input node '{}' has incoming edges", n.id),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some("Remove edges pointing at the input node".into()),
            })
            .collect()
    }
}

struct ReachabilityRule;
impl LintRule for ReachabilityRule {
    fn name(&self) -> &str { "reachability" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        if graph.entry_nodes().is_empty() {
            return vec![]; // EntryNodeRule will catch this
        }
        let mut unreachable: Vec<_> = unreachable_nodes(graph).into_iter().collect();
        unreachable.sort_unstable();
        unreachable
            .into_iter()
            .map(|i| {
                let id = &graph.node(i).id;
                Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!(
                        "Node '{id}' is not reachable from any input node and will be excluded"
                    ),
                    node_id: Some(id.clone()),
                    edge: None,
                    fix: Some(format!("Add an edge leading to '{id}' or remove it")),
                }
            })
            .collect()
    }
}

struct CycleLegalityRule;
impl LintRule for CycleLegalityRule {
    fn name(&self) -> &str { "cycle_legality" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        find_cycles(graph)
            .into_iter()
            .filter_map(|cycle| {
                let loop_count = cycle
                    .nodes
                    .iter()
                    .filter(|&&i| matches!(graph.node(i).kind, NodeKind::Loop(_)))
                    .count();
                if loop_count == 1 {
                    return None;
                }
                let message = if loop_count == 0 {
                    format!(
                        "Cycle {} contains no loop node",
                        node_list(graph, &cycle.nodes)
                    )
                } else {
                    format!(
                        "Cycle {} contains {loop_count} loop nodes; expected exactly one",
                        node_list(graph, &cycle.nodes)
                    )
                };
                Some(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message,
                    node_id: None,
                    edge: None,
                    fix: Some("Route every cycle through exactly one loop node".into()),
                })
            })
            .collect()
    }
}

struct FanOutTargetsRule;
impl LintRule for FanOutTargetsRule {
    fn name(&self) -> &str { "fan_out_targets" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter_map(|n| match &n.kind {
                NodeKind::FanOut(cfg) if cfg.targets.is_empty() => Some(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Fan-out node '{}' declares no targets", n.id),
                    node_id: Some(n.id.clone()),
                    edge: None,
                    fix: Some("Declare at least one fan-out target".into()),
                }),
                _ => None,
            })
            .collect()
    }
}

struct ConditionBranchesRule;
impl LintRule for ConditionBranchesRule {
    fn name(&self) -> &str { "condition_branches" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, node) in graph.nodes().iter().enumerate() {
            let NodeKind::Condition(_) = node.kind else {
                continue;
            };
            let handles: Vec<_> = graph
                .outgoing(i)
                .iter()
                .map(|&e| graph.edge(e).source_handle.as_deref())
                .collect();
            for required in ["true", "false"] {
                if !handles.contains(&Some(required)) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Condition node '{}' has no outgoing edge with sourceHandle \"{required}\"",
                            node.id
                        ),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        fix: Some(format!(
                            "Add an edge from '{}' with sourceHandle=\"{required}\"",
                            node.id
                        )),
                    });
                }
            }
            for handle in &handles {
                if !matches!(handle, Some("true") | Some("false")) {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Condition node '{}' has an outgoing edge with handle {:?}; expected \"true\" or \"false\"",
                            node.id, handle
                        ),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        fix: Some("Set sourceHandle to \"true\" or \"false\"".into()),
                    });
                }
            }
        }
        diags
    }
}

struct PredicateSyntaxRule;
impl LintRule for PredicateSyntaxRule {
    fn name(&self) -> &str { "predicate_syntax" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .filter_map(|n| {
                let predicate = match &n.kind {
                    NodeKind::Condition(cfg) => &cfg.predicate,
                    NodeKind::Loop(cfg) => &cfg.exit,
                    _ => return None,
                };
                match predicate.check() {
                    Ok(()) => None,
                    Err(err) => Some(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!("Node '{}' has an invalid predicate: {err}", n.id),
                        node_id: Some(n.id.clone()),
                        edge: None,
                        fix: Some("Fix the predicate expression".into()),
                    }),
                }
            })
            .collect()
    }
}

struct LoopBoundsRule;
impl LintRule for LoopBoundsRule {
    fn name(&self) -> &str { "loop_bounds" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes() {
            let NodeKind::Loop(cfg) = &node.kind else {
                continue;
            };
            if cfg.max_iterations == 0 {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Loop node '{}' has max_iterations=0", node.id),
                    node_id: Some(node.id.clone()),
                    edge: None,
                    fix: Some("Set max_iterations to a positive value".into()),
                });
            } else if cfg.max_iterations > 10 {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Warning,
                    message: format!(
                        "Loop node '{}' allows {} iterations; runs may be slow and costly",
                        node.id, cfg.max_iterations
                    ),
                    node_id: Some(node.id.clone()),
                    edge: None,
                    fix: Some("Lower max_iterations to 10 or fewer".into()),
                });
            }
            if cfg.body.is_empty() {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!("Loop node '{}' has an empty body", node.id),
                    node_id: Some(node.id.clone()),
                    edge: None,
                    fix: Some("List at least one body node id".into()),
                });
            }
            for id in &cfg.body {
                match graph.index_of(id) {
                    None => diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Error,
                        message: format!(
                            "Loop node '{}' body references unknown node '{id}'",
                            node.id
                        ),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        fix: Some(format!("Add node '{id}' or remove it from the body")),
                    }),
                    Some(i) if matches!(graph.node(i).kind, NodeKind::Loop(_)) => {
                        diags.push(Diagnostic {
                            rule: self.name().into(),
                            severity: Severity::Error,
                            message: format!(
                                "Loop node '{}' body contains loop node '{id}'; nested loops are not supported",
                                node.id
                            ),
                            node_id: Some(node.id.clone()),
                            edge: None,
                            fix: Some("Flatten the loops or split the workflow".into()),
                        })
                    }
                    Some(_) => {}
                }
            }
        }
        diags
    }
}

struct TemplateReferenceRule;
impl LintRule for TemplateReferenceRule {
    fn name(&self) -> &str { "template_reference" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for node in graph.nodes() {
            let template = match &node.kind {
                NodeKind::Task(cfg) => &cfg.template,
                NodeKind::FanOut(cfg) => &cfg.template,
                _ => continue,
            };
            for id in template::referenced_nodes(template) {
                if graph.index_of(&id).is_none() {
                    diags.push(Diagnostic {
                        rule: self.name().into(),
                        severity: Severity::Warning,
                        message: format!(
                            "Node '{}' template references unknown node '{id}'; it will resolve to an empty string",
                            node.id
                        ),
                        node_id: Some(node.id.clone()),
                        edge: None,
                        fix: Some(format!("Add node '{id}' or fix the variable name")),
                    });
                }
            }
        }
        diags
    }
}

struct AmbiguousParentRule;
impl LintRule for AmbiguousParentRule {
    fn name(&self) -> &str { "ambiguous_parent" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (i, node) in graph.nodes().iter().enumerate() {
            let template = match &node.kind {
                NodeKind::Task(cfg) => &cfg.template,
                NodeKind::FanOut(cfg) => &cfg.template,
                _ => continue,
            };
            if template::uses_parent(template) && graph.incoming(i).len() > 1 {
                diags.push(Diagnostic {
                    rule: self.name().into(),
                    severity: Severity::Error,
                    message: format!(
                        "Node '{}' uses {{{{parent}}}} but has {} incoming edges",
                        node.id,
                        graph.incoming(i).len()
                    ),
                    node_id: Some(node.id.clone()),
                    edge: None,
                    fix: Some("Use {{node_<id>}} to name the upstream node explicitly".into()),
                });
            }
        }
        diags
    }
}

struct MergeFanInRule;
impl LintRule for MergeFanInRule {
    fn name(&self) -> &str { "merge_fan_in" }
    fn apply(&self, graph: &WorkflowGraph) -> Vec<Diagnostic> {
        graph
            .nodes()
            .iter()
            .enumerate()
            .filter(|(i, n)| {
                matches!(n.kind, NodeKind::Merge(_)) && graph.incoming(*i).len() < 2
            })
            .map(|(i, n)| Diagnostic {
                rule: self.name().into(),
                severity: Severity::Warning,
                message: format!(
                    "Merge node '{}' has {} incoming edges; merging needs at least two",
                    n.id,
                    graph.incoming(i).len()
                ),
                node_id: Some(n.id.clone()),
                edge: None,
                fix: Some(format!("Connect more predecessors to '{}'", n.id)),
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(graph: &WorkflowGraph) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(EntryNodeRule),
        Box::new(InputNoIncomingRule),
        Box::new(ReachabilityRule),
        Box::new(CycleLegalityRule),
        Box::new(FanOutTargetsRule),
        Box::new(ConditionBranchesRule),
        Box::new(PredicateSyntaxRule),
        Box::new(LoopBoundsRule),
        Box::new(TemplateReferenceRule),
        Box::new(AmbiguousParentRule),
        Box::new(MergeFanInRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(graph));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(graph: &WorkflowGraph) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(graph);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(CascadeError::Validation(messages.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
