//! Workflow graph model and the serializable submission format.
//!
//! Graphs arrive as a [`WorkflowDocument`] (plain serde structs produced by
//! editors and CLIs) and are compiled into a [`WorkflowGraph`]: an arena of
//! nodes in declaration order, edges as index pairs, and precomputed
//! adjacency. The arena representation keeps Loop-mediated cycles free of
//! ownership problems.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cascade_types::{CascadeError, Result};

use crate::predicate::Predicate;

/// Index of a node in the graph arena. Declaration order is meaningful: it
/// breaks scheduling ties deterministically.
pub type NodeIndex = usize;

// ---------------------------------------------------------------------------
// Node configuration per type
// ---------------------------------------------------------------------------

/// How a Merge node (or a FanOut join) combines multiple outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MergeStrategy {
    Concatenate { separator: String },
    FirstNonEmpty,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Templated input text; see [`crate::template`] for the variable grammar.
    pub template: String,
    /// Logical resource class for circuit-breaker bookkeeping.
    #[serde(default = "default_resource")]
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutTarget {
    pub name: String,
    #[serde(default = "default_resource")]
    pub resource: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanOutConfig {
    /// Shared task description, resolved once before fan-out.
    pub template: String,
    pub targets: Vec<FanOutTarget>,
    #[serde(flatten)]
    pub merge: MergeStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub predicate: Predicate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Node ids re-entered on each iteration.
    pub body: Vec<String>,
    pub exit: Predicate,
    pub max_iterations: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    #[serde(flatten)]
    pub strategy: MergeStrategy,
}

fn default_resource() -> String {
    "default".to_string()
}

/// Closed sum of node types; the engine dispatches on this exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    Input,
    Task(TaskConfig),
    FanOut(FanOutConfig),
    Condition(ConditionConfig),
    Loop(LoopConfig),
    Merge(MergeConfig),
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Task(_) => "task",
            NodeKind::FanOut(_) => "fan_out",
            NodeKind::Condition(_) => "condition",
            NodeKind::Loop(_) => "loop",
            NodeKind::Merge(_) => "merge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

/// Edge between two arena indices. `source_handle` disambiguates Condition
/// branches (`"true"` / `"false"`).
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub source: NodeIndex,
    pub target: NodeIndex,
    pub source_handle: Option<String>,
}

// ---------------------------------------------------------------------------
// Submission format
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(flatten)]
    pub kind: NodeKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: String,
    pub target: String,
    #[serde(default, rename = "sourceHandle")]
    pub source_handle: Option<String>,
}

/// The serializable document consumers submit. The engine only consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDocument {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

// ---------------------------------------------------------------------------
// WorkflowGraph
// ---------------------------------------------------------------------------

/// Compiled workflow graph. Immutable once built; sessions snapshot it behind
/// an `Arc`.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    index: HashMap<String, NodeIndex>,
    edges: Vec<Edge>,
    outgoing: Vec<Vec<usize>>,
    incoming: Vec<Vec<usize>>,
}

impl WorkflowGraph {
    /// Compile a submission document. Duplicate node ids and edges referencing
    /// unknown endpoints are rejected here; structural checks beyond that are
    /// the validator's job.
    pub fn from_document(doc: WorkflowDocument) -> Result<Self> {
        let mut nodes = Vec::with_capacity(doc.nodes.len());
        let mut index = HashMap::with_capacity(doc.nodes.len());

        for spec in doc.nodes {
            if index.contains_key(&spec.id) {
                return Err(CascadeError::Validation(format!(
                    "duplicate node id '{}'",
                    spec.id
                )));
            }
            index.insert(spec.id.clone(), nodes.len());
            nodes.push(Node {
                id: spec.id,
                kind: spec.kind,
            });
        }

        let mut edges = Vec::with_capacity(doc.edges.len());
        for spec in &doc.edges {
            let source = *index.get(&spec.source).ok_or_else(|| {
                CascadeError::Validation(format!(
                    "edge references unknown source node '{}'",
                    spec.source
                ))
            })?;
            let target = *index.get(&spec.target).ok_or_else(|| {
                CascadeError::Validation(format!(
                    "edge references unknown target node '{}'",
                    spec.target
                ))
            })?;
            edges.push(Edge {
                source,
                target,
                source_handle: spec.source_handle.clone(),
            });
        }

        let mut outgoing = vec![Vec::new(); nodes.len()];
        let mut incoming = vec![Vec::new(); nodes.len()];
        for (i, edge) in edges.iter().enumerate() {
            outgoing[edge.source].push(i);
            incoming[edge.target].push(i);
        }

        Ok(WorkflowGraph {
            nodes,
            index,
            edges,
            outgoing,
            incoming,
        })
    }

    /// Parse and compile a JSON submission document.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: WorkflowDocument = serde_json::from_str(json)?;
        Self::from_document(doc)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn index_of(&self, id: &str) -> Option<NodeIndex> {
        self.index.get(id).copied()
    }

    pub fn edge(&self, edge_idx: usize) -> &Edge {
        &self.edges[edge_idx]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Outgoing edge indices of a node, in declaration order.
    pub fn outgoing(&self, idx: NodeIndex) -> &[usize] {
        &self.outgoing[idx]
    }

    /// Incoming edge indices of a node, in declaration order.
    pub fn incoming(&self, idx: NodeIndex) -> &[usize] {
        &self.incoming[idx]
    }

    /// Entry nodes: every node of kind `Input`, in declaration order.
    pub fn entry_nodes(&self) -> Vec<NodeIndex> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n.kind, NodeKind::Input))
            .map(|(i, _)| i)
            .collect()
    }

    /// Resolve a Loop node's body ids to arena indices, skipping unknown ids
    /// (the validator reports those).
    pub fn loop_body(&self, config: &LoopConfig) -> Vec<NodeIndex> {
        config
            .body
            .iter()
            .filter_map(|id| self.index_of(id))
            .collect()
    }
}
