//! Condition runner: evaluate the predicate and record which branch is live.
//!
//! The node's output is its input text unchanged, so downstream templates on
//! either branch can keep referencing the value that was tested.

use std::collections::HashMap;

use cascade_types::Result;

use crate::graph::{ConditionConfig, NodeIndex, WorkflowGraph};

use super::{NodeOutput, RunContext, RunOutcome};

/// The text a condition tests: the last settled predecessor in incoming-edge
/// order (a loop-back edge adds a second, usually unsettled, predecessor),
/// or the session input when nothing upstream has settled.
fn tested_text(
    graph: &WorkflowGraph,
    outputs: &HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    session_input: &str,
) -> String {
    graph
        .incoming(idx)
        .iter()
        .filter_map(|&e| outputs.get(&graph.edge(e).source))
        .next_back()
        .map(|o| o.text().to_string())
        .unwrap_or_else(|| session_input.to_string())
}

pub(crate) fn run(
    ctx: &RunContext<'_>,
    outputs: &HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    cfg: &ConditionConfig,
) -> Result<RunOutcome> {
    let text = tested_text(ctx.graph, outputs, idx, ctx.input);
    let verdict = cfg.predicate.evaluate(&text, ctx.input);
    tracing::debug!(
        node = %ctx.graph.node(idx).id,
        verdict,
        "condition evaluated"
    );
    Ok(RunOutcome {
        output: NodeOutput::Text(text),
        warnings: Vec::new(),
        iterations: None,
        exit_reason: None,
        branch: Some(verdict),
    })
}
