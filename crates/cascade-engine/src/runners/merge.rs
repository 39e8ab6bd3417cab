//! Merge runner: deterministic combination of predecessor outputs.
//!
//! Predecessors contribute in incoming-edge declaration order. A fan-out
//! predecessor contributes one entry per branch (failure markers included)
//! rather than its pre-combined text. Missing outputs from skipped branches
//! become empty strings plus a warning, never a failure.

use std::collections::HashMap;

use cascade_types::Result;

use crate::graph::{MergeConfig, MergeStrategy, NodeIndex};

use super::{NodeOutput, RunContext, RunOutcome};

pub(crate) fn run(
    ctx: &RunContext<'_>,
    outputs: &HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    cfg: &MergeConfig,
) -> Result<RunOutcome> {
    let mut inputs: Vec<String> = Vec::new();
    let mut warnings = Vec::new();

    for &edge_idx in ctx.graph.incoming(idx) {
        let source = ctx.graph.edge(edge_idx).source;
        let source_id = &ctx.graph.node(source).id;
        match outputs.get(&source) {
            Some(NodeOutput::FanOut { branches, .. }) => {
                for branch in branches {
                    match &branch.result {
                        Ok(output) => inputs.push(output.clone()),
                        Err(error) => {
                            warnings.push(format!(
                                "fan-out branch '{}' of '{source_id}' failed; merged its failure marker",
                                branch.name
                            ));
                            inputs.push(format!("[{} failed: {error}]", branch.name));
                        }
                    }
                }
            }
            Some(output) => inputs.push(output.text().to_string()),
            None => {
                warnings.push(format!(
                    "predecessor '{source_id}' produced no output; substituted empty string"
                ));
                inputs.push(String::new());
            }
        }
    }

    let combined = apply(&cfg.strategy, &inputs);
    Ok(RunOutcome {
        output: NodeOutput::Text(combined),
        warnings,
        iterations: None,
        exit_reason: None,
        branch: None,
    })
}

fn apply(strategy: &MergeStrategy, inputs: &[String]) -> String {
    match strategy {
        MergeStrategy::Concatenate { separator } => inputs.join(separator),
        MergeStrategy::FirstNonEmpty => inputs
            .iter()
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default(),
        MergeStrategy::Last => inputs.last().cloned().unwrap_or_default(),
    }
}
