//! Loop runner: bounded re-entry of a body subset.
//!
//! The main schedule treats a Loop node as one opaque step; this runner owns
//! the re-entry. Before each iteration the exit predicate is checked against
//! the current accumulated value, so a value that already satisfies it
//! converges with zero iterations. Each pass runs the body nodes in their
//! own topological order, re-resolving templates against the latest outputs.

use std::collections::HashMap;

use cascade_types::{CascadeError, ExitReason, Result};

use crate::graph::{LoopConfig, NodeIndex};
use crate::schedule;

use super::{parent_output, run_node_boxed, NodeOutput, RunContext, RunOutcome};

pub(crate) async fn run(
    ctx: &RunContext<'_>,
    outputs: &mut HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    cfg: &LoopConfig,
) -> Result<RunOutcome> {
    let node_id = ctx.graph.node(idx).id.clone();
    let body = ctx.graph.loop_body(cfg);
    let order = schedule::body_order(ctx.graph, &body)?;

    let mut warnings = Vec::new();
    let max = cfg.max_iterations.min(ctx.loop_ceiling);
    if cfg.max_iterations > ctx.loop_ceiling {
        warnings.push(format!(
            "max_iterations {} clamped to ceiling {}",
            cfg.max_iterations, ctx.loop_ceiling
        ));
    }

    let mut current =
        parent_output(ctx.graph, outputs, idx).unwrap_or_else(|| ctx.input.to_string());
    // Body templates reference the loop node as their parent; keep its
    // output current across iterations.
    outputs.insert(idx, NodeOutput::Text(current.clone()));

    // Body activity streams under the loop node's id.
    let body_ctx = RunContext {
        graph: ctx.graph,
        session_id: ctx.session_id,
        input: ctx.input,
        executor: ctx.executor,
        breakers: ctx.breakers,
        retry: ctx.retry,
        bus: ctx.bus,
        cancel: ctx.cancel.clone(),
        loop_ceiling: ctx.loop_ceiling,
        chunk_attribution: Some(node_id.clone()),
    };

    let mut iterations = 0u32;
    let mut exit_reason = ExitReason::MaxIterations;

    while iterations < max {
        if cfg.exit.evaluate(&current, ctx.input) {
            exit_reason = ExitReason::Converged;
            break;
        }
        // Iteration boundary is a cancellation point.
        if ctx.cancel.is_cancelled() {
            return Err(CascadeError::Cancelled);
        }

        for &body_idx in &order {
            let outcome = run_node_boxed(&body_ctx, outputs, body_idx).await?;
            warnings.extend(outcome.warnings);
            outputs.insert(body_idx, outcome.output);
        }
        if let Some(&last) = order.last() {
            if let Some(out) = outputs.get(&last) {
                current = out.text().to_string();
            }
        }
        iterations += 1;
        outputs.insert(idx, NodeOutput::Text(current.clone()));
        tracing::debug!(node = %node_id, iterations, "loop iteration settled");
    }

    // The final iteration may have produced a satisfying value.
    if exit_reason == ExitReason::MaxIterations && cfg.exit.evaluate(&current, ctx.input) {
        exit_reason = ExitReason::Converged;
    }

    Ok(RunOutcome {
        output: NodeOutput::Text(current),
        warnings,
        iterations: Some(iterations),
        exit_reason: Some(exit_reason),
        branch: None,
    })
}
