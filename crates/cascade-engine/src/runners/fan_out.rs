//! Fan-out runner: concurrent target dispatch with a join barrier.
//!
//! Every target runs as its own tokio task behind its own resilient
//! invocation. The barrier waits for all targets to settle before the node is
//! considered terminal; one target's failure never cancels siblings. Session
//! cancellation is the exception: the barrier aborts whatever is still in
//! flight and reports the node cancelled.

use std::collections::HashMap;

use tokio::task::JoinSet;

use cascade_types::{CascadeError, Result};

use crate::events::ChunkSink;
use crate::executor::TaskRequest;
use crate::graph::{FanOutConfig, MergeStrategy, NodeIndex};
use crate::resilience;

use super::{resolve_template, BranchResult, NodeOutput, RunContext, RunOutcome};

pub(crate) async fn run(
    ctx: &RunContext<'_>,
    outputs: &mut HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    cfg: &FanOutConfig,
) -> Result<RunOutcome> {
    let node_id = ctx.graph.node(idx).id.clone();
    // One resolution, shared by every target.
    let resolved = resolve_template(ctx, outputs, idx, &cfg.template);

    let mut set: JoinSet<(usize, Result<String>)> = JoinSet::new();
    for (i, target) in cfg.targets.iter().enumerate() {
        let branch_id = format!("{}:{}", node_id, target.name);
        let breaker = ctx.breakers.breaker(&target.resource);
        let retry = ctx.retry.clone();
        let executor = ctx.executor.clone();
        let sink = ChunkSink::new(ctx.bus, ctx.session_id, ctx.chunk_node(&node_id));
        let request = TaskRequest {
            node_id: branch_id.clone(),
            resource: target.resource.clone(),
            input: resolved.clone(),
        };
        set.spawn(async move {
            let result = resilience::invoke(&branch_id, &breaker, &retry, || {
                let executor = executor.clone();
                let request = request.clone();
                let sink = sink.clone();
                async move { executor.execute(request, &sink).await }
            })
            .await;
            (i, result)
        });
    }

    // Join barrier: collect every target in declared order, watching for
    // cancellation. Aborted siblings surface as cancelled join errors.
    let mut settled: Vec<Option<Result<String>>> = (0..cfg.targets.len()).map(|_| None).collect();
    let mut cancelled = ctx.cancel.is_cancelled();
    if cancelled {
        set.abort_all();
    }
    loop {
        tokio::select! {
            joined = set.join_next() => {
                match joined {
                    None => break,
                    Some(Ok((i, result))) => settled[i] = Some(result),
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        return Err(CascadeError::Other(format!(
                            "fan-out target task panicked: {e}"
                        )));
                    }
                }
            }
            _ = ctx.cancel.cancelled(), if !cancelled => {
                cancelled = true;
                set.abort_all();
            }
        }
    }
    if cancelled {
        return Err(CascadeError::Cancelled);
    }

    let mut branches = Vec::with_capacity(cfg.targets.len());
    let mut warnings = Vec::new();
    let mut failures = 0usize;
    for (target, result) in cfg.targets.iter().zip(settled) {
        let result = match result {
            Some(Ok(output)) => Ok(output),
            Some(Err(e)) => {
                failures += 1;
                warnings.push(format!("fan-out target '{}' failed: {e}", target.name));
                Err(e.to_string())
            }
            // Unreachable outside cancellation, which returned above.
            None => Err("target did not settle".to_string()),
        };
        branches.push(BranchResult {
            name: target.name.clone(),
            result,
        });
    }

    if failures == cfg.targets.len() {
        return Err(CascadeError::Other(format!(
            "all {} fan-out targets of '{node_id}' failed",
            cfg.targets.len()
        )));
    }

    let combined = combine(&cfg.merge, &branches);
    Ok(RunOutcome {
        output: NodeOutput::FanOut { combined, branches },
        warnings,
        iterations: None,
        exit_reason: None,
        branch: None,
    })
}

/// Combine settled branches into the node's own output text. Concatenation
/// is headed per target name so a downstream task can tell sections apart;
/// the positional strategies pick among successful raw outputs.
fn combine(strategy: &MergeStrategy, branches: &[BranchResult]) -> String {
    match strategy {
        MergeStrategy::Concatenate { separator } => branches
            .iter()
            .map(|b| match &b.result {
                Ok(output) => format!("### {}\n{output}", b.name),
                Err(error) => format!("### {}\n[failed: {error}]", b.name),
            })
            .collect::<Vec<_>>()
            .join(separator),
        MergeStrategy::FirstNonEmpty => branches
            .iter()
            .filter_map(|b| b.result.as_ref().ok())
            .find(|s| !s.is_empty())
            .cloned()
            .unwrap_or_default(),
        MergeStrategy::Last => branches
            .iter()
            .filter_map(|b| b.result.as_ref().ok())
            .next_back()
            .cloned()
            .unwrap_or_default(),
    }
}
