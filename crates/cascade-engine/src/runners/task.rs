//! Task runner: one resolved template, one resilient executor call.

use std::collections::HashMap;

use cascade_types::Result;

use crate::events::ChunkSink;
use crate::executor::TaskRequest;
use crate::graph::{NodeIndex, TaskConfig};
use crate::resilience;

use super::{resolve_template, NodeOutput, RunContext, RunOutcome};

pub(crate) async fn run(
    ctx: &RunContext<'_>,
    outputs: &mut HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    cfg: &TaskConfig,
) -> Result<RunOutcome> {
    let node_id = ctx.graph.node(idx).id.clone();
    let resolved = resolve_template(ctx, outputs, idx, &cfg.template);
    tracing::debug!(node = %node_id, resource = %cfg.resource, "task dispatch");

    let breaker = ctx.breakers.breaker(&cfg.resource);
    let sink = ChunkSink::new(ctx.bus, ctx.session_id, ctx.chunk_node(&node_id));
    let request = TaskRequest {
        node_id: node_id.clone(),
        resource: cfg.resource.clone(),
        input: resolved,
    };

    let executor = ctx.executor.clone();
    let output = resilience::invoke(&node_id, &breaker, ctx.retry, || {
        let executor = executor.clone();
        let request = request.clone();
        let sink = sink.clone();
        async move { executor.execute(request, &sink).await }
    })
    .await?;

    Ok(RunOutcome::text(output))
}
