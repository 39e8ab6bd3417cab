//! Per-node-type execution strategies.
//!
//! The engine's dispatch loop owns all session state; runners receive a
//! read-mostly [`RunContext`] plus the outputs map and return a
//! [`RunOutcome`]. Only the Loop runner mutates outputs itself, because its
//! body nodes settle inside the runner rather than in the main schedule.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

use cascade_types::{ExitReason, Result};

use crate::events::EventBus;
use crate::executor::TaskExecutor;
use crate::graph::{NodeIndex, NodeKind, WorkflowGraph};
use crate::resilience::{BreakerRegistry, RetryPolicy};
use crate::template::{self, TemplateContext};

pub mod condition;
pub mod fan_out;
pub mod loops;
pub mod merge;
pub mod task;

/// Cooperative cancellation flag backed by a watch channel. Checked at
/// pre-dispatch, fan-out join, and loop iteration boundaries.
#[derive(Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new() -> (watch::Sender<bool>, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (tx, CancelSignal { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. Never resolves otherwise,
    /// even if the sender is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// A settled fan-out branch: the target name plus its output or the error
/// message it failed with.
#[derive(Debug, Clone)]
pub struct BranchResult {
    pub name: String,
    pub result: std::result::Result<String, String>,
}

/// What a completed node contributed to the session. Fan-out keeps its
/// per-branch results alongside the combined text so a downstream Merge can
/// combine the branches itself.
#[derive(Debug, Clone)]
pub enum NodeOutput {
    Text(String),
    FanOut {
        combined: String,
        branches: Vec<BranchResult>,
    },
}

impl NodeOutput {
    pub fn text(&self) -> &str {
        match self {
            NodeOutput::Text(s) => s,
            NodeOutput::FanOut { combined, .. } => combined,
        }
    }
}

/// Result of running one node.
#[derive(Debug)]
pub struct RunOutcome {
    pub output: NodeOutput,
    pub warnings: Vec<String>,
    /// Loop nodes: completed iteration count.
    pub iterations: Option<u32>,
    /// Loop nodes: why iteration stopped.
    pub exit_reason: Option<ExitReason>,
    /// Condition nodes: the branch taken.
    pub branch: Option<bool>,
}

impl RunOutcome {
    pub fn text(output: impl Into<String>) -> Self {
        RunOutcome {
            output: NodeOutput::Text(output.into()),
            warnings: Vec::new(),
            iterations: None,
            exit_reason: None,
            branch: None,
        }
    }
}

/// Everything a runner needs besides the outputs map.
pub struct RunContext<'a> {
    pub graph: &'a WorkflowGraph,
    pub session_id: &'a str,
    /// Original session input.
    pub input: &'a str,
    pub executor: &'a Arc<dyn TaskExecutor>,
    pub breakers: &'a BreakerRegistry,
    pub retry: &'a RetryPolicy,
    pub bus: &'a EventBus,
    pub cancel: CancelSignal,
    /// Hard ceiling a Loop's max_iterations is clamped to.
    pub loop_ceiling: u32,
    /// Node id output chunks are attributed to, when it differs from the
    /// running node. The Loop runner attributes body activity to the loop
    /// node so observers see one started/terminal pair per scheduled node.
    pub chunk_attribution: Option<String>,
}

impl RunContext<'_> {
    /// Node id the executor's chunks should carry for `node_id`'s work.
    pub(crate) fn chunk_node<'b>(&'b self, node_id: &'b str) -> &'b str {
        self.chunk_attribution.as_deref().unwrap_or(node_id)
    }
}

/// Dispatch a node to its runner.
pub async fn run_node(
    ctx: &RunContext<'_>,
    outputs: &mut HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
) -> Result<RunOutcome> {
    match ctx.graph.node(idx).kind.clone() {
        NodeKind::Input => Ok(RunOutcome::text(ctx.input)),
        NodeKind::Task(cfg) => task::run(ctx, outputs, idx, &cfg).await,
        NodeKind::FanOut(cfg) => fan_out::run(ctx, outputs, idx, &cfg).await,
        NodeKind::Condition(cfg) => condition::run(ctx, outputs, idx, &cfg),
        NodeKind::Loop(cfg) => loops::run(ctx, outputs, idx, &cfg).await,
        NodeKind::Merge(cfg) => merge::run(ctx, outputs, idx, &cfg),
    }
}

/// Boxed form for recursive dispatch from inside the Loop runner.
pub(crate) fn run_node_boxed<'a>(
    ctx: &'a RunContext<'_>,
    outputs: &'a mut HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
) -> Pin<Box<dyn Future<Output = Result<RunOutcome>> + Send + 'a>> {
    Box::pin(run_node(ctx, outputs, idx))
}

/// Output of a node's sole predecessor, when it has exactly one incoming
/// edge and that predecessor has settled with output. Validation guarantees
/// `{{parent}}` is only used on single-predecessor nodes.
pub(crate) fn parent_output(
    graph: &WorkflowGraph,
    outputs: &HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
) -> Option<String> {
    let incoming = graph.incoming(idx);
    if incoming.len() != 1 {
        return None;
    }
    let source = graph.edge(incoming[0]).source;
    outputs.get(&source).map(|o| o.text().to_string())
}

/// Resolve a node's template against the session input, its parent, and all
/// settled node outputs.
pub(crate) fn resolve_template(
    ctx: &RunContext<'_>,
    outputs: &HashMap<NodeIndex, NodeOutput>,
    idx: NodeIndex,
    template_text: &str,
) -> String {
    let parent = parent_output(ctx.graph, outputs, idx);
    let lookup = |id: &str| {
        ctx.graph
            .index_of(id)
            .and_then(|i| outputs.get(&i))
            .map(|o| o.text().to_string())
    };
    template::resolve(
        template_text,
        &TemplateContext {
            input: ctx.input,
            parent: parent.as_deref(),
            lookup: &lookup,
        },
    )
}
