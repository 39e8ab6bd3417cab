//! Workflow execution engine — session lifecycle and the dispatch loop.
//!
//! `run` validates, registers a session, and returns its id immediately;
//! progress is delivered through the [`EventBus`]. One spawned dispatch task
//! per session is the sole writer of that session's node-state table.
//! Concurrent fan-out children hand their results back to the dispatch task
//! instead of touching state, so no per-node locks exist.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use cascade_types::{
    CascadeError, NodeError, NodeState, NodeStatus, Result, SessionStatus,
};

use crate::events::{EventBus, EventKind, ExecutionEvent};
use crate::executor::TaskExecutor;
use crate::graph::{NodeIndex, NodeKind, WorkflowGraph};
use crate::resilience::{BreakerRegistry, RetryPolicy};
use crate::runners::{self, CancelSignal, NodeOutput, RunContext};
use crate::validation::{self, Severity};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
    /// Consecutive terminal failures before a resource's circuit opens.
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown: Duration,
    /// Hard ceiling on loop iterations regardless of node configuration.
    pub loop_ceiling: u32,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            retry: RetryPolicy::default(),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            loop_ceiling: 100,
            event_capacity: 256,
        }
    }
}

// ---------------------------------------------------------------------------
// Session bookkeeping
// ---------------------------------------------------------------------------

/// Point-in-time copy of a session's state table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub status: SessionStatus,
    pub nodes: HashMap<String, NodeState>,
}

struct Session {
    cancel_tx: watch::Sender<bool>,
    shared: Arc<SessionShared>,
}

struct SessionShared {
    status: Mutex<SessionStatus>,
    nodes: Mutex<HashMap<String, NodeState>>,
}

impl SessionShared {
    fn new(graph: &WorkflowGraph) -> Self {
        let nodes = graph
            .nodes()
            .iter()
            .map(|n| (n.id.clone(), NodeState::idle()))
            .collect();
        SessionShared {
            status: Mutex::new(SessionStatus::Pending),
            nodes: Mutex::new(nodes),
        }
    }

    fn set_status(&self, status: SessionStatus) {
        *lock(&self.status) = status;
    }

    fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    fn write_node(&self, id: &str, state: NodeState) {
        lock(&self.nodes).insert(id.to_string(), state);
    }

    fn node(&self, id: &str) -> Option<NodeState> {
        lock(&self.nodes).get(id).cloned()
    }

    fn statuses(&self) -> HashMap<String, NodeStatus> {
        lock(&self.nodes)
            .iter()
            .map(|(id, s)| (id.clone(), s.status))
            .collect()
    }

    fn snapshot(&self, session_id: &str) -> SessionSnapshot {
        SessionSnapshot {
            session_id: session_id.to_string(),
            status: self.status(),
            nodes: lock(&self.nodes).clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    executor: Arc<dyn TaskExecutor>,
    config: EngineConfig,
    breakers: Arc<BreakerRegistry>,
    bus: Arc<EventBus>,
    sessions: Mutex<HashMap<String, Session>>,
}

impl ExecutionEngine {
    pub fn new(executor: Arc<dyn TaskExecutor>) -> Arc<Self> {
        Self::with_config(executor, EngineConfig::default())
    }

    pub fn with_config(executor: Arc<dyn TaskExecutor>, config: EngineConfig) -> Arc<Self> {
        let breakers = Arc::new(BreakerRegistry::new(
            config.breaker_failure_threshold,
            config.breaker_cooldown,
        ));
        let bus = Arc::new(EventBus::new(config.event_capacity));
        Arc::new(ExecutionEngine {
            executor,
            config,
            breakers,
            bus,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    /// Validate and start a workflow run under a fresh session id. Returns
    /// immediately; subscribe to the session for progress.
    pub fn run(
        self: &Arc<Self>,
        graph: WorkflowGraph,
        input: impl Into<String>,
    ) -> Result<String> {
        self.run_with_id(Uuid::new_v4().to_string(), graph, input)
    }

    /// As [`run`](Self::run) with a caller-chosen session id. A session id is
    /// single-use: re-running an id that ever existed is rejected, finished
    /// or not.
    pub fn run_with_id(
        self: &Arc<Self>,
        session_id: String,
        graph: WorkflowGraph,
        input: impl Into<String>,
    ) -> Result<String> {
        let diagnostics = validation::validate_or_raise(&graph)?;
        for diag in diagnostics
            .iter()
            .filter(|d| d.severity == Severity::Warning)
        {
            tracing::warn!(rule = %diag.rule, "{}", diag.message);
        }

        let shared = Arc::new(SessionShared::new(&graph));
        let (cancel_tx, cancel) = CancelSignal::new();
        {
            let mut sessions = lock(&self.sessions);
            if sessions.contains_key(&session_id) {
                return Err(CascadeError::SessionExists(session_id));
            }
            sessions.insert(
                session_id.clone(),
                Session {
                    cancel_tx,
                    shared: shared.clone(),
                },
            );
        }
        self.bus.open_session(&session_id);

        let engine = self.clone();
        let id = session_id.clone();
        let input = input.into();
        tokio::spawn(async move {
            engine.drive(&id, graph, input, shared, cancel).await;
        });
        Ok(session_id)
    }

    /// Request cooperative cancellation. In-flight executor calls finish on
    /// their own; the session stops at the next cancellation point.
    pub fn cancel(&self, session_id: &str) -> Result<()> {
        let sessions = lock(&self.sessions);
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CascadeError::UnknownSession(session_id.to_string()))?;
        let _ = session.cancel_tx.send(true);
        Ok(())
    }

    pub fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        let sessions = lock(&self.sessions);
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CascadeError::UnknownSession(session_id.to_string()))?;
        Ok(session.shared.snapshot(session_id))
    }

    pub fn session_status(&self, session_id: &str) -> Result<SessionStatus> {
        let sessions = lock(&self.sessions);
        let session = sessions
            .get(session_id)
            .ok_or_else(|| CascadeError::UnknownSession(session_id.to_string()))?;
        Ok(session.shared.status())
    }

    /// Subscribe to a session's event stream. Multiple subscribers each see
    /// every event emitted after they joined.
    pub fn subscribe(&self, session_id: &str) -> Result<BroadcastStream<ExecutionEvent>> {
        self.bus.subscribe(session_id)
    }

    // -----------------------------------------------------------------------
    // Dispatch loop (the session's single state writer)
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        session_id: &str,
        graph: WorkflowGraph,
        input: String,
        shared: Arc<SessionShared>,
        cancel: CancelSignal,
    ) {
        let started = Instant::now();
        shared.set_status(SessionStatus::Running);

        let unreachable = validation::unreachable_nodes(&graph);
        // Loop bodies settle inside the Loop runner, not the main schedule.
        let mut excluded = unreachable.clone();
        let mut loop_bodies: HashMap<NodeIndex, Vec<NodeIndex>> = HashMap::new();
        for (i, node) in graph.nodes().iter().enumerate() {
            if let NodeKind::Loop(cfg) = &node.kind {
                let body = graph.loop_body(cfg);
                excluded.extend(body.iter().copied());
                loop_bodies.insert(i, body);
            }
        }

        let order = match crate::schedule::topo_order(&graph, &excluded) {
            Ok(order) => order,
            Err(e) => {
                shared.set_status(SessionStatus::Failed);
                self.bus.emit(
                    session_id,
                    EventKind::WorkflowFailed {
                        error: e.to_string(),
                        node_statuses: shared.statuses(),
                    },
                );
                self.bus.close_session(session_id);
                return;
            }
        };

        for &i in &unreachable {
            let mut state = NodeState::idle();
            state.mark_skipped();
            shared.write_node(&graph.node(i).id, state);
        }

        let ctx = RunContext {
            graph: &graph,
            session_id,
            input: &input,
            executor: &self.executor,
            breakers: &self.breakers,
            retry: &self.config.retry,
            bus: &self.bus,
            cancel: cancel.clone(),
            loop_ceiling: self.config.loop_ceiling,
            chunk_attribution: None,
        };

        let mut outputs: HashMap<NodeIndex, NodeOutput> = HashMap::new();
        let mut disabled_edges: HashSet<usize> = HashSet::new();
        let mut completed: HashSet<NodeIndex> = HashSet::new();
        let mut cancelled = false;
        let mut first_failure: Option<String> = None;

        for &idx in &order {
            // Pre-dispatch cancellation point.
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            let node = graph.node(idx);
            if !is_live(&graph, idx, &completed, &disabled_edges) {
                let mut state = NodeState::idle();
                state.mark_skipped();
                shared.write_node(&node.id, state);
                self.bus.emit(
                    session_id,
                    EventKind::NodeSkipped {
                        node_id: node.id.clone(),
                    },
                );
                continue;
            }

            let mut state = NodeState::idle();
            state.mark_running();
            shared.write_node(&node.id, state.clone());
            self.bus.emit(
                session_id,
                EventKind::NodeStarted {
                    node_id: node.id.clone(),
                    node_type: node.kind.name().to_string(),
                },
            );

            match runners::run_node(&ctx, &mut outputs, idx).await {
                Ok(outcome) => {
                    let text = outcome.output.text().to_string();
                    let duration_ms = state
                        .started_at
                        .map(|t| (chrono::Utc::now() - t).num_milliseconds().max(0) as u64)
                        .unwrap_or(0);
                    state.warnings = outcome.warnings.clone();
                    state.iterations = outcome.iterations;
                    state.exit_reason = outcome.exit_reason;
                    state.mark_completed(text.clone());
                    shared.write_node(&node.id, state);

                    if let Some(verdict) = outcome.branch {
                        disable_unchosen_branch(&graph, idx, verdict, &mut disabled_edges);
                    }
                    if let Some(body) = loop_bodies.get(&idx) {
                        self.settle_loop_body(&graph, &shared, body, &outputs, outcome.iterations);
                    }

                    outputs.insert(idx, outcome.output);
                    completed.insert(idx);
                    self.bus.emit(
                        session_id,
                        EventKind::NodeCompleted {
                            node_id: node.id.clone(),
                            output: text,
                            duration_ms,
                            warnings: outcome.warnings,
                        },
                    );
                }
                Err(CascadeError::Cancelled) => {
                    state.mark_cancelled();
                    shared.write_node(&node.id, state);
                    self.bus.emit(
                        session_id,
                        EventKind::NodeCancelled {
                            node_id: node.id.clone(),
                        },
                    );
                    cancelled = true;
                    break;
                }
                Err(e) => {
                    tracing::error!(session = %session_id, node = %node.id, error = %e, "node failed");
                    state.mark_failed(NodeError::from_error(&e));
                    shared.write_node(&node.id, state);
                    self.bus.emit(
                        session_id,
                        EventKind::NodeFailed {
                            node_id: node.id.clone(),
                            error: e.to_string(),
                        },
                    );
                    if first_failure.is_none() {
                        first_failure = Some(format!("node '{}' failed: {e}", node.id));
                    }
                    // Dependents starve via the liveness rule; independent
                    // branches keep running.
                }
            }
        }

        // Nodes never dispatched settle as Skipped so nothing is left
        // permanently Idle or Running.
        {
            let mut nodes = lock(&shared.nodes);
            for state in nodes.values_mut() {
                if !state.status.is_terminal() {
                    state.mark_skipped();
                }
            }
        }

        let statuses = shared.statuses();
        if cancelled {
            shared.set_status(SessionStatus::Cancelled);
            self.bus.emit(
                session_id,
                EventKind::WorkflowCancelled {
                    node_statuses: statuses,
                },
            );
            tracing::info!(session = %session_id, "session cancelled");
        } else if let Some(error) = first_failure {
            shared.set_status(SessionStatus::Failed);
            self.bus.emit(
                session_id,
                EventKind::WorkflowFailed {
                    error,
                    node_statuses: statuses,
                },
            );
        } else {
            shared.set_status(SessionStatus::Completed);
            self.bus.emit(
                session_id,
                EventKind::WorkflowCompleted {
                    duration_ms: started.elapsed().as_millis() as u64,
                    node_statuses: statuses,
                },
            );
        }
        self.bus.close_session(session_id);
    }

    /// Write terminal states for a settled loop's body nodes. Their activity
    /// already streamed under the loop node's id; here they just stop being
    /// Idle.
    fn settle_loop_body(
        &self,
        graph: &WorkflowGraph,
        shared: &SessionShared,
        body: &[NodeIndex],
        outputs: &HashMap<NodeIndex, NodeOutput>,
        iterations: Option<u32>,
    ) {
        let ran = iterations.unwrap_or(0) > 0;
        for &body_idx in body {
            let id = &graph.node(body_idx).id;
            let mut state = shared.node(id).unwrap_or_else(NodeState::idle);
            if state.status.is_terminal() {
                continue;
            }
            if ran {
                if let Some(output) = outputs.get(&body_idx) {
                    state.mark_completed(output.text().to_string());
                } else {
                    state.mark_skipped();
                }
            } else {
                state.mark_skipped();
            }
            shared.write_node(id, state);
        }
    }
}

/// A node is live when it is an entry node or at least one enabled incoming
/// edge comes from a completed node.
fn is_live(
    graph: &WorkflowGraph,
    idx: NodeIndex,
    completed: &HashSet<NodeIndex>,
    disabled_edges: &HashSet<usize>,
) -> bool {
    if matches!(graph.node(idx).kind, NodeKind::Input) {
        return true;
    }
    graph.incoming(idx).iter().any(|&e| {
        !disabled_edges.contains(&e) && completed.contains(&graph.edge(e).source)
    })
}

/// After a condition settles, its unchosen handle's edges stop carrying
/// liveness.
fn disable_unchosen_branch(
    graph: &WorkflowGraph,
    idx: NodeIndex,
    verdict: bool,
    disabled_edges: &mut HashSet<usize>,
) {
    let unchosen = if verdict { "false" } else { "true" };
    for &e in graph.outgoing(idx) {
        if graph.edge(e).source_handle.as_deref() == Some(unchosen) {
            disabled_edges.insert(e);
        }
    }
}
