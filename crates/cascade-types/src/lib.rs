//! Shared types, errors, and per-node state for the Cascade workflow engine.
//!
//! This crate provides the foundational types used across the Cascade crates:
//! - `CascadeError` — unified error taxonomy
//! - `NodeState` / `NodeStatus` — per-node execution state
//! - `SessionStatus` — terminal/non-terminal session states
//! - `TokenUsage` — optional cost metadata reported by task executors

use serde::{Deserialize, Serialize};

/// Unified error type for all Cascade subsystems.
#[derive(Debug, thiserror::Error)]
pub enum CascadeError {
    // === Validation ===
    #[error("Workflow validation failed: {0}")]
    Validation(String),

    // === Task execution ===
    #[error("Task on resource '{resource}' timed out after {timeout_ms}ms")]
    TaskTimeout { resource: String, timeout_ms: u64 },

    #[error("Transport failure on resource '{resource}': {message}")]
    TaskTransport { resource: String, message: String },

    #[error("Resource '{resource}' rejected the task: {message}")]
    TaskRejected { resource: String, message: String },

    #[error("Circuit for resource '{resource}' is open, retry after {cooldown_ms}ms")]
    CircuitOpen { resource: String, cooldown_ms: u64 },

    #[error("Retries exhausted for node '{node}' after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        node: String,
        attempts: usize,
        last_error: String,
    },

    // === Session lifecycle ===
    #[error("Session was cancelled")]
    Cancelled,

    #[error("Unknown session '{0}'")]
    UnknownSession(String),

    #[error("Session '{0}' already exists; create a new session instead of re-running")]
    SessionExists(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    // === Generic ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl CascadeError {
    /// Returns `true` if the error is transient and the operation may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CascadeError::TaskTimeout { .. } | CascadeError::TaskTransport { .. }
        )
    }

    /// Returns `true` if the error is permanent and retrying will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CascadeError::TaskRejected { .. }
                | CascadeError::Validation(_)
                | CascadeError::Cancelled
        )
    }

    /// The short kind tag carried on `NodeFailed` events.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CascadeError::Validation(_) => ErrorKind::Validation,
            CascadeError::TaskTimeout { .. } => ErrorKind::Timeout,
            CascadeError::TaskTransport { .. } => ErrorKind::Transport,
            CascadeError::TaskRejected { .. } => ErrorKind::Rejected,
            CascadeError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            CascadeError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            CascadeError::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Other,
        }
    }
}

/// A convenience alias for `Result<T, CascadeError>`.
pub type Result<T> = std::result::Result<T, CascadeError>;

/// Coarse error classification carried on events and node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Timeout,
    Transport,
    Rejected,
    CircuitOpen,
    RetriesExhausted,
    Cancelled,
    Other,
}

// ---------------------------------------------------------------------------
// Node and session status
// ---------------------------------------------------------------------------

/// Per-node execution status.
///
/// `Cancelled` is reached only when a session cancel interrupts a node that
/// was still `Running`; a node skipped because its branch was not chosen or
/// its upstream failed is `Skipped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

impl NodeStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, NodeStatus::Idle | NodeStatus::Running)
    }
}

/// Session status. A session reaches exactly one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionStatus::Pending | SessionStatus::Running)
    }
}

/// Why a Loop node stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// The exit predicate held.
    Converged,
    /// The iteration budget ran out before the exit predicate held.
    MaxIterations,
}

// ---------------------------------------------------------------------------
// TokenUsage — optional cost metadata
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cost_usd: Option<f64>,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd = match (self.cost_usd, other.cost_usd) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
    }
}

// ---------------------------------------------------------------------------
// NodeError — kind + message recorded on a failed node
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn from_error(err: &CascadeError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeState — one row of the per-session state table
// ---------------------------------------------------------------------------

/// Execution state of a single node within a session.
///
/// The state table has exactly one writer (the engine's dispatch loop);
/// `output` becomes immutable once the node is `Completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub status: NodeStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub elapsed_ms: Option<u64>,
    pub output: Option<String>,
    #[serde(default)]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub error: Option<NodeError>,
    /// Non-fatal conditions (missing merge inputs, partial fan-out failures).
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Loop nodes only: iterations actually run.
    #[serde(default)]
    pub iterations: Option<u32>,
    /// Loop nodes only: why iteration stopped.
    #[serde(default)]
    pub exit_reason: Option<ExitReason>,
}

impl NodeState {
    pub fn idle() -> Self {
        Self {
            status: NodeStatus::Idle,
            started_at: None,
            elapsed_ms: None,
            output: None,
            token_usage: None,
            error: None,
            warnings: Vec::new(),
            iterations: None,
            exit_reason: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = NodeStatus::Running;
        self.started_at = Some(chrono::Utc::now());
    }

    pub fn mark_completed(&mut self, output: String) {
        self.status = NodeStatus::Completed;
        self.output = Some(output);
        self.finish_clock();
    }

    pub fn mark_failed(&mut self, error: NodeError) {
        self.status = NodeStatus::Failed;
        self.error = Some(error);
        self.finish_clock();
    }

    pub fn mark_skipped(&mut self) {
        self.status = NodeStatus::Skipped;
    }

    pub fn mark_cancelled(&mut self) {
        self.status = NodeStatus::Cancelled;
        self.finish_clock();
    }

    fn finish_clock(&mut self) {
        if let Some(started) = self.started_at {
            let elapsed = chrono::Utc::now().signed_duration_since(started);
            self.elapsed_ms = Some(elapsed.num_milliseconds().max(0) as u64);
        }
    }
}

impl Default for NodeState {
    fn default() -> Self {
        Self::idle()
    }
}
