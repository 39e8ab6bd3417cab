//! Session-scoped event stream for observability.
//!
//! Each session owns a [`tokio::sync::broadcast`] channel. Subscribers see
//! events in emission order; for any node, `NodeStarted` precedes every
//! `OutputChunk` which precede the terminal event. Events emitted with no
//! active subscriber are silently dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use cascade_types::{CascadeError, NodeStatus, Result, SessionStatus};

/// What happened, without the session envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    NodeStarted {
        node_id: String,
        node_type: String,
    },
    /// Incremental output from a running node, forwarded from the executor.
    OutputChunk {
        node_id: String,
        chunk: String,
    },
    NodeCompleted {
        node_id: String,
        output: String,
        duration_ms: u64,
        warnings: Vec<String>,
    },
    NodeFailed {
        node_id: String,
        error: String,
    },
    NodeSkipped {
        node_id: String,
    },
    /// A session cancel interrupted this node while it was running.
    NodeCancelled {
        node_id: String,
    },
    WorkflowCompleted {
        duration_ms: u64,
        node_statuses: HashMap<String, NodeStatus>,
    },
    WorkflowFailed {
        error: String,
        node_statuses: HashMap<String, NodeStatus>,
    },
    WorkflowCancelled {
        node_statuses: HashMap<String, NodeStatus>,
    },
}

impl EventKind {
    /// The terminal session status this event announces, if any.
    pub fn session_terminal(&self) -> Option<SessionStatus> {
        match self {
            EventKind::WorkflowCompleted { .. } => Some(SessionStatus::Completed),
            EventKind::WorkflowFailed { .. } => Some(SessionStatus::Failed),
            EventKind::WorkflowCancelled { .. } => Some(SessionStatus::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Per-session broadcast channels keyed by session id.
pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<ExecutionEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        EventBus {
            capacity,
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<ExecutionEvent>>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Create the channel for a new session. Idempotent.
    pub fn open_session(&self, session_id: &str) {
        self.lock()
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0);
    }

    /// Drop the channel once a session reaches a terminal state. Existing
    /// subscribers drain whatever is already buffered.
    pub fn close_session(&self, session_id: &str) {
        self.lock().remove(session_id);
    }

    /// Emit an event on a session's channel. Unknown sessions and sessions
    /// with no subscribers drop the event.
    pub fn emit(&self, session_id: &str, kind: EventKind) {
        let sender = self.lock().get(session_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(ExecutionEvent {
                session_id: session_id.to_string(),
                timestamp: Utc::now(),
                kind,
            });
        }
    }

    /// Subscribe to a session's events as a stream. Multiple subscribers each
    /// receive every event emitted after they subscribe.
    pub fn subscribe(&self, session_id: &str) -> Result<BroadcastStream<ExecutionEvent>> {
        let sender = self.lock().get(session_id).cloned();
        match sender {
            Some(sender) => Ok(BroadcastStream::new(sender.subscribe())),
            None => Err(CascadeError::UnknownSession(session_id.to_string())),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(256)
    }
}

/// Handle a task executor uses to stream incremental output. Chunks become
/// `OutputChunk` events attributed to the running node.
#[derive(Clone)]
pub struct ChunkSink {
    sender: Option<broadcast::Sender<ExecutionEvent>>,
    session_id: String,
    node_id: String,
}

impl ChunkSink {
    pub(crate) fn new(bus: &EventBus, session_id: &str, node_id: &str) -> Self {
        ChunkSink {
            sender: bus.lock().get(session_id).cloned(),
            session_id: session_id.to_string(),
            node_id: node_id.to_string(),
        }
    }

    /// A sink that discards chunks. Useful in executor tests.
    pub fn discard() -> Self {
        ChunkSink {
            sender: None,
            session_id: String::new(),
            node_id: String::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn send(&self, chunk: impl Into<String>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(ExecutionEvent {
                session_id: self.session_id.clone(),
                timestamp: Utc::now(),
                kind: EventKind::OutputChunk {
                    node_id: self.node_id.clone(),
                    chunk: chunk.into(),
                },
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn emit_and_receive_on_session_channel() {
        let bus = EventBus::new(16);
        bus.open_session("s1");
        let mut stream = bus.subscribe("s1").unwrap();

        bus.emit(
            "s1",
            EventKind::NodeStarted {
                node_id: "plan".into(),
                node_type: "task".into(),
            },
        );

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.session_id, "s1");
        match event.kind {
            EventKind::NodeStarted { node_id, node_type } => {
                assert_eq!(node_id, "plan");
                assert_eq!(node_type, "task");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = EventBus::new(16);
        bus.open_session("a");
        bus.open_session("b");
        let mut stream_a = bus.subscribe("a").unwrap();
        let mut stream_b = bus.subscribe("b").unwrap();

        bus.emit("a", EventKind::NodeSkipped { node_id: "x".into() });
        bus.emit("b", EventKind::NodeSkipped { node_id: "y".into() });

        let ea = stream_a.next().await.unwrap().unwrap();
        let eb = stream_b.next().await.unwrap().unwrap();
        assert_eq!(ea.session_id, "a");
        assert_eq!(eb.session_id, "b");
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_events() {
        let bus = EventBus::new(16);
        bus.open_session("s");
        let mut s1 = bus.subscribe("s").unwrap();
        let mut s2 = bus.subscribe("s").unwrap();

        bus.emit("s", EventKind::NodeSkipped { node_id: "n".into() });

        let e1 = s1.next().await.unwrap().unwrap();
        let e2 = s2.next().await.unwrap().unwrap();
        let json1 = serde_json::to_string(&e1.kind).unwrap();
        let json2 = serde_json::to_string(&e2.kind).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new(16);
        bus.open_session("s");
        bus.emit(
            "s",
            EventKind::WorkflowFailed {
                error: "boom".into(),
                node_statuses: HashMap::new(),
            },
        );
    }

    #[test]
    fn subscribe_unknown_session_errors() {
        let bus = EventBus::new(16);
        assert!(matches!(
            bus.subscribe("ghost").unwrap_err(),
            CascadeError::UnknownSession(_)
        ));
    }

    #[tokio::test]
    async fn chunk_sink_emits_output_chunks() {
        let bus = EventBus::new(16);
        bus.open_session("s");
        let mut stream = bus.subscribe("s").unwrap();

        let sink = ChunkSink::new(&bus, "s", "plan");
        sink.send("partial ");
        sink.send("output");

        let first = stream.next().await.unwrap().unwrap();
        match first.kind {
            EventKind::OutputChunk { node_id, chunk } => {
                assert_eq!(node_id, "plan");
                assert_eq!(chunk, "partial ");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn event_serialization_round_trip() {
        let event = ExecutionEvent {
            session_id: "s".into(),
            timestamp: Utc::now(),
            kind: EventKind::NodeCompleted {
                node_id: "plan".into(),
                output: "done".into(),
                duration_ms: 42,
                warnings: vec![],
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: ExecutionEvent = serde_json::from_str(&json).unwrap();
        match back.kind {
            EventKind::NodeCompleted { duration_ms, .. } => assert_eq!(duration_ms, 42),
            other => panic!("unexpected variant after round-trip: {other:?}"),
        }
    }
}
