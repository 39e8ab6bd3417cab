//! The external task boundary.
//!
//! The engine never talks to models, queues, or processes directly; every
//! Task and FanOut branch goes through a [`TaskExecutor`] supplied at engine
//! construction. Implementations map resolved input text to output text and
//! may stream partial output through the [`ChunkSink`].

use async_trait::async_trait;

use cascade_types::Result;

use crate::events::ChunkSink;

/// One unit of work handed to the executor.
#[derive(Debug, Clone)]
pub struct TaskRequest {
    /// Node (or fan-out branch) this work belongs to.
    pub node_id: String,
    /// Resource class, used for circuit-breaker bookkeeping upstream.
    pub resource: String,
    /// Fully resolved input text.
    pub input: String,
}

/// Executes task work outside the engine.
///
/// Errors should use the transport/timeout variants of
/// [`cascade_types::CascadeError`] for transient failures so the retry layer
/// can distinguish them from permanent rejections.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: TaskRequest, chunks: &ChunkSink) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upcase;

    #[async_trait]
    impl TaskExecutor for Upcase {
        async fn execute(&self, request: TaskRequest, chunks: &ChunkSink) -> Result<String> {
            let out = request.input.to_uppercase();
            chunks.send(out.clone());
            Ok(out)
        }
    }

    #[tokio::test]
    async fn executor_receives_resolved_input() {
        let executor = Upcase;
        let request = TaskRequest {
            node_id: "n".into(),
            resource: "default".into(),
            input: "hello".into(),
        };
        let out = executor
            .execute(request, &ChunkSink::discard())
            .await
            .unwrap();
        assert_eq!(out, "HELLO");
    }
}
