//! Workflow execution engine: validation, scheduling, typed node runners,
//! resilience, and session event streaming.
//!
//! This crate implements the core Cascade runner: graph compilation from the
//! JSON submission format, the built-in lint rules, deterministic topological
//! scheduling, per-node-type execution (task, fan-out, condition, loop,
//! merge), retry/circuit-breaker wrapping of every external call, and the
//! per-session event bus.

pub mod engine;
pub mod events;
pub mod executor;
pub mod graph;
pub mod predicate;
pub mod resilience;
pub mod runners;
pub mod schedule;
pub mod template;
pub mod validation;

pub use engine::{EngineConfig, ExecutionEngine, SessionSnapshot};
pub use events::{ChunkSink, EventBus, EventKind, ExecutionEvent};
pub use executor::{TaskExecutor, TaskRequest};
pub use graph::{
    ConditionConfig, Edge, EdgeSpec, FanOutConfig, FanOutTarget, LoopConfig, MergeConfig,
    MergeStrategy, Node, NodeIndex, NodeKind, NodeSpec, TaskConfig, WorkflowDocument,
    WorkflowGraph,
};
pub use predicate::{
    evaluate_expression, parse_expression, Clause, ExpressionExpr, LengthOp, Operator, Predicate,
};
pub use resilience::{
    Admission, BackoffPolicy, BreakerRegistry, BreakerState, CircuitBreaker, RetryPolicy,
};
pub use runners::{BranchResult, NodeOutput, RunOutcome};
pub use schedule::{body_order, topo_order};
pub use template::{resolve as resolve_template, TemplateContext};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};

pub use cascade_types::{
    CascadeError, ErrorKind, ExitReason, NodeError, NodeState, NodeStatus, Result, SessionStatus,
    TokenUsage,
};
