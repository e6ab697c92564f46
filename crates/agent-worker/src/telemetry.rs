//! Structured logging setup plus span-builder helpers for the bus worker
//! process, in the dot-notation style the teacher's `coordination::otel`
//! module uses for its swarm spans.
//!
//! # Span hierarchy
//!
//! ```text
//! worker.loop          (root — one per polled task claim)
//!   ├─ worker.turn      (one engine turn, exec or app-server)
//!   └─ worker.gate      (one gate in the chain)
//! ```

use tracing::Span;

/// Initialize the process-wide subscriber. Respects `RUST_LOG`, defaulting
/// to `info` when unset — the same call the teacher's `main()` makes before
/// doing anything else.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

pub const SPAN_LOOP: &str = "worker.loop";
pub const SPAN_TURN: &str = "worker.turn";
pub const SPAN_GATE: &str = "worker.gate";

pub const FIELD_AGENT: &str = "worker.agent";
pub const FIELD_TASK_ID: &str = "task.id";
pub const FIELD_ROOT_ID: &str = "task.root_id";
pub const FIELD_GATE_NAME: &str = "worker.gate.name";
pub const FIELD_GATE_OUTCOME: &str = "worker.gate.outcome";
pub const FIELD_OUTCOME: &str = "worker.outcome";
pub const FIELD_DURATION_MS: &str = "worker.duration_ms";

/// Root span for one claimed-task-to-close cycle.
pub fn loop_span(agent: &str, task_id: &str) -> Span {
    tracing::info_span!(
        "worker.loop",
        "worker.agent" = %agent,
        "task.id" = %task_id,
        "worker.outcome" = tracing::field::Empty,
        "worker.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_loop_result(span: &Span, outcome: &str, duration_ms: u64) {
    span.record("worker.outcome", outcome);
    span.record("worker.duration_ms", duration_ms);
}

/// Span for a single engine turn (exec or app-server).
pub fn turn_span(agent: &str, task_id: &str, is_review: bool) -> Span {
    tracing::info_span!(
        "worker.turn",
        "worker.agent" = %agent,
        "task.id" = %task_id,
        "worker.turn.is_review" = is_review,
        "worker.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_turn_result(span: &Span, duration_ms: u64) {
    span.record("worker.duration_ms", duration_ms);
}

/// Span for one gate's execution within the chain.
pub fn gate_span(gate_name: &str, task_id: &str) -> Span {
    tracing::info_span!(
        "worker.gate",
        "worker.gate.name" = %gate_name,
        "task.id" = %task_id,
        "worker.gate.outcome" = tracing::field::Empty,
    )
}

pub fn record_gate_result(span: &Span, outcome: &str) {
    span.record("worker.gate.outcome", outcome);
}
