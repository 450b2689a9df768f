//! OpenTelemetry-Compatible Span Helpers
//!
//! Structured `tracing` span builders for the recovery pipeline. All spans use
//! dot-notation field names compatible with OpenTelemetry semantic conventions.
//!
//! # Span Hierarchy
//!
//! ```text
//! recovery.run                 (root, one per disruption scenario)
//!   ├─ recovery.phase          (initial / revision fan-out)
//!   │   └─ recovery.agent      (one agent invocation)
//!   │       └─ recovery.retrieval  (batch-get of context data)
//!   └─ recovery.arbitration    (conflict resolution + ranking)
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use coordination::otel;
//!
//! let span = otel::phase_span("run-1", PhaseTag::Initial, 7);
//! let guard = span.enter();
//! // ... fan out ...
//! otel::record_phase_result(&span, 6, 1, 0, 2300);
//! drop(guard);
//! ```

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::state::types::{AgentId, PhaseTag};

// ── Span Name Constants ──────────────────────────────────────────────

/// Root span for one disruption-handling run.
pub const SPAN_RUN: &str = "recovery.run";

/// One collation phase (fan-out to the roster).
pub const SPAN_PHASE: &str = "recovery.phase";

/// A single agent invocation.
pub const SPAN_AGENT: &str = "recovery.agent";

/// Conflict resolution and solution ranking.
pub const SPAN_ARBITRATION: &str = "recovery.arbitration";

/// Batch retrieval against the backing store.
pub const SPAN_RETRIEVAL: &str = "recovery.retrieval";

// ── Field Name Constants ─────────────────────────────────────────────

pub const FIELD_RUN_ID: &str = "recovery.run.id";
pub const FIELD_SCENARIO_ID: &str = "recovery.scenario.id";
pub const FIELD_PHASE: &str = "recovery.phase";
pub const FIELD_AGENT: &str = "recovery.agent";
pub const FIELD_MODEL: &str = "recovery.model";
pub const FIELD_STATUS: &str = "recovery.status";
pub const FIELD_SUCCESS_COUNT: &str = "recovery.success_count";
pub const FIELD_TIMEOUT_COUNT: &str = "recovery.timeout_count";
pub const FIELD_ERROR_COUNT: &str = "recovery.error_count";
pub const FIELD_CONFLICT_COUNT: &str = "recovery.conflict_count";
pub const FIELD_SOLUTION_COUNT: &str = "recovery.solution_count";
pub const FIELD_TABLE: &str = "recovery.retrieval.table";
pub const FIELD_KEY_COUNT: &str = "recovery.retrieval.key_count";
pub const FIELD_MISSING_COUNT: &str = "recovery.retrieval.missing_count";
pub const FIELD_DURATION_MS: &str = "recovery.duration_ms";

// ── Span Builders ────────────────────────────────────────────────────

/// Create a root span for one run.
///
/// Fields filled later via [`record_run_result`]: `recovery.status`, duration.
pub fn run_span(run_id: &str, scenario_id: &str) -> Span {
    tracing::info_span!(
        "recovery.run",
        "recovery.run.id" = %run_id,
        "recovery.scenario.id" = %scenario_id,
        "recovery.status" = tracing::field::Empty,
        "recovery.duration_ms" = tracing::field::Empty,
    )
}

/// Record the final status on a run span.
pub fn record_run_result(span: &Span, status: &str, duration_ms: u64) {
    span.record("recovery.status", status);
    span.record("recovery.duration_ms", duration_ms);
}

/// Create a span for one collation phase.
pub fn phase_span(run_id: &str, phase: PhaseTag, roster_size: usize) -> Span {
    tracing::info_span!(
        "recovery.phase",
        "recovery.run.id" = %run_id,
        "recovery.phase" = %phase,
        "recovery.agent_count" = roster_size as u64,
        "recovery.success_count" = tracing::field::Empty,
        "recovery.timeout_count" = tracing::field::Empty,
        "recovery.error_count" = tracing::field::Empty,
        "recovery.duration_ms" = tracing::field::Empty,
    )
}

/// Record per-status counts for a completed phase.
pub fn record_phase_result(
    span: &Span,
    success_count: usize,
    timeout_count: usize,
    error_count: usize,
    duration_ms: u64,
) {
    span.record("recovery.success_count", success_count as u64);
    span.record("recovery.timeout_count", timeout_count as u64);
    span.record("recovery.error_count", error_count as u64);
    span.record("recovery.duration_ms", duration_ms);
}

/// Create a span for one agent invocation.
pub fn agent_span(agent: AgentId, phase: PhaseTag, model: &str) -> Span {
    tracing::info_span!(
        "recovery.agent",
        "recovery.agent" = %agent,
        "recovery.phase" = %phase,
        "recovery.model" = %model,
        "recovery.status" = tracing::field::Empty,
        "recovery.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_agent_result(span: &Span, status: &str, duration_ms: u64) {
    span.record("recovery.status", status);
    span.record("recovery.duration_ms", duration_ms);
}

/// Create a span for arbitration over a revision collation.
pub fn arbitration_span(run_id: &str, success_count: usize) -> Span {
    tracing::info_span!(
        "recovery.arbitration",
        "recovery.run.id" = %run_id,
        "recovery.success_count" = success_count as u64,
        "recovery.conflict_count" = tracing::field::Empty,
        "recovery.solution_count" = tracing::field::Empty,
        "recovery.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_arbitration_result(
    span: &Span,
    conflict_count: usize,
    solution_count: usize,
    duration_ms: u64,
) {
    span.record("recovery.conflict_count", conflict_count as u64);
    span.record("recovery.solution_count", solution_count as u64);
    span.record("recovery.duration_ms", duration_ms);
}

/// Create a span for a chunked batch-get.
pub fn retrieval_span(table: &str, key_count: usize) -> Span {
    tracing::debug_span!(
        "recovery.retrieval",
        "recovery.retrieval.table" = %table,
        "recovery.retrieval.key_count" = key_count as u64,
        "recovery.retrieval.missing_count" = tracing::field::Empty,
        "recovery.duration_ms" = tracing::field::Empty,
    )
}

pub fn record_retrieval_result(span: &Span, missing_count: usize, duration_ms: u64) {
    span.record("recovery.retrieval.missing_count", missing_count as u64);
    span.record("recovery.duration_ms", duration_ms);
}

// ── Phase Summary ────────────────────────────────────────────────────

/// Per-status tallies for one phase, logged alongside the phase span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSummary {
    pub success: usize,
    pub timeout: usize,
    pub error: usize,
}

impl PhaseSummary {
    pub fn total(&self) -> usize {
        self.success + self.timeout + self.error
    }

    /// Fraction of invocations that succeeded (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        if self.total() == 0 {
            return 0.0;
        }
        self.success as f64 / self.total() as f64
    }
}

impl std::fmt::Display for PhaseSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "success={} timeout={} error={}",
            self.success, self.timeout, self.error
        )
    }
}
