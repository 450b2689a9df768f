//! Recovery arbitration
//!
//! Turns a resolved revision collation into 1 to 3 ranked recovery solutions,
//! each with a dependency-ordered recovery plan. Every solution that reaches
//! the output satisfies all active binding constraints, except the single
//! over-constrained fallback which says so explicitly.

pub mod candidates;
pub mod engine;
pub mod plan;
pub mod scoring;

pub use candidates::{generate_candidates, over_constrained_fallback, Candidate, CandidateAction, CandidateSet};
pub use engine::{
    ArbitrationEngine, ArbitratorOutput, RecoverySolution, MAX_SOLUTIONS, OVER_CONSTRAINED_CONFIDENCE,
};
pub use plan::{build_plan, critical_path, Contingency, RecoveryPlan, RecoveryStep};
pub use scoring::{rank_order, safety_baseline, score_candidate, AxisScores};
