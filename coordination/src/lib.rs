//! Disruption Recovery Coordination Library
//!
//! This library coordinates a fixed roster of independent domain agents that
//! each assess a disruption, reconciles their conflicting recommendations, and
//! produces 1 to 3 ranked recovery solutions with a full audit trail.
//!
//! # Pipeline
//!
//! ```text
//! RecoveryService / PhaseController
//!   ├─ Initial phase   ─ AgentInvoker ×N ─ BatchRetriever + Reasoner ─▶ Collation₁
//!   ├─ Revision phase  ─ AgentInvoker ×N (peers from Collation₁)     ─▶ Collation₂
//!   └─ Arbitration     ─ conflict extraction/resolution ─ candidates ─▶ ArbitratorOutput
//! ```
//!
//! Safety agents (crew compliance, maintenance, regulatory) emit binding
//! constraints; business agents (network, guest experience, cargo, finance)
//! emit proposals. Safety constraints always win and every solution in the
//! output satisfies them, except the single over-constrained fallback which
//! reports `constraints_satisfied = false`.
//!
//! # Features
//!
//! - `heavy-state`: RocksDB [`state::StateStore`] acting as record backend,
//!   audit sink and run-status store

#![allow(clippy::uninlined_format_args)]

pub mod arbitration;
pub mod config;
pub mod conflict;
pub mod invoker;
pub mod orchestrator;
pub mod otel;
pub mod reasoner;
pub mod retrieval;
pub mod state;

// Re-export configuration types
pub use config::{AgentSpec, ConfigError, ConfigResult, ContextSource, OrchestratorConfig, RetrievalConfig};

// Re-export data model
pub use state::types::{
    AgentId, AgentKind, AgentResponse, Collation, DisruptionScenario, ImpactAssessment, PhaseTag,
    ResponseStatus, RunId, ScenarioField,
};

// Re-export reasoner contract
pub use reasoner::{Reasoner, ReasonerError, ReasonerOpinion, ReasonerRequest, ReasonerResult};

// Re-export retrieval types
pub use retrieval::{
    BackendError, BatchRetriever, IndexBuildReport, IndexBuildRunner, IndexDefinition,
    InMemoryBackend, KvBackend, ResumeMode, RetrievalError, RetrievalOutcome,
};

// Re-export orchestration types
pub use invoker::AgentInvoker;
pub use orchestrator::{
    AuditRecord, AuditSink, JsonlAuditSink, OrchestratorError, OrchestratorResult, PhaseController,
    RecoveryService, RequestId, RunOutcome, RunStatus, RunStatusReport,
};

// Re-export arbitration types
pub use arbitration::{ArbitrationEngine, ArbitratorOutput, RecoveryPlan, RecoverySolution};
pub use conflict::{BindingConstraint, Conflict, ConflictType, ConstraintKind, Severity};

#[cfg(feature = "heavy-state")]
pub use state::{SharedStateStore, StateStore, StoreError};
