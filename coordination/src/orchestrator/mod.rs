//! Run orchestration
//!
//! - [`phase`]: the run phase machine and its transition log
//! - [`controller`]: fan-out per phase, barriers, escalation to data-unavailable
//! - [`audit`]: sealed audit records and their sinks
//! - [`service`]: sync and submit/poll entrypoints

pub mod audit;
pub mod controller;
pub mod phase;
pub mod service;

pub use audit::{AuditError, AuditRecord, AuditResult, AuditSink, JsonlAuditSink};
pub use controller::{PhaseController, RunOutcome, RunStatus};
pub use phase::{PhaseMachine, PhaseTransition, RunPhase, TransitionError};
pub use service::{RecoveryService, RequestId, RunStatusReport};

use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("unknown request: {0}")]
    UnknownRequest(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
