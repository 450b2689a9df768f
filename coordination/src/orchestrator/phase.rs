//! Run phase machine and its transition log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Phase of one recovery run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Run accepted, nothing invoked yet.
    Idle,
    /// Every agent assesses the scenario independently.
    Initial,
    /// Every agent revises with its peers' initial responses.
    Revision,
    /// Conflicts resolved and solutions ranked.
    Arbitration,
    /// Output produced.
    Done,
    /// Not enough data to produce a safe recommendation.
    DataUnavailable,
    /// Stopped by the caller.
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DataUnavailable | Self::Cancelled)
    }

    /// Valid transitions from this phase.
    pub fn valid_transitions(self) -> &'static [RunPhase] {
        match self {
            Self::Idle => &[Self::Initial, Self::Cancelled],
            Self::Initial => &[Self::Revision, Self::DataUnavailable, Self::Cancelled],
            Self::Revision => &[Self::Arbitration, Self::DataUnavailable, Self::Cancelled],
            Self::Arbitration => &[Self::Done, Self::Cancelled],
            Self::Done | Self::DataUnavailable | Self::Cancelled => &[],
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initial => write!(f, "initial"),
            Self::Revision => write!(f, "revision"),
            Self::Arbitration => write!(f, "arbitration"),
            Self::Done => write!(f, "done"),
            Self::DataUnavailable => write!(f, "data_unavailable"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A phase transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub from: RunPhase,
    pub to: RunPhase,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

/// Error for invalid state transitions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct TransitionError {
    pub from: RunPhase,
    pub to: RunPhase,
}

/// Tracks the current phase of a run and every transition taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseMachine {
    phase: RunPhase,
    transitions: Vec<PhaseTransition>,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self {
            phase: RunPhase::Idle,
            transitions: Vec::new(),
        }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn transitions(&self) -> &[PhaseTransition] {
        &self.transitions
    }

    pub fn into_transitions(self) -> Vec<PhaseTransition> {
        self.transitions
    }

    /// Move to `to`, recording why.
    pub fn advance(&mut self, to: RunPhase, reason: &str) -> Result<(), TransitionError> {
        if !self.phase.valid_transitions().contains(&to) {
            return Err(TransitionError {
                from: self.phase,
                to,
            });
        }
        tracing::debug!(from = %self.phase, to = %to, reason, "Run phase transition");
        self.transitions.push(PhaseTransition {
            from: self.phase,
            to,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        self.phase = to;
        Ok(())
    }
}
