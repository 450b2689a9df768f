//! Reasoner contract
//!
//! A [`Reasoner`] turns a scenario plus assembled data into one agent's
//! structured opinion. The coordination layer never inspects how; concrete
//! implementations (HTTP model endpoints, test doubles) live with the caller.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::state::types::{AgentId, AgentResponse, DisruptionScenario, ImpactAssessment, PhaseTag};

#[derive(Debug, Clone, Error)]
pub enum ReasonerError {
    #[error("reasoner request failed: {0}")]
    RequestFailed(String),

    #[error("malformed reasoner output: {0}")]
    Malformed(String),

    #[error("rate limited: retry after {0:?}")]
    RateLimited(Duration),

    #[error("reasoner unavailable: {0}")]
    Unavailable(String),
}

pub type ReasonerResult<T> = Result<T, ReasonerError>;

/// Everything a reasoner sees for one (agent, phase) invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasonerRequest {
    pub agent: AgentId,
    pub phase: PhaseTag,
    pub model: String,
    /// Tried in order if `model` fails
    #[serde(default)]
    pub fallback_models: Vec<String>,
    pub scenario: DisruptionScenario,
    /// Data retrieved for the agent, keyed by source name
    pub context: serde_json::Value,
    /// This agent's initial-phase response, on revision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_prior: Option<AgentResponse>,
    /// Other agents' initial-phase responses, on revision
    #[serde(default)]
    pub peers: Vec<AgentResponse>,
}

impl ReasonerRequest {
    pub fn is_revision(&self) -> bool {
        self.phase == PhaseTag::Revision
    }

    /// Models in the order they should be tried
    pub fn model_chain(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.model.as_str()).chain(self.fallback_models.iter().map(String::as_str))
    }
}

/// Structured output every reasoner must produce
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ReasonerOpinion {
    /// Recommended course of action in one or two sentences
    pub recommendation: String,
    /// Why, citing the data used
    pub reasoning: String,
    /// Confidence between 0.0 and 1.0
    pub confidence: f64,
    /// Hard limits the recovery must respect (safety agents only)
    #[serde(default)]
    pub binding_constraints: Vec<String>,
    #[serde(default)]
    pub impact: Option<ImpactAssessment>,
    /// Data points the reasoner relied on
    #[serde(default)]
    pub extracted_context: Option<serde_json::Value>,
}

/// JSON schema of [`ReasonerOpinion`], for embedding in prompts
pub fn opinion_schema() -> serde_json::Value {
    let schema = schemars::schema_for!(ReasonerOpinion);
    serde_json::to_value(schema).unwrap_or(serde_json::Value::Null)
}

/// Capability that produces an agent's opinion
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn invoke(&self, request: &ReasonerRequest) -> ReasonerResult<ReasonerOpinion>;
}
