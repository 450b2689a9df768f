//! Agent invocation
//!
//! Produces exactly one [`AgentResponse`] per (agent, phase). Context is
//! assembled from the agent's configured sources, the reasoner is called under
//! the per-agent deadline, and its opinion is validated before it becomes a
//! response. Failures are folded into `Timeout` / `Error` responses; the only
//! thing surfaced separately is a storage outage, which the controller turns
//! into a run-level data-unavailable result.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info, warn, Instrument};

use crate::config::{AgentSpec, ContextSource};
use crate::otel;
use crate::reasoner::{Reasoner, ReasonerOpinion, ReasonerRequest};
use crate::retrieval::{BatchRetriever, RetrievalError};
use crate::state::types::{AgentId, AgentResponse, Collation, DisruptionScenario, PhaseTag, ResponseStatus};

/// Longest delay an agent may propose: one week
pub const MAX_ESTIMATED_DELAY_HOURS: f64 = 168.0;

/// Result of one invocation
#[derive(Debug, Clone)]
pub struct Invocation {
    pub response: AgentResponse,
    /// Set when context assembly hit a storage outage
    pub storage_error: Option<RetrievalError>,
}

impl Invocation {
    fn plain(response: AgentResponse) -> Self {
        Self {
            response,
            storage_error: None,
        }
    }
}

/// Data assembled for one agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssembledContext {
    /// Source name -> retrieved records
    pub data: Map<String, Value>,
    /// Required data that could not be retrieved
    pub missing: Vec<String>,
}

pub struct AgentInvoker {
    reasoner: Arc<dyn Reasoner>,
    retriever: BatchRetriever,
    timeout: Duration,
}

impl AgentInvoker {
    pub fn new(reasoner: Arc<dyn Reasoner>, retriever: BatchRetriever, timeout: Duration) -> Self {
        Self {
            reasoner,
            retriever,
            timeout,
        }
    }

    /// Invoke `spec.id` for `phase`. `prior` is the initial-phase collation
    /// when `phase` is `Revision`.
    pub async fn invoke(
        &self,
        spec: &AgentSpec,
        phase: PhaseTag,
        scenario: &DisruptionScenario,
        prior: Option<&Collation>,
    ) -> Invocation {
        let agent = spec.id;
        let span = otel::agent_span(agent, phase, &spec.model);
        let started = Instant::now();

        let invocation = self
            .invoke_inner(spec, phase, scenario, prior, started)
            .instrument(span.clone())
            .await;

        let status = invocation.response.status;
        otel::record_agent_result(&span, &status.to_string(), invocation.response.duration_ms);
        match status {
            ResponseStatus::Success => info!(
                agent = %agent,
                phase = %phase,
                duration_ms = invocation.response.duration_ms,
                confidence = invocation.response.confidence,
                "Agent responded"
            ),
            _ => warn!(
                agent = %agent,
                phase = %phase,
                status = %status,
                reason = %invocation.response.reasoning,
                "Agent response downgraded"
            ),
        }
        invocation
    }

    async fn invoke_inner(
        &self,
        spec: &AgentSpec,
        phase: PhaseTag,
        scenario: &DisruptionScenario,
        prior: Option<&Collation>,
        started: Instant,
    ) -> Invocation {
        let agent = spec.id;
        let elapsed_ms = |started: Instant| started.elapsed().as_millis() as u64;

        let context = match self.assemble_context(&spec.context_sources, scenario).await {
            Ok(context) => context,
            Err(err) => {
                let response = AgentResponse::error(
                    agent,
                    phase,
                    format!("context retrieval failed: {err}"),
                    elapsed_ms(started),
                );
                let storage_error = matches!(err, RetrievalError::StorageUnavailable(_)).then_some(err);
                return Invocation {
                    response,
                    storage_error,
                };
            }
        };

        if agent.is_safety() && !context.missing.is_empty() {
            let mut response = AgentResponse::error(
                agent,
                phase,
                format!(
                    "required data unavailable: {}",
                    context.missing.join(", ")
                ),
                elapsed_ms(started),
            );
            response.missing_data = context.missing;
            return Invocation::plain(response);
        }

        let context_value = Value::Object(context.data.clone());
        let request = ReasonerRequest {
            agent,
            phase,
            model: spec.model.clone(),
            fallback_models: spec.fallback_models.clone(),
            scenario: scenario.clone(),
            context: context_value.clone(),
            own_prior: prior.and_then(|c| c.get(agent)).cloned(),
            peers: prior.map(|c| c.peers_of(agent)).unwrap_or_default(),
        };

        let opinion = match tokio::time::timeout(self.timeout, self.reasoner.invoke(&request)).await {
            Err(_) => {
                return Invocation::plain(AgentResponse::timeout(
                    agent,
                    phase,
                    self.timeout.as_millis() as u64,
                ))
            }
            Ok(Err(err)) => {
                return Invocation::plain(AgentResponse::error(
                    agent,
                    phase,
                    err.to_string(),
                    elapsed_ms(started),
                ))
            }
            Ok(Ok(opinion)) => opinion,
        };

        let opinion = normalize(opinion);
        if let Err(reason) = validate_opinion(agent, &opinion) {
            return Invocation::plain(AgentResponse::error(
                agent,
                phase,
                format!("invalid reasoner output: {reason}"),
                elapsed_ms(started),
            ));
        }

        Invocation::plain(AgentResponse {
            agent,
            phase,
            recommendation: opinion.recommendation,
            reasoning: opinion.reasoning,
            confidence: opinion.confidence,
            binding_constraints: opinion.binding_constraints,
            impact: opinion.impact,
            status: ResponseStatus::Success,
            duration_ms: elapsed_ms(started),
            timestamp: Utc::now(),
            extracted_context: opinion.extracted_context.or(Some(context_value)),
            missing_data: context.missing,
        })
    }

    /// Retrieve every configured source for `scenario`.
    ///
    /// Only storage-level failures are errors. Absent data from a required
    /// source is listed in `missing`.
    pub async fn assemble_context(
        &self,
        sources: &[ContextSource],
        scenario: &DisruptionScenario,
    ) -> Result<AssembledContext, RetrievalError> {
        let mut context = AssembledContext::default();

        for source in sources {
            let Some(key) = scenario.field(source.key_field) else {
                if source.required {
                    context
                        .missing
                        .push(format!("{} (scenario has no {:?})", source.name, source.key_field));
                }
                context.data.insert(source.name.clone(), Value::Null);
                continue;
            };

            let outcome = match &source.index {
                Some(index) => self.retriever.query(&source.table, index, key).await?,
                None => self.retriever.batch_get(&source.table, &[key.to_string()]).await?,
            };
            debug!(
                source = %source.name,
                table = %source.table,
                returned = outcome.returned(),
                "Context source retrieved"
            );

            if source.required && (outcome.records.is_empty() || !outcome.missing.is_empty()) {
                context.missing.push(format!("{} ({})", source.name, key));
            }
            context
                .data
                .insert(source.name.clone(), Value::Array(outcome.records));
        }

        Ok(context)
    }
}

fn normalize(mut opinion: ReasonerOpinion) -> ReasonerOpinion {
    opinion.recommendation = opinion.recommendation.trim().to_string();
    opinion.reasoning = opinion.reasoning.trim().to_string();
    opinion.binding_constraints = opinion
        .binding_constraints
        .into_iter()
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty())
        .collect();
    opinion
}

/// Check an opinion against the response schema for `agent`.
pub fn validate_opinion(agent: AgentId, opinion: &ReasonerOpinion) -> Result<(), String> {
    if opinion.recommendation.is_empty() {
        return Err("empty recommendation".into());
    }
    if opinion.reasoning.is_empty() {
        return Err("empty reasoning".into());
    }
    if !opinion.confidence.is_finite() || !(0.0..=1.0).contains(&opinion.confidence) {
        return Err(format!("confidence {} outside [0, 1]", opinion.confidence));
    }
    if !agent.is_safety() && !opinion.binding_constraints.is_empty() {
        return Err(format!(
            "business agent {} emitted binding constraints",
            agent
        ));
    }
    if let Some(impact) = &opinion.impact {
        let scores = [
            ("safety_score", impact.safety_score),
            ("cost_score", impact.cost_score),
            ("passenger_score", impact.passenger_score),
            ("network_score", impact.network_score),
        ];
        for (name, score) in scores {
            if let Some(value) = score {
                if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                    return Err(format!("{name} {value} outside [0, 100]"));
                }
            }
        }
        if let Some(hours) = impact.estimated_delay_hours {
            if !hours.is_finite() || !(0.0..=MAX_ESTIMATED_DELAY_HOURS).contains(&hours) {
                return Err(format!(
                    "estimated_delay_hours {hours} outside [0, {MAX_ESTIMATED_DELAY_HOURS}]"
                ));
            }
        }
    }
    Ok(())
}
