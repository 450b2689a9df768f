//! Phase controller
//!
//! Drives one run through `Initial -> Revision -> Arbitration -> Done`. Each
//! agent phase fans out to the whole roster on a `JoinSet` and waits for every
//! invocation; the phases themselves are strict barriers. Cancellation is
//! raced against each fan-out and checked between phases.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use super::audit::{AuditRecord, AuditSink};
use super::phase::{PhaseMachine, PhaseTransition, RunPhase};
use super::{OrchestratorError, OrchestratorResult};
use crate::arbitration::{ArbitrationEngine, ArbitratorOutput};
use crate::config::OrchestratorConfig;
use crate::invoker::AgentInvoker;
use crate::otel;
use crate::reasoner::Reasoner;
use crate::retrieval::{BatchRetriever, KvBackend};
use crate::state::types::{
    AgentId, AgentResponse, Collation, DisruptionScenario, PhaseTag, ResponseStatus, RunId,
};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Output produced, but over-constrained or missing a safety position
    Degraded,
    DataUnavailable,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Degraded => write!(f, "degraded"),
            Self::DataUnavailable => write!(f, "data_unavailable"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the caller always gets back from a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub status: RunStatus,
    pub explanation: String,
    pub audit: AuditRecord,
    pub transitions: Vec<PhaseTransition>,
}

impl RunOutcome {
    pub fn output(&self) -> Option<&ArbitratorOutput> {
        self.audit.arbitrator_output.as_ref()
    }
}

/// Result of one agent phase
enum PhaseOutcome {
    Complete(Collation),
    Cancelled,
}

/// Why a completed phase cannot continue, if it cannot
fn data_gap(collation: &Collation, storage_errors: &[(AgentId, String)]) -> Option<String> {
    if let Some((agent, err)) = storage_errors.first() {
        return Some(format!("storage unavailable while assembling context for {agent}: {err}"));
    }
    if let Some(response) = collation
        .responses
        .values()
        .find(|r| r.agent.is_safety() && !r.missing_data.is_empty())
    {
        return Some(format!(
            "{} is missing required data: {}",
            response.agent,
            response.missing_data.join(", ")
        ));
    }
    if collation.success_count() == 0 {
        return Some(format!("no agent produced a successful {} response", collation.phase));
    }
    None
}

/// Bookkeeping shared across the phases of one run
struct RunState {
    run_id: RunId,
    scenario: Arc<DisruptionScenario>,
    machine: PhaseMachine,
    durations: BTreeMap<String, u64>,
    initial: Option<Collation>,
    revision: Option<Collation>,
    output: Option<ArbitratorOutput>,
    /// Set by a phase that cannot continue
    gap: Option<String>,
    started: Instant,
}

impl RunState {
    fn advance(&mut self, to: RunPhase, reason: &str) {
        if let Err(err) = self.machine.advance(to, reason) {
            error!(run_id = %self.run_id, error = %err, "Rejected run phase transition");
        }
    }
}

pub struct PhaseController {
    config: Arc<OrchestratorConfig>,
    invoker: Arc<AgentInvoker>,
    engine: ArbitrationEngine,
    audit_sink: Option<Arc<dyn AuditSink>>,
}

impl PhaseController {
    pub fn new(
        config: OrchestratorConfig,
        reasoner: Arc<dyn Reasoner>,
        backend: Arc<dyn KvBackend>,
    ) -> OrchestratorResult<Self> {
        config.validate().map_err(OrchestratorError::Config)?;
        let retriever = BatchRetriever::new(backend, config.retrieval.clone());
        let invoker = AgentInvoker::new(reasoner, retriever, config.agent_timeout());
        Ok(Self {
            engine: ArbitrationEngine::new(config.max_solutions),
            invoker: Arc::new(invoker),
            config: Arc::new(config),
            audit_sink: None,
        })
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn audit_sink(&self) -> Option<&Arc<dyn AuditSink>> {
        self.audit_sink.as_ref()
    }

    /// Run one disruption end to end.
    pub async fn run(&self, scenario: DisruptionScenario, cancel: CancellationToken) -> RunOutcome {
        let run_id = Uuid::new_v4().to_string();
        let span = otel::run_span(&run_id, &scenario.id);
        let outcome = self
            .run_inner(run_id, scenario, cancel)
            .instrument(span.clone())
            .await;
        otel::record_run_result(&span, &outcome.status.to_string(), outcome.audit.total_duration_ms);
        outcome
    }

    async fn run_inner(
        &self,
        run_id: RunId,
        scenario: DisruptionScenario,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let mut state = RunState {
            run_id,
            scenario: Arc::new(scenario),
            machine: PhaseMachine::new(),
            durations: BTreeMap::new(),
            initial: None,
            revision: None,
            output: None,
            gap: None,
            started: Instant::now(),
        };
        info!(
            run_id = %state.run_id,
            scenario = %state.scenario.id,
            roster = self.config.roster.len(),
            "Recovery run started"
        );

        if cancel.is_cancelled() {
            state.advance(RunPhase::Cancelled, "cancelled before start");
            return self.finish(state, RunStatus::Cancelled, "run cancelled before start".into());
        }

        state.advance(RunPhase::Initial, "scenario received");
        let initial = match self.fan_out(&mut state, PhaseTag::Initial, None, &cancel).await {
            PhaseOutcome::Complete(collation) => collation,
            PhaseOutcome::Cancelled => {
                state.advance(RunPhase::Cancelled, "cancelled during initial phase");
                return self.finish(state, RunStatus::Cancelled, "run cancelled during initial phase".into());
            }
        };
        let prior = Arc::new(initial);
        state.initial = Some(prior.as_ref().clone());
        if let Some(reason) = state.gap.take() {
            state.advance(RunPhase::DataUnavailable, &reason);
            return self.finish(state, RunStatus::DataUnavailable, reason);
        }

        state.advance(RunPhase::Revision, "initial assessments collected");
        let revision = match self
            .fan_out(&mut state, PhaseTag::Revision, Some(Arc::clone(&prior)), &cancel)
            .await
        {
            PhaseOutcome::Complete(collation) => collation,
            PhaseOutcome::Cancelled => {
                state.advance(RunPhase::Cancelled, "cancelled during revision phase");
                return self.finish(state, RunStatus::Cancelled, "run cancelled during revision phase".into());
            }
        };
        state.revision = Some(revision.clone());
        if let Some(reason) = state.gap.take() {
            state.advance(RunPhase::DataUnavailable, &reason);
            return self.finish(state, RunStatus::DataUnavailable, reason);
        }

        if cancel.is_cancelled() {
            state.advance(RunPhase::Cancelled, "cancelled before arbitration");
            return self.finish(state, RunStatus::Cancelled, "run cancelled before arbitration".into());
        }

        state.advance(RunPhase::Arbitration, "revisions collected");
        let arbitration_started = Instant::now();
        let (positions, carried) = revision.with_safety_carried_from(&prior);
        if !carried.is_empty() {
            warn!(
                run_id = %state.run_id,
                agents = ?carried,
                "Safety agent failed in revision; arbitrating on its initial position"
            );
        }
        let output = self.engine.arbitrate(&state.run_id, &state.scenario, &positions);
        state.durations.insert(
            RunPhase::Arbitration.to_string(),
            arbitration_started.elapsed().as_millis() as u64,
        );

        let missing_safety: Vec<AgentId> = revision
            .responses
            .values()
            .filter(|r| r.agent.is_safety() && !r.is_success())
            .map(|r| r.agent)
            .collect();
        let (status, explanation) = if !output.constraints_satisfied {
            (
                RunStatus::Degraded,
                "no candidate satisfies every binding constraint; manual review fallback issued".to_string(),
            )
        } else if !missing_safety.is_empty() {
            let names: Vec<&str> = missing_safety
                .iter()
                .filter(|a| !carried.contains(a))
                .map(AgentId::as_str)
                .collect();
            let kept: Vec<&str> = carried.iter().map(AgentId::as_str).collect();
            let mut explanation = String::from("recommendation issued");
            if !names.is_empty() {
                explanation.push_str(&format!("; no position from {}", names.join(", ")));
            }
            if !kept.is_empty() {
                explanation.push_str(&format!(
                    "; initial constraints carried forward for {}",
                    kept.join(", ")
                ));
            }
            (RunStatus::Degraded, explanation)
        } else {
            (
                RunStatus::Success,
                format!(
                    "{} solution(s) ranked; recommended solution {}",
                    output.solutions.len(),
                    output.recommended_solution_id
                ),
            )
        };

        state.output = Some(output);
        state.advance(RunPhase::Done, &explanation);
        self.finish(state, status, explanation)
    }

    /// Invoke every roster agent for `phase` and wait for all of them.
    async fn fan_out(
        &self,
        state: &mut RunState,
        phase: PhaseTag,
        prior: Option<Arc<Collation>>,
        cancel: &CancellationToken,
    ) -> PhaseOutcome {
        let roster = self.config.roster_ids();
        let span = otel::phase_span(&state.run_id, phase, roster.len());
        let started = Instant::now();

        let mut tasks = JoinSet::new();
        for spec in &self.config.roster {
            let invoker = Arc::clone(&self.invoker);
            let spec = spec.clone();
            let scenario = Arc::clone(&state.scenario);
            let prior = prior.clone();
            tasks.spawn(async move { invoker.invoke(&spec, phase, &scenario, prior.as_deref()).await });
        }

        let mut responses: Vec<AgentResponse> = Vec::with_capacity(roster.len());
        let mut storage_errors: Vec<(AgentId, String)> = Vec::new();
        let joined = async {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tasks.abort_all();
                        return false;
                    }
                    next = tasks.join_next() => match next {
                        None => return true,
                        Some(Ok(invocation)) => {
                            if let Some(err) = invocation.storage_error {
                                storage_errors.push((invocation.response.agent, err.to_string()));
                            }
                            responses.push(invocation.response);
                        }
                        Some(Err(err)) => {
                            error!(phase = %phase, error = %err, "Agent task failed");
                        }
                    }
                }
            }
        }
        .instrument(span.clone())
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        state.durations.insert(phase.to_string(), duration_ms);
        if !joined {
            warn!(run_id = %state.run_id, phase = %phase, "Phase cancelled");
            return PhaseOutcome::Cancelled;
        }

        for agent in &roster {
            if !responses.iter().any(|r| r.agent == *agent) {
                responses.push(AgentResponse::error(
                    *agent,
                    phase,
                    "agent task ended without a response",
                    duration_ms,
                ));
            }
        }

        let collation = Collation::from_responses(phase, &roster, responses, duration_ms);
        otel::record_phase_result(
            &span,
            collation.count_status(ResponseStatus::Success),
            collation.count_status(ResponseStatus::Timeout),
            collation.count_status(ResponseStatus::Error),
            duration_ms,
        );
        info!(
            run_id = %state.run_id,
            phase = %phase,
            success = collation.success_count(),
            roster = roster.len(),
            duration_ms,
            "Phase complete"
        );

        state.gap = data_gap(&collation, &storage_errors);
        PhaseOutcome::Complete(collation)
    }

    fn finish(&self, state: RunState, status: RunStatus, explanation: String) -> RunOutcome {
        let total_duration_ms = state.started.elapsed().as_millis() as u64;
        let audit = AuditRecord::new(
            state.run_id.clone(),
            status,
            state.scenario.as_ref().clone(),
            state.initial,
            state.revision,
            state.output,
            state.durations,
            total_duration_ms,
        );

        if let Some(sink) = &self.audit_sink {
            if let Err(err) = sink.record_audit(&audit) {
                warn!(run_id = %state.run_id, error = %err, "Failed to record audit");
            }
        }

        match status {
            RunStatus::Success => info!(run_id = %state.run_id, total_duration_ms, %explanation, "Recovery run complete"),
            _ => warn!(run_id = %state.run_id, status = %status, total_duration_ms, %explanation, "Recovery run ended early or degraded"),
        }

        RunOutcome {
            run_id: state.run_id,
            status,
            explanation,
            audit,
            transitions: state.machine.into_transitions(),
        }
    }
}
