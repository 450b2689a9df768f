//! End-to-end recovery runs with a scripted reasoner (no model calls).
//!
//! Covers: controller ↔ invoker ↔ retrieval ↔ arbitration ↔ audit running
//! together, plus the submit/poll service surface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::orchestrator::RunPhase;
use coordination::{
    AgentId, AgentSpec, AuditSink, BackendError, ConflictType, ContextSource, DisruptionScenario,
    InMemoryBackend, JsonlAuditSink, OrchestratorConfig, PhaseController, PhaseTag, Reasoner,
    ReasonerError, ReasonerOpinion, ReasonerRequest, ReasonerResult, RecoveryService,
    ResponseStatus, RunStatus, RunStatusReport, ScenarioField,
};
use coordination::retrieval::Fault;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

// ── Scripted reasoner ──────────────────────────────────────────────

#[derive(Clone)]
enum Script {
    Answer(ReasonerOpinion),
    /// Answers the initial phase, then never answers again
    AnswerOnce(ReasonerOpinion),
    Fail,
    Hang,
}

/// Answers per agent from a script; unscripted agents give a neutral opinion.
#[derive(Default)]
struct ScriptedReasoner {
    scripts: HashMap<AgentId, Script>,
    requests: Mutex<Vec<ReasonerRequest>>,
}

impl ScriptedReasoner {
    fn new() -> Self {
        Self::default()
    }

    fn answer(mut self, agent: AgentId, recommendation: &str, constraints: &[&str]) -> Self {
        self.scripts.insert(
            agent,
            Script::Answer(ReasonerOpinion {
                recommendation: recommendation.into(),
                reasoning: format!("{} assessment of the disruption", agent),
                confidence: 0.85,
                binding_constraints: constraints.iter().map(|c| c.to_string()).collect(),
                ..Default::default()
            }),
        );
        self
    }

    fn answer_initial_only(mut self, agent: AgentId, recommendation: &str, constraints: &[&str]) -> Self {
        self = self.answer(agent, recommendation, constraints);
        if let Some(Script::Answer(opinion)) = self.scripts.remove(&agent) {
            self.scripts.insert(agent, Script::AnswerOnce(opinion));
        }
        self
    }

    fn fail(mut self, agent: AgentId) -> Self {
        self.scripts.insert(agent, Script::Fail);
        self
    }

    fn hang_all(mut self) -> Self {
        for agent in AgentId::all() {
            self.scripts.insert(*agent, Script::Hang);
        }
        self
    }

    fn requests(&self) -> Vec<ReasonerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reasoner for ScriptedReasoner {
    async fn invoke(&self, request: &ReasonerRequest) -> ReasonerResult<ReasonerOpinion> {
        self.requests.lock().unwrap().push(request.clone());
        match self.scripts.get(&request.agent).cloned() {
            Some(Script::Answer(opinion)) => Ok(opinion),
            Some(Script::AnswerOnce(opinion)) if request.phase == PhaseTag::Initial => Ok(opinion),
            Some(Script::AnswerOnce(_)) | Some(Script::Hang) => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Some(Script::Fail) => Err(ReasonerError::RequestFailed("model endpoint returned 500".into())),
            None => Ok(ReasonerOpinion {
                recommendation: "No findings for this disruption".into(),
                reasoning: "Nothing in the data affects this domain".into(),
                confidence: 0.7,
                ..Default::default()
            }),
        }
    }
}

// ── Helpers ────────────────────────────────────────────────────────

fn config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.agent_timeout_ms = 30_000;
    config.retrieval.chunk_size = 100;
    config
}

fn scenario() -> DisruptionScenario {
    DisruptionScenario::new("Hydraulic leak found on the inbound aircraft during turnaround")
        .with_id("scn-hyd-1")
        .with_flight("XY123")
        .with_aircraft("N123AB")
        .with_airport("ORD")
        .with_delay_hours(1.0)
}

fn controller(reasoner: Arc<ScriptedReasoner>) -> PhaseController {
    PhaseController::new(config(), reasoner, Arc::new(InMemoryBackend::new())).unwrap()
}

fn override_reasoner() -> ScriptedReasoner {
    ScriptedReasoner::new()
        .answer(
            AgentId::CrewCompliance,
            "Hold the flight until the crew has rested",
            &["Crew requires 10 hours rest"],
        )
        .answer(AgentId::Network, "Delay 2 hours to protect connections", &[])
        .answer(AgentId::GuestExperience, "Rebook connecting passengers and issue meal vouchers", &[])
}

// ── Full runs ──────────────────────────────────────────────────────

#[tokio::test]
async fn test_safety_constraint_overrides_short_delay() {
    let reasoner = Arc::new(override_reasoner());
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Success, "{}", outcome.explanation);
    let output = outcome.output().unwrap();
    assert!(output.constraints_satisfied);
    assert!(!output.solutions.is_empty() && output.solutions.len() <= 3);
    assert!(output
        .safety_overrides
        .iter()
        .any(|o| o.agent == AgentId::Network));
    assert!(output
        .conflicts_identified
        .iter()
        .any(|c| c.conflict_type == ConflictType::SafetyVsBusiness));

    for solution in &output.solutions {
        assert!(solution.constraints_satisfied);
        assert!(solution.estimated_delay_hours.unwrap_or(0.0) >= 10.0);
        assert!(!solution.recovery_plan.steps.is_empty());
        assert!(!solution.recovery_plan.critical_path.is_empty());
    }
    assert_eq!(output.recommended_solution_id, output.solutions[0].solution_id);
}

#[tokio::test]
async fn test_phases_and_collations_are_complete() {
    let reasoner = Arc::new(override_reasoner());
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    let initial = outcome.audit.collation_initial.as_ref().unwrap();
    let revision = outcome.audit.collation_revision.as_ref().unwrap();
    assert!(initial.is_complete_for(AgentId::all()));
    assert!(revision.is_complete_for(AgentId::all()));
    assert_eq!(initial.phase, PhaseTag::Initial);
    assert_eq!(revision.phase, PhaseTag::Revision);
    assert!(revision.responses.values().all(|r| r.phase == PhaseTag::Revision));

    let phases: Vec<RunPhase> = outcome.transitions.iter().map(|t| t.to).collect();
    assert_eq!(
        phases,
        vec![RunPhase::Initial, RunPhase::Revision, RunPhase::Arbitration, RunPhase::Done]
    );
    assert!(outcome.audit.phase_durations.contains_key("initial"));
    assert!(outcome.audit.phase_durations.contains_key("revision"));
    assert!(outcome.audit.verify_digest());
}

#[tokio::test]
async fn test_revision_sees_initial_peers() {
    let reasoner = Arc::new(override_reasoner());
    controller(Arc::clone(&reasoner))
        .run(scenario(), CancellationToken::new())
        .await;

    let requests = reasoner.requests();
    assert_eq!(requests.len(), 14);
    let (initial, revision): (Vec<_>, Vec<_>) =
        requests.iter().partition(|r| r.phase == PhaseTag::Initial);
    assert_eq!(initial.len(), 7);
    assert_eq!(revision.len(), 7);

    assert!(initial.iter().all(|r| r.peers.is_empty() && r.own_prior.is_none()));
    for request in revision {
        assert_eq!(request.peers.len(), 6);
        assert!(request.peers.iter().all(|p| p.agent != request.agent));
        assert!(request.peers.iter().all(|p| p.phase == PhaseTag::Initial));
        assert_eq!(request.own_prior.as_ref().map(|p| p.agent), Some(request.agent));
    }
}

#[tokio::test]
async fn test_exclusive_business_proposals_yield_alternatives() {
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .answer(AgentId::Network, "Delay 2 hours", &[])
            .answer(AgentId::Finance, "Cancel the flight and refund", &[]),
    );
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Success);
    let output = outcome.output().unwrap();
    assert!(output
        .conflicts_identified
        .iter()
        .any(|c| c.conflict_type == ConflictType::BusinessVsBusiness));
    assert!(output.solutions.len() >= 2);
    for pair in output.solutions.windows(2) {
        assert!(pair[0].composite_score >= pair[1].composite_score);
    }
    // each side of the exclusive pair seeds its own solution
    for (proposer, rival) in [
        (AgentId::Network, AgentId::Finance),
        (AgentId::Finance, AgentId::Network),
    ] {
        assert!(
            output
                .solutions
                .iter()
                .any(|s| s.source_agents.contains(&proposer) && !s.source_agents.contains(&rival)),
            "no solution carries the {proposer} proposal alone"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_safety_constraint_survives_revision_timeout() {
    let reasoner = Arc::new(
        ScriptedReasoner::new()
            .answer_initial_only(
                AgentId::CrewCompliance,
                "Hold the flight until the crew has rested",
                &["Crew requires 10 hours rest"],
            )
            .answer(AgentId::Network, "Delay 2 hours to protect connections", &[]),
    );
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Degraded, "{}", outcome.explanation);
    assert!(outcome.explanation.contains("carried forward for crew_compliance"));
    let revision = outcome.audit.collation_revision.as_ref().unwrap();
    assert_eq!(
        revision.get(AgentId::CrewCompliance).unwrap().status,
        ResponseStatus::Timeout
    );

    let output = outcome.output().unwrap();
    assert!(output.constraints_satisfied);
    assert!(output.safety_overrides.iter().any(|o| o.agent == AgentId::Network));
    for solution in &output.solutions {
        assert!(solution.estimated_delay_hours.unwrap_or(0.0) >= 10.0);
    }
}

#[tokio::test]
async fn test_business_agent_failure_is_recorded_not_fatal() {
    let reasoner = Arc::new(override_reasoner().fail(AgentId::Cargo));
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Success);
    let revision = outcome.audit.collation_revision.as_ref().unwrap();
    assert_eq!(revision.len(), 7);
    let cargo = revision.get(AgentId::Cargo).unwrap();
    assert_eq!(cargo.status, ResponseStatus::Error);
    assert!(cargo.reasoning.contains("500"));
}

#[tokio::test]
async fn test_safety_agent_failure_degrades_run() {
    let reasoner = Arc::new(override_reasoner().fail(AgentId::Maintenance));
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Degraded);
    assert!(outcome.explanation.contains("maintenance"));
    assert!(outcome.output().is_some());
}

#[tokio::test]
async fn test_identical_inputs_rank_identically() {
    let first = controller(Arc::new(override_reasoner()))
        .run(scenario(), CancellationToken::new())
        .await;
    let second = controller(Arc::new(override_reasoner()))
        .run(scenario(), CancellationToken::new())
        .await;

    let (a, b) = (first.output().unwrap(), second.output().unwrap());
    assert_eq!(a.solutions, b.solutions);
    assert_eq!(a.recommended_solution_id, b.recommended_solution_id);
    assert_eq!(a.final_decision, b.final_decision);
}

// ── Early exits ────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn test_all_agents_timing_out_is_data_unavailable() {
    let reasoner = Arc::new(ScriptedReasoner::new().hang_all());
    let outcome = controller(reasoner).run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::DataUnavailable);
    assert!(outcome.output().is_none());
    assert!(outcome.audit.collation_revision.is_none());
    let initial = outcome.audit.collation_initial.as_ref().unwrap();
    assert_eq!(initial.count_status(ResponseStatus::Timeout), 7);
    assert_eq!(outcome.transitions.last().unwrap().to, RunPhase::DataUnavailable);
}

#[tokio::test]
async fn test_storage_outage_is_data_unavailable() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.set_persistent_fault(Some(Fault::Fail(BackendError::Unavailable("store offline".into()))));

    let mut config = config();
    config.roster[0] = AgentSpec::new(AgentId::CrewCompliance).with_source(ContextSource::new(
        "crew_roster",
        "crew_roster",
        ScenarioField::FlightNumber,
    ));
    let controller = PhaseController::new(config, Arc::new(override_reasoner()), backend).unwrap();
    let outcome = controller.run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::DataUnavailable);
    assert!(outcome.explanation.contains("storage unavailable"));
    assert!(outcome.output().is_none());
}

#[tokio::test]
async fn test_missing_required_safety_data_is_data_unavailable() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.insert("maintenance_log", json!({"id": "N999ZZ", "status": "serviceable"}));

    let mut config = config();
    config.roster[1] = AgentSpec::new(AgentId::Maintenance).with_source(
        ContextSource::new("maintenance_log", "maintenance_log", ScenarioField::AircraftRegistration)
            .required(),
    );
    let controller = PhaseController::new(config, Arc::new(override_reasoner()), backend).unwrap();
    let outcome = controller.run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::DataUnavailable);
    assert!(outcome.explanation.contains("maintenance"));
    let initial = outcome.audit.collation_initial.as_ref().unwrap();
    assert!(!initial.get(AgentId::Maintenance).unwrap().missing_data.is_empty());
}

#[tokio::test]
async fn test_retrieved_context_reaches_reasoner() {
    let backend = Arc::new(InMemoryBackend::new());
    backend.insert("maintenance_log", json!({"id": "N123AB", "status": "AOG"}));

    let mut config = config();
    config.roster[1] = AgentSpec::new(AgentId::Maintenance).with_source(
        ContextSource::new("maintenance_log", "maintenance_log", ScenarioField::AircraftRegistration)
            .required(),
    );
    let reasoner = Arc::new(override_reasoner());
    let controller = PhaseController::new(config, Arc::clone(&reasoner) as Arc<dyn Reasoner>, backend).unwrap();
    let outcome = controller.run(scenario(), CancellationToken::new()).await;

    assert_eq!(outcome.status, RunStatus::Success);
    let request = reasoner
        .requests()
        .into_iter()
        .find(|r| r.agent == AgentId::Maintenance)
        .unwrap();
    assert_eq!(request.context["maintenance_log"][0]["status"], "AOG");
}

#[tokio::test]
async fn test_cancelled_token_stops_run() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let outcome = controller(Arc::new(override_reasoner())).run(scenario(), cancel).await;

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(outcome.output().is_none());
}

// ── Service surface ────────────────────────────────────────────────

async fn wait_finished(service: &RecoveryService, request_id: &str) -> RunStatusReport {
    for _ in 0..500 {
        let report = service.status(request_id).await.unwrap();
        if report.is_finished() {
            return report;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("run {request_id} did not finish");
}

#[tokio::test]
async fn test_submit_then_poll_until_complete() {
    let service = RecoveryService::new(controller(Arc::new(override_reasoner())));
    let request_id = service.submit(scenario()).await;

    let report = wait_finished(&service, &request_id).await;
    assert_eq!(report.state_name(), "complete");
    let outcome = report.outcome().unwrap();
    assert_eq!(outcome.status, RunStatus::Success);
    assert!(outcome.output().is_some());
    assert!(service.status("no-such-request").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_submitted_run_reports_error() {
    let service = RecoveryService::new(controller(Arc::new(ScriptedReasoner::new().hang_all())));
    let request_id = service.submit(scenario()).await;
    assert_eq!(service.status(&request_id).await.unwrap(), RunStatusReport::Processing);

    service.cancel(&request_id).await.unwrap();
    let report = wait_finished(&service, &request_id).await;
    assert!(matches!(report, RunStatusReport::Error { ref message } if message.contains("cancelled")));

    assert!(service.cancel("no-such-request").await.is_err());
}

#[tokio::test]
async fn test_sync_run_writes_sealed_audit_record() {
    let dir = TempDir::new().unwrap();
    let sink = Arc::new(JsonlAuditSink::new(dir.path().join("audit").join("runs.jsonl")));
    let controller = controller(Arc::new(override_reasoner()))
        .with_audit_sink(Arc::clone(&sink) as Arc<dyn AuditSink>);
    let service = RecoveryService::new(controller);

    let outcome = service.run_sync(scenario()).await;
    let records = sink.read_all().unwrap();
    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.run_id, outcome.run_id);
    assert_eq!(record.scenario.id, "scn-hyd-1");
    assert!(record.verify_digest());
    assert_eq!(record.arbitrator_output, outcome.audit.arbitrator_output);
}
