//! Arbitration engine
//!
//! Pure function of the revision collation: extract constraints, detect and
//! resolve conflicts, generate candidates, drop anything that still breaks a
//! resolved constraint, then score, rank and plan what is left.

use std::collections::BTreeSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::candidates::{generate_candidates, over_constrained_fallback, Candidate};
use super::plan::{build_plan, Contingency, RecoveryPlan};
use super::scoring::{rank_order, safety_baseline, score_candidate, AxisScores};
use crate::conflict::{
    detect_conflicts, extract_constraints, resolve, BindingConstraint, Conflict, ConflictResolution,
    CourseOfAction, SafetyOverride,
};
use crate::otel;
use crate::state::types::{AgentId, Collation, DisruptionScenario};

/// Upper bound on solutions per run
pub const MAX_SOLUTIONS: usize = 3;
/// Confidence ceiling for the over-constrained fallback
pub const OVER_CONSTRAINED_CONFIDENCE: f64 = 0.3;
/// Confidence lost per overridden member
const OVERRIDE_CONFIDENCE_PENALTY: f64 = 0.1;

const STRONG_AXIS: f64 = 70.0;
const WEAK_AXIS: f64 = 50.0;
const LONG_DELAY_HOURS: f64 = 4.0;

/// A ranked recovery option
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySolution {
    /// 1-based insertion index among the solutions that passed the gate
    pub solution_id: u32,
    pub title: String,
    pub description: String,
    pub recommendations: Vec<String>,
    pub scores: AxisScores,
    pub composite_score: f64,
    pub pros: Vec<String>,
    pub cons: Vec<String>,
    pub risks: Vec<String>,
    pub confidence: f64,
    pub estimated_delay_hours: Option<f64>,
    pub source_agents: Vec<AgentId>,
    pub recovery_plan: RecoveryPlan,
    pub constraints_satisfied: bool,
}

/// Final arbitration result for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitratorOutput {
    pub final_decision: String,
    /// Sorted best first
    pub solutions: Vec<RecoverySolution>,
    pub recommended_solution_id: u32,
    pub conflicts_identified: Vec<Conflict>,
    pub conflict_resolutions: Vec<ConflictResolution>,
    pub safety_overrides: Vec<SafetyOverride>,
    pub justification: String,
    /// Decision trace, one line per step
    pub reasoning: String,
    pub confidence: f64,
    /// False only for the over-constrained fallback
    pub constraints_satisfied: bool,
    pub timestamp: DateTime<Utc>,
}

impl ArbitratorOutput {
    pub fn recommended(&self) -> Option<&RecoverySolution> {
        self.solutions
            .iter()
            .find(|s| s.solution_id == self.recommended_solution_id)
    }
}

#[derive(Debug, Clone)]
pub struct ArbitrationEngine {
    max_solutions: usize,
}

impl Default for ArbitrationEngine {
    fn default() -> Self {
        Self::new(MAX_SOLUTIONS)
    }
}

impl ArbitrationEngine {
    pub fn new(max_solutions: usize) -> Self {
        Self {
            max_solutions: max_solutions.clamp(1, MAX_SOLUTIONS),
        }
    }

    pub fn max_solutions(&self) -> usize {
        self.max_solutions
    }

    /// Arbitrate over the revision collation.
    pub fn arbitrate(
        &self,
        run_id: &str,
        scenario: &DisruptionScenario,
        collation: &Collation,
    ) -> ArbitratorOutput {
        let span = otel::arbitration_span(run_id, collation.success_count());
        let _guard = span.enter();
        let started = Instant::now();
        let mut trace = Vec::new();

        let constraints = extract_constraints(collation);
        trace.push(format!(
            "Extracted {} binding constraint(s) from {} successful safety agent(s)",
            constraints.len(),
            collation.successful().filter(|r| r.agent.is_safety()).count()
        ));

        let conflicts = detect_conflicts(collation, &constraints);
        for conflict in &conflicts {
            trace.push(format!(
                "Conflict ({}, {:?}): {}",
                conflict.conflict_type, conflict.severity, conflict.description
            ));
        }

        let resolved = resolve(&conflicts, &constraints);
        for resolution in &resolved.resolutions {
            trace.push(format!("Rule {:?}: {}", resolution.rule, resolution.action));
        }

        let set = generate_candidates(scenario, collation, &conflicts, &resolved, self.max_solutions);
        trace.extend(set.notes.iter().cloned());
        debug!(candidates = set.candidates.len(), "Generated recovery candidates");

        let mut passed = Vec::new();
        let mut violated: Vec<String> = Vec::new();
        for candidate in set.candidates {
            let violations = candidate.violations(&resolved.active);
            if violations.is_empty() {
                passed.push(candidate);
                continue;
            }
            let texts: Vec<String> = violations.iter().map(|c| c.to_string()).collect();
            warn!(
                candidate = %candidate.title,
                violations = texts.len(),
                "Discarding candidate that violates a binding constraint"
            );
            trace.push(format!(
                "Discarded '{}': violates {}",
                candidate.title,
                texts.join("; ")
            ));
            for text in texts {
                if !violated.contains(&text) {
                    violated.push(text);
                }
            }
        }

        let over_constrained = passed.is_empty();
        if over_constrained {
            let mut fallback = over_constrained_fallback(1, collation, &resolved);
            let note = format!(
                "Over-constrained: no candidate satisfies every binding constraint ({})",
                violated.join("; ")
            );
            warn!(violations = violated.len(), "No candidate passed the constraint gate");
            fallback.notes.push(note.clone());
            trace.push(note);
            passed.push(fallback);
        }

        for (position, candidate) in passed.iter_mut().enumerate() {
            candidate.index = position + 1;
        }

        let mut scored: Vec<(Candidate, AxisScores)> = passed
            .into_iter()
            .map(|c| {
                let scores = score_candidate(&c, collation);
                (c, scores)
            })
            .collect();
        scored.sort_by(|a, b| rank_order((&a.1, a.0.index), (&b.1, b.0.index)));

        let conservative_id = scored
            .iter()
            .find(|(c, _)| c.conservative)
            .map(|(c, _)| c.index as u32);

        let mut solutions: Vec<RecoverySolution> = scored
            .iter()
            .map(|(candidate, scores)| {
                to_solution(candidate, *scores, collation, &resolved.active, over_constrained)
            })
            .collect();

        let ranked_ids: Vec<u32> = solutions.iter().map(|s| s.solution_id).collect();
        for (rank, solution) in solutions.iter_mut().enumerate() {
            if let Some(next) = ranked_ids.get(rank + 1) {
                solution.recovery_plan.contingencies.push(Contingency {
                    trigger: "Primary recovery option becomes infeasible".into(),
                    alternate_solution_id: *next,
                });
            }
            if let Some(conservative) = conservative_id.filter(|id| *id != solution.solution_id) {
                solution.recovery_plan.contingencies.push(Contingency {
                    trigger: "New binding safety constraint issued".into(),
                    alternate_solution_id: conservative,
                });
            }
        }

        for solution in &solutions {
            trace.push(format!(
                "Ranked solution {} '{}': composite {:.2}, safety {:.1}",
                solution.solution_id, solution.title, solution.composite_score, solution.scores.safety
            ));
        }

        let roster = collation.len().max(1) as f64;
        let coverage = collation.success_count() as f64 / roster;
        let (final_decision, recommended_solution_id, justification, mut confidence) =
            match solutions.first() {
                Some(best) => (
                    format!("{}: {}", best.title, best.recommendations.join("; ")),
                    best.solution_id,
                    justify(best, &resolved.overrides, over_constrained),
                    best.confidence * coverage,
                ),
                None => (String::new(), 0, String::new(), 0.0),
            };
        if over_constrained {
            confidence = confidence.min(OVER_CONSTRAINED_CONFIDENCE);
        }

        otel::record_arbitration_result(
            &span,
            conflicts.len(),
            solutions.len(),
            started.elapsed().as_millis() as u64,
        );
        info!(
            conflicts = conflicts.len(),
            overrides = resolved.overrides.len(),
            solutions = solutions.len(),
            recommended = recommended_solution_id,
            constraints_satisfied = !over_constrained,
            "Arbitration complete"
        );

        ArbitratorOutput {
            final_decision,
            solutions,
            recommended_solution_id,
            conflicts_identified: conflicts,
            conflict_resolutions: resolved.resolutions,
            safety_overrides: resolved.overrides,
            justification,
            reasoning: trace.join("\n"),
            confidence,
            constraints_satisfied: !over_constrained,
            timestamp: Utc::now(),
        }
    }
}

fn candidate_confidence(candidate: &Candidate, collation: &Collation) -> f64 {
    let base = if candidate.conservative {
        safety_baseline(collation) / 100.0
    } else {
        let confidences: Vec<f64> = candidate
            .members
            .iter()
            .filter_map(|a| collation.get(*a))
            .filter(|r| r.is_success())
            .map(|r| r.confidence)
            .collect();
        if confidences.is_empty() {
            0.5
        } else {
            confidences.iter().sum::<f64>() / confidences.len() as f64
        }
    };
    let penalty = 1.0 - OVERRIDE_CONFIDENCE_PENALTY * candidate.overridden.len() as f64;
    (base * penalty).clamp(0.0, 1.0)
}

fn to_solution(
    candidate: &Candidate,
    scores: AxisScores,
    collation: &Collation,
    active: &[BindingConstraint],
    over_constrained: bool,
) -> RecoverySolution {
    let axes = [
        ("safety", scores.safety),
        ("cost", scores.cost),
        ("passenger", scores.passenger),
        ("network", scores.network),
    ];

    let mut pros = Vec::new();
    let mut cons = Vec::new();
    let mut risks = Vec::new();
    for (axis, value) in axes {
        if value >= STRONG_AXIS {
            pros.push(format!("Strong {axis} outcome ({value:.0}/100)"));
        } else if value < WEAK_AXIS {
            cons.push(format!("Weak {axis} outcome ({value:.0}/100)"));
        }
    }

    if candidate.conservative && !over_constrained {
        pros.push("Satisfies every binding constraint with the widest margin".into());
    }
    if !candidate.conservative && candidate.overridden.is_empty() {
        pros.push("Executes the member proposals without safety adjustment".into());
    }
    match (candidate.course, candidate.delay_hours) {
        (CourseOfAction::Cancel, _) => cons.push("Flight does not operate".into()),
        (_, Some(hours)) if hours >= LONG_DELAY_HOURS => {
            cons.push(format!("Long delay of {hours:.1} hours"))
        }
        _ => {}
    }

    if !candidate.overridden.is_empty() {
        let agents: Vec<&str> = candidate.overridden.iter().map(|a| a.as_str()).collect();
        risks.push(format!(
            "Proposal(s) from {} adjusted by safety constraints",
            agents.join(", ")
        ));
    }
    if !candidate.compliance_steps.is_empty() {
        risks.push(format!(
            "Depends on completing {} compliance requirement(s)",
            candidate.compliance_steps.len()
        ));
    }
    risks.extend(candidate.notes.iter().cloned());

    let mut confidence = candidate_confidence(candidate, collation);
    if over_constrained {
        confidence = confidence.min(OVER_CONSTRAINED_CONFIDENCE);
    }

    RecoverySolution {
        solution_id: candidate.index as u32,
        title: candidate.title.clone(),
        description: candidate.description.clone(),
        recommendations: candidate.action_texts().into_iter().map(String::from).collect(),
        scores,
        composite_score: scores.composite(),
        pros,
        cons,
        risks,
        confidence,
        estimated_delay_hours: candidate.delay_hours,
        source_agents: candidate.members.clone(),
        recovery_plan: build_plan(candidate),
        constraints_satisfied: !over_constrained && candidate.violations(active).is_empty(),
    }
}

fn justify(best: &RecoverySolution, overrides: &[SafetyOverride], over_constrained: bool) -> String {
    if over_constrained {
        return "No candidate satisfies every binding constraint; the operation is held for manual safety review".into();
    }
    let mut text = format!(
        "Solution {} ranks first with composite {:.2} (safety {:.1}, cost {:.1}, passenger {:.1}, network {:.1})",
        best.solution_id,
        best.composite_score,
        best.scores.safety,
        best.scores.cost,
        best.scores.passenger,
        best.scores.network
    );
    if !overrides.is_empty() {
        let agents: BTreeSet<AgentId> = overrides.iter().map(|o| o.agent).collect();
        let names: Vec<&str> = agents.iter().map(AgentId::as_str).collect();
        text.push_str(&format!("; safety constraints overrode {}", names.join(", ")));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::ConflictType;
    use crate::state::types::{AgentResponse, ImpactAssessment, PhaseTag, ResponseStatus};

    fn response(agent: AgentId, recommendation: &str, constraints: &[&str]) -> AgentResponse {
        AgentResponse {
            agent,
            phase: PhaseTag::Revision,
            recommendation: recommendation.into(),
            reasoning: "analysis".into(),
            confidence: 0.9,
            binding_constraints: constraints.iter().map(|s| s.to_string()).collect(),
            impact: None,
            status: ResponseStatus::Success,
            duration_ms: 1,
            timestamp: Utc::now(),
            extracted_context: None,
            missing_data: Vec::new(),
        }
    }

    fn arbitrate(responses: Vec<AgentResponse>) -> ArbitratorOutput {
        let collation = Collation::from_responses(PhaseTag::Revision, AgentId::all(), responses, 5);
        let scenario = DisruptionScenario::new("Hydraulic fault on inbound aircraft").with_delay_hours(1.0);
        ArbitrationEngine::default().arbitrate("run-1", &scenario, &collation)
    }

    #[test]
    fn test_safety_override_extends_delay() {
        let output = arbitrate(vec![
            response(AgentId::CrewCompliance, "Hold for crew rest", &["Crew requires 10 hours rest"]),
            response(AgentId::Network, "Delay 2 hours to protect connections", &[]),
        ]);

        assert!(output.constraints_satisfied);
        assert_eq!(output.safety_overrides.len(), 1);
        assert_eq!(output.safety_overrides[0].agent, AgentId::Network);
        assert!(output
            .conflicts_identified
            .iter()
            .any(|c| c.conflict_type == ConflictType::SafetyVsBusiness));
        for solution in &output.solutions {
            assert!(solution.estimated_delay_hours.unwrap_or(0.0) >= 10.0);
            assert!(solution.recovery_plan.steps.iter().all(|s| !s.rollback.is_empty()));
        }
    }

    #[test]
    fn test_solutions_sorted_and_numbered() {
        let mut network = response(AgentId::Network, "Delay 2 hours", &[]);
        network.impact = Some(ImpactAssessment {
            cost_score: Some(80.0),
            passenger_score: Some(80.0),
            network_score: Some(90.0),
            ..Default::default()
        });
        let output = arbitrate(vec![
            response(AgentId::Maintenance, "Inspect hydraulics", &[]),
            network,
            response(AgentId::Finance, "Cancel the flight", &[]),
        ]);

        assert!(output.solutions.len() >= 2);
        let mut ids: Vec<u32> = output.solutions.iter().map(|s| s.solution_id).collect();
        ids.sort();
        assert_eq!(ids, (1..=output.solutions.len() as u32).collect::<Vec<_>>());
        for pair in output.solutions.windows(2) {
            assert!(pair[0].composite_score >= pair[1].composite_score);
        }
        assert_eq!(output.recommended_solution_id, output.solutions[0].solution_id);
        assert!(output.recommended().is_some());
    }

    #[test]
    fn test_over_constrained_fallback() {
        // the only business proposal is prohibited and the conservative hold
        // breaks the no-delay prohibition
        let output = arbitrate(vec![
            response(AgentId::Maintenance, "Swap aircraft", &["Aircraft must not be dispatched before inspection"]),
            response(AgentId::Regulatory, "Depart on time", &["Departure must not be delayed"]),
            response(AgentId::Network, "Delay 3 hours", &[]),
        ]);

        assert!(!output.constraints_satisfied);
        assert_eq!(output.solutions.len(), 1);
        assert!(output.confidence <= OVER_CONSTRAINED_CONFIDENCE);
        let fallback = &output.solutions[0];
        assert!(!fallback.constraints_satisfied);
        assert!(fallback.risks.iter().any(|r| r.starts_with("Over-constrained")));
        assert!(output.reasoning.contains("Over-constrained"));
    }

    #[test]
    fn test_arbitration_is_deterministic() {
        let responses = vec![
            response(AgentId::CrewCompliance, "Hold", &["Crew requires 8 hours rest"]),
            response(AgentId::Network, "Delay 2 hours", &[]),
            response(AgentId::GuestExperience, "Rebook connecting passengers", &[]),
            response(AgentId::Finance, "Cancel the flight", &[]),
        ];
        let first = arbitrate(responses.clone());
        let second = arbitrate(responses);
        assert_eq!(first.solutions, second.solutions);
        assert_eq!(first.reasoning, second.reasoning);
    }

    #[test]
    fn test_negated_window_is_a_delay_floor() {
        let output = arbitrate(vec![
            response(AgentId::Maintenance, "Ground the aircraft for inspection", &["Aircraft must not depart within 10 hours"]),
            response(AgentId::Network, "Delay 2 hours", &[]),
        ]);

        assert!(output.constraints_satisfied);
        assert!(!output.solutions.is_empty());
        assert!(output.safety_overrides.iter().any(|o| o.agent == AgentId::Network));
        for solution in &output.solutions {
            assert!(solution.constraints_satisfied);
            assert!(solution.estimated_delay_hours.unwrap_or(0.0) >= 10.0);
        }
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        const SAFETY_AGENTS: [AgentId; 3] =
            [AgentId::CrewCompliance, AgentId::Maintenance, AgentId::Regulatory];
        const BUSINESS_AGENTS: [AgentId; 4] = [
            AgentId::Network,
            AgentId::GuestExperience,
            AgentId::Cargo,
            AgentId::Finance,
        ];

        fn arb_constraint() -> impl Strategy<Value = String> {
            prop_oneof![
                (1u32..24).prop_map(|h| format!("Crew requires {h} hours rest")),
                (1u32..24).prop_map(|h| format!("Aircraft must not depart within {h} hours")),
                (1u32..24).prop_map(|h| format!("Departure no later than {h} hours from now")),
                Just("Flight must not be cancelled".to_string()),
                Just("Do not swap the aircraft".to_string()),
            ]
        }

        fn arb_proposal() -> impl Strategy<Value = String> {
            prop_oneof![
                (0u32..12).prop_map(|h| format!("Delay {h} hours")),
                Just("Cancel the flight and refund".to_string()),
                Just("Swap the aircraft to the spare".to_string()),
                Just("Depart on time".to_string()),
            ]
        }

        fn arb_responses() -> impl Strategy<Value = Vec<AgentResponse>> {
            (
                prop::collection::vec(prop::collection::vec(arb_constraint(), 0..3), 3),
                prop::collection::vec(prop::option::of(arb_proposal()), 4),
            )
                .prop_map(|(constraints, proposals)| {
                    let mut responses = Vec::new();
                    for (agent, texts) in SAFETY_AGENTS.iter().zip(constraints) {
                        let texts: Vec<&str> = texts.iter().map(String::as_str).collect();
                        responses.push(response(*agent, "Hold for review", &texts));
                    }
                    for (agent, proposal) in BUSINESS_AGENTS.iter().zip(proposals) {
                        if let Some(text) = proposal {
                            responses.push(response(*agent, &text, &[]));
                        }
                    }
                    responses
                })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(128))]

            /// A solution reported as satisfying the constraints breaks none of them
            #[test]
            fn prop_satisfied_solutions_respect_active_constraints(responses in arb_responses()) {
                let collation =
                    Collation::from_responses(PhaseTag::Revision, AgentId::all(), responses, 5);
                let scenario = DisruptionScenario::new("Hydraulic fault on inbound aircraft");
                let output = ArbitrationEngine::default().arbitrate("run-p", &scenario, &collation);

                let constraints = extract_constraints(&collation);
                let conflicts = detect_conflicts(&collation, &constraints);
                let resolved = resolve(&conflicts, &constraints);

                prop_assert!(!output.solutions.is_empty());
                for solution in output.solutions.iter().filter(|s| s.constraints_satisfied) {
                    let texts: Vec<&str> = solution.recommendations.iter().map(String::as_str).collect();
                    for constraint in &resolved.active {
                        prop_assert!(
                            !constraint.forecloses(solution.estimated_delay_hours, &texts),
                            "solution {} '{}' breaks '{}'",
                            solution.solution_id,
                            solution.title,
                            constraint.text
                        );
                    }
                }
                if !output.constraints_satisfied {
                    prop_assert!(output.solutions.iter().all(|s| !s.constraints_satisfied));
                }
            }
        }
    }
}
