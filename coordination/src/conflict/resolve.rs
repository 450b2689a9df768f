//! Deterministic conflict resolution
//!
//! Rules apply in a fixed priority order: safety over business first, then
//! safety against safety, then business alternatives. Every application is
//! recorded so the arbitration output can show exactly what was overridden and
//! why.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::constraints::{BindingConstraint, ConstraintKind};
use super::detect::{Conflict, ConflictType};
use crate::state::types::AgentId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionRule {
    /// A safety constraint always beats a business proposal
    SafetyOverridesBusiness,
    /// Between safety agents the more conservative position wins
    ConservativeSafetyWins,
    /// Competing business proposals become separate candidates
    ParetoAlternatives,
}

impl ResolutionRule {
    fn priority(conflict_type: ConflictType) -> u8 {
        match conflict_type {
            ConflictType::SafetyVsBusiness => 0,
            ConflictType::SafetyVsSafety => 1,
            ConflictType::BusinessVsBusiness => 2,
        }
    }
}

/// One rule application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub conflict: Conflict,
    pub rule: ResolutionRule,
    /// What was done
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<AgentId>,
    #[serde(default)]
    pub overridden: Vec<AgentId>,
}

/// A recommendation that a safety constraint overrode
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyOverride {
    pub agent: AgentId,
    pub recommendation: String,
    pub constraint: BindingConstraint,
}

/// Constraint set after resolution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedConstraints {
    /// Constraints every candidate must satisfy
    pub active: Vec<BindingConstraint>,
    /// Constraints that lost a safety-vs-safety resolution
    pub superseded: Vec<BindingConstraint>,
    pub resolutions: Vec<ConflictResolution>,
    pub overrides: Vec<SafetyOverride>,
    /// Agents with at least one overridden recommendation
    pub overridden_agents: BTreeSet<AgentId>,
    /// Agents whose recommendation text performs a prohibited action and
    /// therefore cannot seed a candidate
    pub excluded_proposals: BTreeSet<AgentId>,
}

impl ResolvedConstraints {
    /// Largest active minimum delay, 0 when there is none
    pub fn delay_floor(&self) -> f64 {
        self.active
            .iter()
            .filter_map(BindingConstraint::min_delay)
            .fold(0.0, f64::max)
    }

    /// Smallest active maximum delay
    pub fn delay_cap(&self) -> Option<f64> {
        self.active
            .iter()
            .filter_map(BindingConstraint::max_delay)
            .reduce(f64::min)
    }

    pub fn requirements(&self) -> impl Iterator<Item = &BindingConstraint> {
        self.active
            .iter()
            .filter(|c| matches!(c.kind, ConstraintKind::Requirement))
    }
}

/// How restrictive an agent's constraint set is: (required delay, prohibitions)
fn conservativeness(agent: AgentId, constraints: &[BindingConstraint]) -> (f64, usize) {
    let own = constraints.iter().filter(|c| c.source == agent);
    let delay = own
        .clone()
        .filter_map(BindingConstraint::min_delay)
        .fold(0.0, f64::max);
    let prohibitions = own.filter(|c| c.is_prohibition()).count();
    (delay, prohibitions)
}

/// The more conservative of two safety agents; roster order breaks ties.
fn more_conservative(a: AgentId, b: AgentId, constraints: &[BindingConstraint]) -> AgentId {
    let (delay_a, prohibitions_a) = conservativeness(a, constraints);
    let (delay_b, prohibitions_b) = conservativeness(b, constraints);
    let ordering = delay_a
        .total_cmp(&delay_b)
        .then(prohibitions_a.cmp(&prohibitions_b))
        .then(b.cmp(&a));
    if ordering.is_ge() {
        a
    } else {
        b
    }
}

/// Apply the resolution rules to `conflicts`.
pub fn resolve(conflicts: &[Conflict], constraints: &[BindingConstraint]) -> ResolvedConstraints {
    let mut ordered: Vec<&Conflict> = conflicts.iter().collect();
    ordered.sort_by_key(|c| ResolutionRule::priority(c.conflict_type));

    let mut resolved = ResolvedConstraints::default();

    for conflict in ordered {
        match conflict.conflict_type {
            ConflictType::SafetyVsBusiness => resolve_safety_vs_business(conflict, &mut resolved),
            ConflictType::SafetyVsSafety => {
                resolve_safety_vs_safety(conflict, constraints, &mut resolved)
            }
            ConflictType::BusinessVsBusiness => {
                resolved.resolutions.push(ConflictResolution {
                    conflict: conflict.clone(),
                    rule: ResolutionRule::ParetoAlternatives,
                    action: format!(
                        "kept {} as separate candidate proposals",
                        join_agents(&conflict.agents)
                    ),
                    winner: None,
                    overridden: Vec::new(),
                });
            }
        }
    }

    resolved.active = constraints
        .iter()
        .filter(|c| !resolved.superseded.contains(c))
        .cloned()
        .collect();
    resolved
}

fn resolve_safety_vs_business(conflict: &Conflict, resolved: &mut ResolvedConstraints) {
    let (Some(constraint), [safety, business, ..]) = (&conflict.constraint, conflict.agents.as_slice()) else {
        return;
    };

    let action = match &constraint.kind {
        ConstraintKind::MinimumDelay { hours } => {
            format!("extended {business} timeline to at least {hours:.1}h")
        }
        ConstraintKind::MaximumDelay { hours } => {
            format!("capped {business} timeline at {hours:.1}h")
        }
        ConstraintKind::Prohibition { .. } => {
            resolved.excluded_proposals.insert(*business);
            format!("excluded {business} proposal from candidate seeds")
        }
        ConstraintKind::Requirement => format!("added required step for {business}"),
    };

    resolved.overridden_agents.insert(*business);
    resolved.overrides.push(SafetyOverride {
        agent: *business,
        recommendation: conflict.foreclosed_recommendation.clone().unwrap_or_default(),
        constraint: constraint.clone(),
    });
    resolved.resolutions.push(ConflictResolution {
        conflict: conflict.clone(),
        rule: ResolutionRule::SafetyOverridesBusiness,
        action,
        winner: Some(*safety),
        overridden: vec![*business],
    });
}

fn resolve_safety_vs_safety(
    conflict: &Conflict,
    constraints: &[BindingConstraint],
    resolved: &mut ResolvedConstraints,
) {
    let (Some(constraint), [owner, other, ..]) = (&conflict.constraint, conflict.agents.as_slice()) else {
        return;
    };

    match &conflict.counter_constraint {
        // Interval conflict: one agent's floor sits above the other's cap
        Some(counter) => {
            let winner = more_conservative(*owner, *other, constraints);
            let loser_constraint = if winner == *owner { counter } else { constraint };
            let loser = loser_constraint.source;
            if !resolved.superseded.contains(loser_constraint) {
                resolved.superseded.push(loser_constraint.clone());
            }
            resolved.resolutions.push(ConflictResolution {
                conflict: conflict.clone(),
                rule: ResolutionRule::ConservativeSafetyWins,
                action: format!("superseded {loser} constraint: {}", loser_constraint.text),
                winner: Some(winner),
                overridden: vec![loser],
            });
        }
        // Prohibition against a peer's recommendation: the prohibition stands
        None => {
            resolved.excluded_proposals.insert(*other);
            resolved.overridden_agents.insert(*other);
            resolved.overrides.push(SafetyOverride {
                agent: *other,
                recommendation: conflict.foreclosed_recommendation.clone().unwrap_or_default(),
                constraint: constraint.clone(),
            });
            resolved.resolutions.push(ConflictResolution {
                conflict: conflict.clone(),
                rule: ResolutionRule::ConservativeSafetyWins,
                action: format!("upheld {owner} prohibition over {other} recommendation"),
                winner: Some(*owner),
                overridden: vec![*other],
            });
        }
    }
}

fn join_agents(agents: &[AgentId]) -> String {
    agents
        .iter()
        .map(AgentId::as_str)
        .collect::<Vec<_>>()
        .join(" and ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::constraints::extract_constraints;
    use crate::conflict::detect::detect_conflicts;
    use crate::state::types::{AgentResponse, Collation, PhaseTag, ResponseStatus};
    use chrono::Utc;

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

    fn run(responses: Vec<AgentResponse>) -> ResolvedConstraints {
        let collation = Collation::from_responses(PhaseTag::Revision, AgentId::all(), responses, 1);
        let constraints = extract_constraints(&collation);
        let conflicts = detect_conflicts(&collation, &constraints);
        resolve(&conflicts, &constraints)
    }

    #[test]
    fn test_safety_overrides_business() {
        let resolved = run(vec![
            response(AgentId::CrewCompliance, "Hold for crew rest", &["Crew requires 10 hours rest"]),
            response(AgentId::Network, "Delay 2 hours", &[]),
        ]);

        assert_eq!(resolved.resolutions.len(), 1);
        assert_eq!(resolved.resolutions[0].rule, ResolutionRule::SafetyOverridesBusiness);
        assert_eq!(resolved.overrides.len(), 1);
        assert_eq!(resolved.overrides[0].agent, AgentId::Network);
        assert_eq!(resolved.overrides[0].recommendation, "Delay 2 hours");
        assert!(resolved.overridden_agents.contains(&AgentId::Network));
        assert!((resolved.delay_floor() - 10.0).abs() < 1e-9);
        assert_eq!(resolved.active.len(), 1);
    }

    #[test]
    fn test_longer_delay_wins_between_safety_agents() {
        let resolved = run(vec![
            response(AgentId::CrewCompliance, "Hold for crew rest", &["Crew requires 10 hours rest"]),
            response(AgentId::Regulatory, "Depart before curfew", &["Departure must occur within 6 hours"]),
        ]);

        assert_eq!(resolved.resolutions.len(), 1);
        let resolution = &resolved.resolutions[0];
        assert_eq!(resolution.rule, ResolutionRule::ConservativeSafetyWins);
        assert_eq!(resolution.winner, Some(AgentId::CrewCompliance));
        assert_eq!(resolved.superseded.len(), 1);
        assert_eq!(resolved.superseded[0].source, AgentId::Regulatory);
        assert_eq!(resolved.delay_cap(), None);
        assert_eq!(resolved.active.len(), 1);
    }

    #[test]
    fn test_prohibition_excludes_peer_proposal() {
        let resolved = run(vec![
            response(AgentId::Maintenance, "Ferry the aircraft to the maintenance base", &[]),
            response(AgentId::Regulatory, "Hold", &["Aircraft must not be ferried to the maintenance base"]),
        ]);

        assert!(resolved.excluded_proposals.contains(&AgentId::Maintenance));
        assert_eq!(resolved.resolutions[0].winner, Some(AgentId::Regulatory));
    }

    #[test]
    fn test_business_alternatives_recorded() {
        let resolved = run(vec![
            response(AgentId::Network, "Delay 2 hours", &[]),
            response(AgentId::Finance, "Cancel the flight", &[]),
        ]);

        assert_eq!(resolved.resolutions.len(), 1);
        assert_eq!(resolved.resolutions[0].rule, ResolutionRule::ParetoAlternatives);
        assert!(resolved.resolutions[0].winner.is_none());
        assert!(resolved.overrides.is_empty());
    }

    #[test]
    fn test_roster_order_breaks_ties() {
        let constraints = vec![
            BindingConstraint::parse(AgentId::Regulatory, "rest 5 hours"),
            BindingConstraint::parse(AgentId::Maintenance, "rest 5 hours"),
        ];
        assert_eq!(
            more_conservative(AgentId::Regulatory, AgentId::Maintenance, &constraints),
            AgentId::Maintenance
        );
        assert_eq!(
            more_conservative(AgentId::Maintenance, AgentId::Regulatory, &constraints),
            AgentId::Maintenance
        );
    }
}
