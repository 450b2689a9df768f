//! Pairwise conflict detection over a revision collation

use serde::{Deserialize, Serialize};

use super::constraints::{parse_duration_hours, proposed_delay, words, BindingConstraint, ConstraintKind, DELAY_EPSILON, NEGATIONS};
use crate::state::types::{AgentId, AgentResponse, Collation};

/// Delays closer than this are the same course of action
pub const DELAY_CONFLICT_HOURS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    SafetyVsBusiness,
    SafetyVsSafety,
    BusinessVsBusiness,
}

impl std::fmt::Display for ConflictType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictType::SafetyVsBusiness => write!(f, "safety_vs_business"),
            ConflictType::SafetyVsSafety => write!(f, "safety_vs_safety"),
            ConflictType::BusinessVsBusiness => write!(f, "business_vs_business"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Broad class of what a recommendation does to the flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseOfAction {
    Cancel,
    Swap,
    Reroute,
    Delay,
    Proceed,
    /// Measures that fit any course (rebooking, vouchers, notifications)
    Supporting,
}

impl std::fmt::Display for CourseOfAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CourseOfAction::Cancel => "cancel",
            CourseOfAction::Swap => "swap",
            CourseOfAction::Reroute => "reroute",
            CourseOfAction::Delay => "delay",
            CourseOfAction::Proceed => "proceed",
            CourseOfAction::Supporting => "supporting",
        };
        write!(f, "{name}")
    }
}

const COURSE_ROOTS: &[(CourseOfAction, &[&str])] = &[
    (CourseOfAction::Cancel, &["cancel"]),
    (CourseOfAction::Swap, &["swap", "substitut"]),
    (CourseOfAction::Reroute, &["reroute", "divert"]),
    (CourseOfAction::Delay, &["delay", "hold", "postpon", "retim", "resched"]),
    (CourseOfAction::Proceed, &["proceed", "schedul", "ontime"]),
];

/// Whether any clause of `text` uses one of `roots` without a preceding negation
fn mentions(text: &str, roots: &[&str]) -> bool {
    text.split([';', ',', '.']).any(|clause| {
        let tokens = words(clause);
        tokens.iter().enumerate().any(|(i, word)| {
            roots.iter().any(|root| word.starts_with(root))
                && !tokens[i.saturating_sub(3)..i]
                    .iter()
                    .any(|w| NEGATIONS.contains(&w.as_str()))
        })
    })
}

/// Class of `text`; the first non-negated root wins in priority order.
pub fn classify_course(text: &str) -> CourseOfAction {
    for (course, roots) in COURSE_ROOTS {
        if mentions(text, roots) {
            return *course;
        }
    }
    if parse_duration_hours(text).is_some() {
        return CourseOfAction::Delay;
    }
    CourseOfAction::Supporting
}

/// What a response proposes for the flight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProposedCourse {
    pub class: CourseOfAction,
    /// `None` when the course sets no departure time
    pub delay_hours: Option<f64>,
}

impl ProposedCourse {
    pub fn of(response: &AgentResponse) -> Self {
        let class = classify_course(&response.recommendation);
        let delay_hours = match class {
            CourseOfAction::Cancel => None,
            CourseOfAction::Proceed => Some(proposed_delay(response).unwrap_or(0.0)),
            _ => proposed_delay(response),
        };
        Self { class, delay_hours }
    }

    /// Whether two courses cannot be executed together
    pub fn excludes(&self, other: &ProposedCourse) -> bool {
        if self.class == CourseOfAction::Supporting || other.class == CourseOfAction::Supporting {
            return false;
        }
        if self.class != other.class {
            return true;
        }
        match (self.delay_hours, other.delay_hours) {
            (Some(a), Some(b)) => (a - b).abs() + DELAY_EPSILON >= DELAY_CONFLICT_HOURS,
            _ => false,
        }
    }
}

/// A detected disagreement between two agents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub conflict_type: ConflictType,
    /// Constraint owner first for safety conflicts, roster order otherwise
    pub agents: Vec<AgentId>,
    pub description: String,
    pub severity: Severity,
    /// Constraint that forecloses the other side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<BindingConstraint>,
    /// Opposing constraint in a safety-vs-safety interval conflict
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counter_constraint: Option<BindingConstraint>,
    /// Recommendation that was foreclosed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreclosed_recommendation: Option<String>,
}

fn action_texts(response: &AgentResponse) -> Vec<&str> {
    let mut texts = vec![response.recommendation.as_str()];
    if let Some(impact) = &response.impact {
        texts.extend(impact.actions.iter().map(String::as_str));
    }
    texts
}

fn describe_delay(delay: Option<f64>) -> String {
    match delay {
        Some(hours) => format!("a {hours:.1}h delay"),
        None => "no departure".to_string(),
    }
}

/// Detect every pairwise conflict among successful responses.
///
/// Pairs are visited in roster order and constraints in extraction order, so
/// the result is deterministic for a given collation.
pub fn detect_conflicts(collation: &Collation, constraints: &[BindingConstraint]) -> Vec<Conflict> {
    let responses: Vec<&AgentResponse> = collation.successful().collect();
    let mut conflicts = Vec::new();

    for (i, a) in responses.iter().enumerate() {
        for b in &responses[i + 1..] {
            match (a.agent.is_safety(), b.agent.is_safety()) {
                (true, false) => safety_vs_business(a, b, constraints, &mut conflicts),
                (false, true) => safety_vs_business(b, a, constraints, &mut conflicts),
                (true, true) => {
                    safety_vs_safety(a, b, constraints, &mut conflicts);
                    safety_vs_safety(b, a, constraints, &mut conflicts);
                }
                (false, false) => business_vs_business(a, b, &mut conflicts),
            }
        }
    }
    conflicts
}

fn safety_vs_business(
    safety: &AgentResponse,
    business: &AgentResponse,
    constraints: &[BindingConstraint],
    out: &mut Vec<Conflict>,
) {
    let course = ProposedCourse::of(business);
    let texts = action_texts(business);

    for constraint in constraints.iter().filter(|c| c.source == safety.agent) {
        if !constraint.forecloses(course.delay_hours, &texts) {
            continue;
        }
        let severity = match &constraint.kind {
            ConstraintKind::Prohibition { .. } => Severity::Critical,
            ConstraintKind::MinimumDelay { hours } => {
                let shortfall = hours - course.delay_hours.unwrap_or(*hours);
                if shortfall * 2.0 >= *hours {
                    Severity::High
                } else {
                    Severity::Medium
                }
            }
            ConstraintKind::MaximumDelay { .. } => Severity::High,
            ConstraintKind::Requirement => Severity::Low,
        };
        out.push(Conflict {
            conflict_type: ConflictType::SafetyVsBusiness,
            agents: vec![safety.agent, business.agent],
            description: format!(
                "{} proposes {} ({}) but {} requires: {}",
                business.agent,
                describe_delay(course.delay_hours),
                business.recommendation,
                safety.agent,
                constraint.text
            ),
            severity,
            constraint: Some(constraint.clone()),
            counter_constraint: None,
            foreclosed_recommendation: Some(business.recommendation.clone()),
        });
    }
}

/// Conflicts where a constraint of `owner` forecloses `other`
fn safety_vs_safety(
    owner: &AgentResponse,
    other: &AgentResponse,
    constraints: &[BindingConstraint],
    out: &mut Vec<Conflict>,
) {
    let texts = action_texts(other);

    for constraint in constraints.iter().filter(|c| c.source == owner.agent) {
        match &constraint.kind {
            ConstraintKind::MinimumDelay { hours: floor } => {
                for counter in constraints.iter().filter(|c| c.source == other.agent) {
                    if let Some(cap) = counter.max_delay() {
                        if cap + DELAY_EPSILON < *floor {
                            out.push(Conflict {
                                conflict_type: ConflictType::SafetyVsSafety,
                                agents: vec![owner.agent, other.agent],
                                description: format!(
                                    "{} requires at least {floor:.1}h ({}) but {} allows at most {cap:.1}h ({})",
                                    owner.agent, constraint.text, other.agent, counter.text
                                ),
                                severity: Severity::Critical,
                                constraint: Some(constraint.clone()),
                                counter_constraint: Some(counter.clone()),
                                foreclosed_recommendation: None,
                            });
                        }
                    }
                }
            }
            ConstraintKind::Prohibition { .. } => {
                if constraint.forecloses(None, &texts) {
                    out.push(Conflict {
                        conflict_type: ConflictType::SafetyVsSafety,
                        agents: vec![owner.agent, other.agent],
                        description: format!(
                            "{} recommends '{}' which {} prohibits: {}",
                            other.agent, other.recommendation, owner.agent, constraint.text
                        ),
                        severity: Severity::High,
                        constraint: Some(constraint.clone()),
                        counter_constraint: None,
                        foreclosed_recommendation: Some(other.recommendation.clone()),
                    });
                }
            }
            ConstraintKind::MaximumDelay { .. } | ConstraintKind::Requirement => {}
        }
    }
}

fn business_vs_business(a: &AgentResponse, b: &AgentResponse, out: &mut Vec<Conflict>) {
    let course_a = ProposedCourse::of(a);
    let course_b = ProposedCourse::of(b);
    if !course_a.excludes(&course_b) {
        return;
    }

    let severity = if course_a.class != course_b.class {
        Severity::Medium
    } else {
        Severity::Low
    };
    out.push(Conflict {
        conflict_type: ConflictType::BusinessVsBusiness,
        agents: vec![a.agent, b.agent],
        description: format!(
            "{} proposes {} with {} while {} proposes {} with {}",
            a.agent,
            course_a.class,
            describe_delay(course_a.delay_hours),
            b.agent,
            course_b.class,
            describe_delay(course_b.delay_hours)
        ),
        severity,
        constraint: None,
        counter_constraint: None,
        foreclosed_recommendation: None,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::constraints::extract_constraints;
    use crate::state::types::{ImpactAssessment, PhaseTag, ResponseStatus};
    use chrono::Utc;

    fn response(agent: AgentId, recommendation: &str, constraints: &[&str]) -> AgentResponse {
        AgentResponse {
            agent,
            phase: PhaseTag::Revision,
            recommendation: recommendation.into(),
            reasoning: "analysis".into(),
            confidence: 0.8,
            binding_constraints: constraints.iter().map(|s| s.to_string()).collect(),
            impact: None,
            status: ResponseStatus::Success,
            duration_ms: 1,
            timestamp: Utc::now(),
            extracted_context: None,
            missing_data: Vec::new(),
        }
    }

    fn collation(responses: Vec<AgentResponse>) -> Collation {
        Collation::from_responses(PhaseTag::Revision, AgentId::all(), responses, 10)
    }

    #[test]
    fn test_course_classification() {
        assert_eq!(classify_course("Cancel XY123 and rebook"), CourseOfAction::Cancel);
        assert_eq!(classify_course("Do not cancel; delay 3 hours"), CourseOfAction::Delay);
        assert_eq!(classify_course("Swap to spare aircraft"), CourseOfAction::Swap);
        assert_eq!(classify_course("Depart 2 hours late"), CourseOfAction::Delay);
        assert_eq!(classify_course("Proceed as scheduled"), CourseOfAction::Proceed);
        assert_eq!(classify_course("Issue meal vouchers and rebook connections"), CourseOfAction::Supporting);
    }

    #[test]
    fn test_safety_minimum_delay_forecloses_short_delay() {
        let collation = collation(vec![
            response(AgentId::CrewCompliance, "Delay until crew rested", &["Crew requires 10 hours rest"]),
            response(AgentId::Network, "Delay 2 hours to protect connections", &[]),
        ]);
        let constraints = extract_constraints(&collation);
        let conflicts = detect_conflicts(&collation, &constraints);

        assert_eq!(conflicts.len(), 1);
        let conflict = &conflicts[0];
        assert_eq!(conflict.conflict_type, ConflictType::SafetyVsBusiness);
        assert_eq!(conflict.agents, vec![AgentId::CrewCompliance, AgentId::Network]);
        assert_eq!(conflict.severity, Severity::High);
    }

    #[test]
    fn test_impact_delay_takes_precedence() {
        let mut network = response(AgentId::Network, "Retime the departure", &[]);
        network.impact = Some(ImpactAssessment {
            estimated_delay_hours: Some(12.0),
            ..Default::default()
        });
        let collation = collation(vec![
            response(AgentId::CrewCompliance, "Delay", &["Crew requires 10 hours rest"]),
            network,
        ]);
        let constraints = extract_constraints(&collation);
        assert!(detect_conflicts(&collation, &constraints).is_empty());
    }

    #[test]
    fn test_safety_vs_safety_interval() {
        let collation = collation(vec![
            response(AgentId::CrewCompliance, "Delay for rest", &["Crew requires 10 hours rest"]),
            response(AgentId::Regulatory, "Depart before curfew", &["Departure must occur within 6 hours"]),
        ]);
        let constraints = extract_constraints(&collation);
        let conflicts = detect_conflicts(&collation, &constraints);

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].conflict_type, ConflictType::SafetyVsSafety);
        assert_eq!(conflicts[0].severity, Severity::Critical);
        assert_eq!(conflicts[0].counter_constraint.as_ref().unwrap().source, AgentId::Regulatory);
    }

    #[test]
    fn test_business_courses() {
        let collation = collation(vec![
            response(AgentId::Network, "Delay 2 hours", &[]),
            response(AgentId::GuestExperience, "Rebook connecting passengers", &[]),
            response(AgentId::Cargo, "Delay 2.5 hours for perishables", &[]),
            response(AgentId::Finance, "Cancel the flight", &[]),
        ]);
        let conflicts = detect_conflicts(&collation, &[]);

        // network/cargo within the hour; finance excludes both
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts
            .iter()
            .all(|c| c.conflict_type == ConflictType::BusinessVsBusiness && c.agents.contains(&AgentId::Finance)));
    }

    #[test]
    fn test_failed_responses_are_ignored() {
        let mut network = response(AgentId::Network, "Delay 1 hour", &[]);
        network.status = ResponseStatus::Timeout;
        let collation = collation(vec![
            response(AgentId::CrewCompliance, "Delay", &["Crew requires 10 hours rest"]),
            network,
        ]);
        let constraints = extract_constraints(&collation);
        assert!(detect_conflicts(&collation, &constraints).is_empty());
    }
}
