//! Core types for disruption recovery runs
//!
//! These types describe the scenario, the fixed agent roster and the per-phase
//! agent output. Every value is created fresh per run and is never mutated once
//! it has been handed to the next stage; later stages copy what they need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Unique identifier for a disruption-handling run
pub type RunId = String;

/// Whether an agent produces binding constraints or optimization proposals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Authoritative: emits binding constraints
    Safety,
    /// Advisory: emits optimization proposals
    Business,
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentKind::Safety => write!(f, "safety"),
            AgentKind::Business => write!(f, "business"),
        }
    }
}

/// Domain agents participating in a run
///
/// The declaration order is the canonical roster order: safety agents first.
/// `BTreeMap<AgentId, _>` iteration relies on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// Crew duty time and rest requirements
    CrewCompliance,
    /// Airworthiness, inspections, MEL deferrals
    Maintenance,
    /// Curfews, slots, NOTAMs, passenger-rights regulation
    Regulatory,
    /// Downstream rotations and connections
    Network,
    /// Passenger re-accommodation and care
    GuestExperience,
    /// Cargo and special shipments
    Cargo,
    /// Cost of recovery options
    Finance,
}

impl AgentId {
    /// Whether this agent is a safety or business agent
    pub fn kind(&self) -> AgentKind {
        match self {
            AgentId::CrewCompliance | AgentId::Maintenance | AgentId::Regulatory => {
                AgentKind::Safety
            }
            AgentId::Network | AgentId::GuestExperience | AgentId::Cargo | AgentId::Finance => {
                AgentKind::Business
            }
        }
    }

    pub fn is_safety(&self) -> bool {
        self.kind() == AgentKind::Safety
    }

    /// Stable identifier used in config files, keys and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentId::CrewCompliance => "crew_compliance",
            AgentId::Maintenance => "maintenance",
            AgentId::Regulatory => "regulatory",
            AgentId::Network => "network",
            AgentId::GuestExperience => "guest_experience",
            AgentId::Cargo => "cargo",
            AgentId::Finance => "finance",
        }
    }

    /// Party responsible for executing steps derived from this agent
    pub fn responsible_party(&self) -> &'static str {
        match self {
            AgentId::CrewCompliance => "Crew Scheduling",
            AgentId::Maintenance => "Maintenance Control",
            AgentId::Regulatory => "Compliance Office",
            AgentId::Network => "Network Operations Control",
            AgentId::GuestExperience => "Customer Service",
            AgentId::Cargo => "Cargo Operations",
            AgentId::Finance => "Revenue Management",
        }
    }

    /// Full roster in canonical order
    pub fn all() -> &'static [AgentId] {
        &[
            AgentId::CrewCompliance,
            AgentId::Maintenance,
            AgentId::Regulatory,
            AgentId::Network,
            AgentId::GuestExperience,
            AgentId::Cargo,
            AgentId::Finance,
        ]
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentId::all()
            .iter()
            .copied()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| format!("unknown agent: {}", s))
    }
}

/// Which collation round a response belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseTag {
    /// First independent assessment
    Initial,
    /// Second pass with peers' initial responses as context
    Revision,
}

impl std::fmt::Display for PhaseTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PhaseTag::Initial => write!(f, "initial"),
            PhaseTag::Revision => write!(f, "revision"),
        }
    }
}

/// Outcome classification of a single agent invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Timeout,
    Error,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseStatus::Success => write!(f, "success"),
            ResponseStatus::Timeout => write!(f, "timeout"),
            ResponseStatus::Error => write!(f, "error"),
        }
    }
}

/// Immutable disruption input for one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisruptionScenario {
    /// Unique scenario identifier
    pub id: String,
    /// Free-text description as reported
    pub description: String,
    /// Affected flight, if extracted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flight_number: Option<String>,
    /// Affected aircraft tail, if extracted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aircraft_registration: Option<String>,
    /// Station where the disruption occurs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub airport: Option<String>,
    /// Scheduled departure time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_departure: Option<DateTime<Utc>>,
    /// Reported magnitude of the disruption in hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_hours: Option<f64>,
    /// When the scenario was received
    pub received_at: DateTime<Utc>,
}

impl DisruptionScenario {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.into(),
            flight_number: None,
            aircraft_registration: None,
            airport: None,
            scheduled_departure: None,
            delay_hours: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_flight(mut self, flight_number: impl Into<String>) -> Self {
        self.flight_number = Some(flight_number.into());
        self
    }

    pub fn with_aircraft(mut self, registration: impl Into<String>) -> Self {
        self.aircraft_registration = Some(registration.into());
        self
    }

    pub fn with_airport(mut self, airport: impl Into<String>) -> Self {
        self.airport = Some(airport.into());
        self
    }

    pub fn with_departure(mut self, departure: DateTime<Utc>) -> Self {
        self.scheduled_departure = Some(departure);
        self
    }

    pub fn with_delay_hours(mut self, hours: f64) -> Self {
        self.delay_hours = Some(hours);
        self
    }

    /// Value of a structured field by name, used to derive lookup keys
    pub fn field(&self, name: ScenarioField) -> Option<&str> {
        match name {
            ScenarioField::FlightNumber => self.flight_number.as_deref(),
            ScenarioField::AircraftRegistration => self.aircraft_registration.as_deref(),
            ScenarioField::Airport => self.airport.as_deref(),
            ScenarioField::ScenarioId => Some(self.id.as_str()),
        }
    }
}

/// Structured scenario fields that can key a data lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioField {
    FlightNumber,
    AircraftRegistration,
    Airport,
    ScenarioId,
}

/// Agent-supplied impact figures, already normalized to [0, 100]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ImpactAssessment {
    /// Safety margin of the proposal (higher is safer)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub safety_score: Option<f64>,
    /// Cost efficiency (higher is cheaper)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_score: Option<f64>,
    /// Passenger outcome (higher is better for passengers)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub passenger_score: Option<f64>,
    /// Network stability (higher means less downstream disruption)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_score: Option<f64>,
    /// Delay the proposal implies, in hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_delay_hours: Option<f64>,
    /// Concrete actions, in execution order
    #[serde(default)]
    pub actions: Vec<String>,
}

/// One agent's opinion for one phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub agent: AgentId,
    pub phase: PhaseTag,
    pub recommendation: String,
    pub reasoning: String,
    /// Self-reported confidence (0.0 - 1.0)
    pub confidence: f64,
    /// Non-empty only for safety agents
    #[serde(default)]
    pub binding_constraints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<ImpactAssessment>,
    pub status: ResponseStatus,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    /// Echo of the data the agent was given
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_context: Option<serde_json::Value>,
    /// Required data that could not be retrieved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_data: Vec<String>,
}

impl AgentResponse {
    /// Response for an invocation that hit its deadline
    pub fn timeout(agent: AgentId, phase: PhaseTag, duration_ms: u64) -> Self {
        Self {
            agent,
            phase,
            recommendation: String::new(),
            reasoning: format!("{} did not respond within {}ms", agent, duration_ms),
            confidence: 0.0,
            binding_constraints: Vec::new(),
            impact: None,
            status: ResponseStatus::Timeout,
            duration_ms,
            timestamp: Utc::now(),
            extracted_context: None,
            missing_data: Vec::new(),
        }
    }

    /// Response for an invocation that failed; the error text goes in `reasoning`
    pub fn error(agent: AgentId, phase: PhaseTag, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            agent,
            phase,
            recommendation: String::new(),
            reasoning: error.into(),
            confidence: 0.0,
            binding_constraints: Vec::new(),
            impact: None,
            status: ResponseStatus::Error,
            duration_ms,
            timestamp: Utc::now(),
            extracted_context: None,
            missing_data: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Check the schema invariants of a response
    pub fn check_invariants(&self) -> Result<(), String> {
        if self.is_success() {
            if self.recommendation.trim().is_empty() {
                return Err(format!("{}: successful response has empty recommendation", self.agent));
            }
            if self.reasoning.trim().is_empty() {
                return Err(format!("{}: successful response has empty reasoning", self.agent));
            }
        }
        if !self.binding_constraints.is_empty() && !self.agent.is_safety() {
            return Err(format!(
                "{}: business agent emitted {} binding constraint(s)",
                self.agent,
                self.binding_constraints.len()
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(format!(
                "{}: confidence {} outside [0, 1]",
                self.agent, self.confidence
            ));
        }
        Ok(())
    }
}

/// Complete result of one phase: one response per roster agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collation {
    pub phase: PhaseTag,
    pub responses: BTreeMap<AgentId, AgentResponse>,
    pub timestamp: DateTime<Utc>,
    /// Wall-clock duration of the phase
    pub duration_ms: u64,
}

impl Collation {
    /// Build a collation covering exactly `roster`.
    ///
    /// Responses are keyed by their embedded agent. Roster agents with no
    /// response get an error entry; responses from agents outside the roster are
    /// dropped.
    pub fn from_responses(
        phase: PhaseTag,
        roster: &[AgentId],
        responses: Vec<AgentResponse>,
        duration_ms: u64,
    ) -> Self {
        let mut by_agent: BTreeMap<AgentId, AgentResponse> = BTreeMap::new();
        for response in responses {
            if roster.contains(&response.agent) {
                by_agent.entry(response.agent).or_insert(response);
            }
        }
        for agent in roster {
            by_agent.entry(*agent).or_insert_with(|| {
                AgentResponse::error(*agent, phase, "no response recorded for agent", 0)
            });
        }

        Self {
            phase,
            responses: by_agent,
            timestamp: Utc::now(),
            duration_ms,
        }
    }

    pub fn get(&self, agent: AgentId) -> Option<&AgentResponse> {
        self.responses.get(&agent)
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Successful responses in roster order
    pub fn successful(&self) -> impl Iterator<Item = &AgentResponse> {
        self.responses.values().filter(|r| r.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.successful().count()
    }

    /// Count of responses with the given status
    pub fn count_status(&self, status: ResponseStatus) -> usize {
        self.responses.values().filter(|r| r.status == status).count()
    }

    /// Responses of every agent except `agent`
    pub fn peers_of(&self, agent: AgentId) -> Vec<AgentResponse> {
        self.responses
            .values()
            .filter(|r| r.agent != agent)
            .cloned()
            .collect()
    }

    /// Copy in which every safety agent that failed here but succeeded in
    /// `prior` keeps its prior response, with the agents carried over.
    pub fn with_safety_carried_from(&self, prior: &Collation) -> (Collation, Vec<AgentId>) {
        let mut carried = Vec::new();
        let mut merged = self.clone();
        for (agent, response) in merged.responses.iter_mut() {
            if !agent.is_safety() || response.is_success() {
                continue;
            }
            if let Some(earlier) = prior.get(*agent).filter(|r| r.is_success()) {
                *response = earlier.clone();
                carried.push(*agent);
            }
        }
        (merged, carried)
    }

    /// Whether the key set equals `roster` and every key matches its response
    pub fn is_complete_for(&self, roster: &[AgentId]) -> bool {
        self.responses.len() == roster.len()
            && roster.iter().all(|a| self.responses.contains_key(a))
            && self.responses.iter().all(|(k, v)| *k == v.agent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success(agent: AgentId) -> AgentResponse {
        AgentResponse {
            agent,
            phase: PhaseTag::Initial,
            recommendation: "Delay 2h".to_string(),
            reasoning: "Because".to_string(),
            confidence: 0.8,
            binding_constraints: Vec::new(),
            impact: None,
            status: ResponseStatus::Success,
            duration_ms: 10,
            timestamp: Utc::now(),
            extracted_context: None,
            missing_data: Vec::new(),
        }
    }

    #[test]
    fn test_agent_kinds() {
        let safety: Vec<_> = AgentId::all().iter().filter(|a| a.is_safety()).collect();
        assert_eq!(safety.len(), 3);
        assert_eq!(AgentId::all().len(), 7);
        assert_eq!(AgentId::Finance.kind(), AgentKind::Business);
    }

    #[test]
    fn test_agent_id_roundtrip_str() {
        for agent in AgentId::all() {
            let parsed: AgentId = agent.as_str().parse().unwrap();
            assert_eq!(parsed, *agent);
        }
        assert!("pilot".parse::<AgentId>().is_err());
    }

    #[test]
    fn test_collation_fills_missing_roster_entries() {
        let roster = AgentId::all();
        let collation = Collation::from_responses(
            PhaseTag::Initial,
            roster,
            vec![success(AgentId::Network)],
            100,
        );

        assert_eq!(collation.len(), roster.len());
        assert!(collation.is_complete_for(roster));
        assert_eq!(collation.success_count(), 1);
        assert_eq!(
            collation.get(AgentId::Cargo).unwrap().status,
            ResponseStatus::Error
        );
    }

    #[test]
    fn test_collation_drops_agents_outside_roster() {
        let roster = [AgentId::Network, AgentId::Finance];
        let collation = Collation::from_responses(
            PhaseTag::Initial,
            &roster,
            vec![success(AgentId::Cargo), success(AgentId::Finance)],
            5,
        );
        assert_eq!(collation.len(), 2);
        assert!(collation.get(AgentId::Cargo).is_none());
    }

    #[test]
    fn test_peers_exclude_self() {
        let collation = Collation::from_responses(
            PhaseTag::Initial,
            AgentId::all(),
            AgentId::all().iter().map(|a| success(*a)).collect(),
            5,
        );
        let peers = collation.peers_of(AgentId::Maintenance);
        assert_eq!(peers.len(), 6);
        assert!(peers.iter().all(|p| p.agent != AgentId::Maintenance));
    }

    #[test]
    fn test_failed_safety_agent_keeps_prior_position() {
        let mut crew = success(AgentId::CrewCompliance);
        crew.binding_constraints = vec!["Crew requires 10 hours rest".to_string()];
        let initial = Collation::from_responses(
            PhaseTag::Initial,
            AgentId::all(),
            vec![crew, success(AgentId::Network), success(AgentId::Cargo)],
            5,
        );
        let revision = Collation::from_responses(
            PhaseTag::Revision,
            AgentId::all(),
            vec![
                AgentResponse::timeout(AgentId::CrewCompliance, PhaseTag::Revision, 30_000),
                AgentResponse::timeout(AgentId::Cargo, PhaseTag::Revision, 30_000),
                success(AgentId::Network),
            ],
            5,
        );

        let (merged, carried) = revision.with_safety_carried_from(&initial);
        assert_eq!(carried, vec![AgentId::CrewCompliance]);
        let crew = merged.get(AgentId::CrewCompliance).unwrap();
        assert!(crew.is_success());
        assert_eq!(crew.binding_constraints, vec!["Crew requires 10 hours rest"]);
        // business agents are never carried
        assert!(!merged.get(AgentId::Cargo).unwrap().is_success());
        assert!(!revision.get(AgentId::CrewCompliance).unwrap().is_success());
    }

    #[test]
    fn test_invariants() {
        let mut response = success(AgentId::Network);
        assert!(response.check_invariants().is_ok());

        response.binding_constraints = vec!["must rest 10h".to_string()];
        assert!(response.check_invariants().is_err());

        let mut response = success(AgentId::CrewCompliance);
        response.binding_constraints = vec!["must rest 10h".to_string()];
        assert!(response.check_invariants().is_ok());

        response.recommendation = "  ".to_string();
        assert!(response.check_invariants().is_err());

        let timeout = AgentResponse::timeout(AgentId::Cargo, PhaseTag::Revision, 30_000);
        assert!(timeout.check_invariants().is_ok());
        assert!(timeout.recommendation.is_empty());
    }
}
