//! Default agent roster
//!
//! Which data each domain agent reads before reasoning, and the secondary
//! indexes those reads depend on. Safety agents mark their core source as
//! required: without it they cannot issue a position and the run stops as
//! data-unavailable.

use coordination::{AgentId, AgentSpec, ContextSource, IndexDefinition, OrchestratorConfig, ScenarioField};

use crate::config::AgentsConfig;

pub const CREW_BY_FLIGHT: &str = "crew_by_flight";
pub const MAINTENANCE_BY_TAIL: &str = "maintenance_by_tail";
pub const ROTATIONS_BY_TAIL: &str = "rotations_by_tail";
pub const BOOKINGS_BY_FLIGHT: &str = "bookings_by_flight";
pub const CARGO_BY_FLIGHT: &str = "cargo_by_flight";

/// Data sources read by `agent`
pub fn context_sources(agent: AgentId) -> Vec<ContextSource> {
    use ScenarioField::{AircraftRegistration, Airport, FlightNumber};

    match agent {
        AgentId::CrewCompliance => vec![
            ContextSource::new("crew_roster", "crew_roster", FlightNumber)
                .via_index(CREW_BY_FLIGHT)
                .required(),
            ContextSource::new("flight", "flights", FlightNumber),
        ],
        AgentId::Maintenance => vec![
            ContextSource::new("aircraft", "aircraft", AircraftRegistration).required(),
            ContextSource::new("maintenance_log", "maintenance_log", AircraftRegistration)
                .via_index(MAINTENANCE_BY_TAIL),
        ],
        AgentId::Regulatory => vec![
            ContextSource::new("airport_restrictions", "airport_restrictions", Airport).required(),
            ContextSource::new("flight", "flights", FlightNumber),
        ],
        AgentId::Network => vec![
            ContextSource::new("flight", "flights", FlightNumber),
            ContextSource::new("rotation", "rotations", AircraftRegistration)
                .via_index(ROTATIONS_BY_TAIL),
        ],
        AgentId::GuestExperience => vec![
            ContextSource::new("bookings", "bookings", FlightNumber).via_index(BOOKINGS_BY_FLIGHT),
        ],
        AgentId::Cargo => vec![
            ContextSource::new("manifest", "cargo_manifest", FlightNumber).via_index(CARGO_BY_FLIGHT),
        ],
        AgentId::Finance => vec![
            ContextSource::new("flight", "flights", FlightNumber),
            ContextSource::new("cost_rates", "cost_rates", Airport),
        ],
    }
}

/// Every agent with its default sources, in canonical order
pub fn default_roster() -> Vec<AgentSpec> {
    AgentId::all()
        .iter()
        .map(|agent| {
            context_sources(*agent)
                .into_iter()
                .fold(AgentSpec::new(*agent), AgentSpec::with_source)
        })
        .collect()
}

/// Indexes the default roster queries through
pub fn default_indexes() -> Vec<IndexDefinition> {
    vec![
        IndexDefinition::new(CREW_BY_FLIGHT, "crew_roster", "flight_number"),
        IndexDefinition::new(MAINTENANCE_BY_TAIL, "maintenance_log", "aircraft_registration"),
        IndexDefinition::new(ROTATIONS_BY_TAIL, "rotations", "aircraft_registration"),
        IndexDefinition::new(BOOKINGS_BY_FLIGHT, "bookings", "flight_number"),
        IndexDefinition::new(CARGO_BY_FLIGHT, "cargo_manifest", "flight_number"),
    ]
}

/// Orchestrator config with the default roster and models from `agents`
pub fn default_config(agents: &AgentsConfig) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        roster: default_roster(),
        ..OrchestratorConfig::default()
    };
    agents.apply_models(&mut config);
    config
}
