//! System prompt constants for each domain agent.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever preamble content changes
//! so audit records can be traced back to the prompt that produced them.

use coordination::reasoner::opinion_schema;
use coordination::{AgentId, AgentResponse, ReasonerRequest};

/// Prompt version. Bump on any preamble content change.
pub const PROMPT_VERSION: &str = "1.2.0";

/// Shared by every safety agent.
const SAFETY_DUTIES: &str = "\
You are a SAFETY agent. Your binding_constraints are authoritative: the recovery \
must respect them and no business consideration can override them. State each \
constraint as one short imperative sentence with concrete numbers, for example \
\"Crew requires 10 hours rest before duty\", \"Departure must not be later than 2 \
hours\" or \"Aircraft must not be dispatched before the hydraulic inspection\". \
Only state constraints the provided data supports. If the data you need is \
missing, say so in your reasoning and do not guess.";

/// Shared by every business agent.
const BUSINESS_DUTIES: &str = "\
You are a BUSINESS agent. You propose; safety agents decide. Never emit \
binding_constraints. Give a concrete recommendation (delay by N hours, swap \
aircraft, cancel, reroute, or operate as scheduled with measures) and list the \
concrete actions it takes in impact.actions. Score your proposal in impact on a \
0-100 scale where higher is better, and set impact.estimated_delay_hours.";

pub const CREW_COMPLIANCE_PREAMBLE: &str = "\
You are the Crew Compliance agent for airline operations control. You check \
flight duty period limits, minimum rest, and crew qualification for the \
disrupted flight using the crew roster provided.";

pub const MAINTENANCE_PREAMBLE: &str = "\
You are the Maintenance agent for airline operations control. You assess \
airworthiness: open defects, MEL deferrals, required inspections, and how long \
the aircraft will be unavailable, using the aircraft record and maintenance log \
provided.";

pub const REGULATORY_PREAMBLE: &str = "\
You are the Regulatory agent for airline operations control. You check airport \
curfews, slot validity, NOTAMs and passenger-rights obligations that bound when \
and whether the flight can operate.";

pub const NETWORK_PREAMBLE: &str = "\
You are the Network agent for airline operations control. You protect the \
aircraft rotation and downstream connections. Prefer options that keep the \
rest of the day's schedule intact.";

pub const GUEST_EXPERIENCE_PREAMBLE: &str = "\
You are the Guest Experience agent for airline operations control. You minimise \
passenger harm: missed connections, overnight stays, care obligations and \
re-accommodation.";

pub const CARGO_PREAMBLE: &str = "\
You are the Cargo agent for airline operations control. You protect time- and \
temperature-sensitive shipments, live animals and dangerous goods on the \
manifest.";

pub const FINANCE_PREAMBLE: &str = "\
You are the Finance agent for airline operations control. You estimate the cost \
of each recovery option: compensation, crew, hotel, fuel and lost revenue.";

/// Role preamble for `agent`
pub fn preamble(agent: AgentId) -> &'static str {
    match agent {
        AgentId::CrewCompliance => CREW_COMPLIANCE_PREAMBLE,
        AgentId::Maintenance => MAINTENANCE_PREAMBLE,
        AgentId::Regulatory => REGULATORY_PREAMBLE,
        AgentId::Network => NETWORK_PREAMBLE,
        AgentId::GuestExperience => GUEST_EXPERIENCE_PREAMBLE,
        AgentId::Cargo => CARGO_PREAMBLE,
        AgentId::Finance => FINANCE_PREAMBLE,
    }
}

/// Full system prompt: role, duties and output contract.
pub fn system_prompt(agent: AgentId) -> String {
    let duties = if agent.is_safety() {
        SAFETY_DUTIES
    } else {
        BUSINESS_DUTIES
    };
    let schema = serde_json::to_string_pretty(&opinion_schema()).unwrap_or_default();
    format!(
        "{}\n\n{}\n\n## Output\nRespond with a single JSON object matching this schema and nothing else:\n```json\n{}\n```",
        preamble(agent),
        duties,
        schema
    )
}

/// User message for one invocation: scenario, retrieved data, and on
/// revision the initial-phase positions of every agent.
pub fn user_prompt(request: &ReasonerRequest) -> String {
    let scenario = &request.scenario;
    let mut prompt = String::from("## Disruption\n");
    prompt.push_str(&format!("{}\n", scenario.description));
    if let Some(flight) = &scenario.flight_number {
        prompt.push_str(&format!("- Flight: {flight}\n"));
    }
    if let Some(tail) = &scenario.aircraft_registration {
        prompt.push_str(&format!("- Aircraft: {tail}\n"));
    }
    if let Some(airport) = &scenario.airport {
        prompt.push_str(&format!("- Station: {airport}\n"));
    }
    if let Some(departure) = &scenario.scheduled_departure {
        prompt.push_str(&format!(
            "- Scheduled departure: {}\n",
            departure.format("%Y-%m-%d %H:%M UTC")
        ));
    }
    if let Some(hours) = scenario.delay_hours {
        prompt.push_str(&format!("- Reported delay: {hours:.1} hours\n"));
    }

    prompt.push_str("\n## Operational data\n```json\n");
    prompt.push_str(&serde_json::to_string_pretty(&request.context).unwrap_or_default());
    prompt.push_str("\n```\n");

    if request.is_revision() {
        prompt.push_str("\n## Initial assessments\n");
        if let Some(own) = &request.own_prior {
            prompt.push_str(&format!("Your initial position: {}\n", summarize(own)));
        }
        for peer in &request.peers {
            prompt.push_str(&format!("- {}\n", summarize(peer)));
        }
        prompt.push_str(
            "\nRevise your assessment in light of the other agents. Keep every \
             constraint the data still supports; change your recommendation only \
             if another agent's findings warrant it.\n",
        );
    }

    prompt
}

fn summarize(response: &AgentResponse) -> String {
    if !response.is_success() {
        return format!("{} ({}): no assessment", response.agent, response.status);
    }
    let mut line = format!(
        "{} (confidence {:.2}): {}",
        response.agent, response.confidence, response.recommendation
    );
    if !response.binding_constraints.is_empty() {
        line.push_str(&format!(" | constraints: {}", response.binding_constraints.join("; ")));
    }
    line
}
