//! Candidate generation
//!
//! Business proposals are grouped into mutually compatible sets; each set
//! becomes one candidate. A maximally conservative fallback built from the
//! safety agents' positions takes a remaining slot. Resolved delay bounds are
//! then applied to every candidate so the hard gate only has to reject what
//! cannot be adjusted.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::conflict::{
    parse_duration_hours, BindingConstraint, Conflict, ConflictType, ConstraintKind, CourseOfAction,
    ProposedCourse, ResolvedConstraints,
};
use crate::conflict::constraints::DELAY_EPSILON;
use crate::state::types::{AgentId, AgentResponse, Collation, DisruptionScenario};

const HOLD_ACTION: &str = "Hold departure until every binding constraint is cleared";

/// One concrete action of a candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAction {
    /// Agent the action came from; `None` for engine-added timeline steps
    pub agent: Option<AgentId>,
    pub text: String,
    /// Departure retime or cancellation step added by the engine
    #[serde(default)]
    pub timeline: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// 1-based insertion index
    pub index: usize,
    pub title: String,
    pub description: String,
    pub course: CourseOfAction,
    pub members: Vec<AgentId>,
    pub actions: Vec<CandidateAction>,
    /// `None` when the flight does not operate
    pub delay_hours: Option<f64>,
    /// Members whose proposals were adjusted or overridden
    pub overridden: Vec<AgentId>,
    pub notes: Vec<String>,
    /// Requirement constraints the plan must carry out
    pub compliance_steps: Vec<BindingConstraint>,
    pub conservative: bool,
}

impl Candidate {
    pub fn action_texts(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.text.as_str()).collect()
    }

    /// Active constraints this candidate breaks
    pub fn violations<'a>(&self, constraints: &'a [BindingConstraint]) -> Vec<&'a BindingConstraint> {
        let texts = self.action_texts();
        constraints
            .iter()
            .filter(|c| match c.kind {
                ConstraintKind::Requirement => !self.compliance_steps.contains(c),
                _ => c.forecloses(self.delay_hours, &texts),
            })
            .collect()
    }
}

/// Candidates plus notes about proposals that could not seed one
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateSet {
    pub candidates: Vec<Candidate>,
    pub notes: Vec<String>,
}

/// Build at most `max` candidates from the revision collation.
pub fn generate_candidates(
    scenario: &DisruptionScenario,
    collation: &Collation,
    conflicts: &[Conflict],
    resolved: &ResolvedConstraints,
    max: usize,
) -> CandidateSet {
    let mut set = CandidateSet::default();

    let mut seeds: Vec<&AgentResponse> = Vec::new();
    for response in collation.successful().filter(|r| !r.agent.is_safety()) {
        if resolved.excluded_proposals.contains(&response.agent) {
            set.notes.push(format!(
                "{} proposal excluded: it performs an action a safety constraint prohibits",
                response.agent
            ));
        } else {
            seeds.push(response);
        }
    }

    let exclusive: BTreeSet<(AgentId, AgentId)> = conflicts
        .iter()
        .filter(|c| c.conflict_type == ConflictType::BusinessVsBusiness)
        .filter_map(|c| match c.agents.as_slice() {
            [a, b, ..] => Some(((*a).min(*b), (*a).max(*b))),
            _ => None,
        })
        .collect();

    let mut groups = compatible_groups(&seeds, &exclusive);
    if groups.len() > max {
        set.notes.push(format!(
            "{} compatible proposal groups found; keeping the first {}",
            groups.len(),
            max
        ));
        groups.truncate(max);
    }

    for group in &groups {
        let members: Vec<&AgentResponse> = seeds
            .iter()
            .copied()
            .filter(|r| group.contains(&r.agent))
            .collect();
        let index = set.candidates.len() + 1;
        set.candidates.push(from_group(index, scenario, &members, resolved));
    }

    if set.candidates.len() < max {
        let index = set.candidates.len() + 1;
        set.candidates.push(conservative_fallback(index, scenario, collation, resolved));
    }

    for candidate in &mut set.candidates {
        apply_delay_bounds(candidate, collation, resolved);
        finalize(candidate, resolved);
    }
    set
}

/// Greedy grouping: a seed starts a new group when no existing group accepts
/// it, and is then added to every group it is compatible with.
fn compatible_groups(seeds: &[&AgentResponse], exclusive: &BTreeSet<(AgentId, AgentId)>) -> Vec<Vec<AgentId>> {
    let compatible = |a: AgentId, group: &[AgentId]| {
        group
            .iter()
            .all(|b| !exclusive.contains(&(a.min(*b), a.max(*b))))
    };

    let mut groups: Vec<Vec<AgentId>> = Vec::new();
    for seed in seeds {
        if !groups.iter().any(|g| compatible(seed.agent, g)) {
            groups.push(vec![seed.agent]);
        }
    }
    for seed in seeds {
        for group in groups.iter_mut() {
            if !group.contains(&seed.agent) && compatible(seed.agent, group) {
                group.push(seed.agent);
            }
        }
    }
    for group in groups.iter_mut() {
        group.sort();
    }
    groups
}

fn from_group(
    index: usize,
    scenario: &DisruptionScenario,
    members: &[&AgentResponse],
    resolved: &ResolvedConstraints,
) -> Candidate {
    let courses: Vec<ProposedCourse> = members.iter().map(|r| ProposedCourse::of(r)).collect();
    let anchor = courses
        .iter()
        .position(|c| c.class != CourseOfAction::Supporting)
        .unwrap_or(0);
    let course = courses
        .get(anchor)
        .map(|c| c.class)
        .unwrap_or(CourseOfAction::Supporting);

    let delay_hours = match course {
        CourseOfAction::Cancel => None,
        _ => courses
            .iter()
            .filter_map(|c| c.delay_hours)
            .reduce(f64::max)
            .or(scenario.delay_hours),
    };

    let mut actions = Vec::new();
    for response in members {
        push_action(&mut actions, Some(response.agent), &response.recommendation);
        if let Some(impact) = &response.impact {
            for action in &impact.actions {
                push_action(&mut actions, Some(response.agent), action);
            }
        }
    }

    let member_ids: Vec<AgentId> = members.iter().map(|r| r.agent).collect();
    let overridden = member_ids
        .iter()
        .copied()
        .filter(|a| resolved.overridden_agents.contains(a))
        .collect();
    let description = members
        .get(anchor)
        .map(|r| r.recommendation.clone())
        .unwrap_or_default();

    Candidate {
        index,
        title: String::new(),
        description,
        course,
        members: member_ids,
        actions,
        delay_hours,
        overridden,
        notes: Vec::new(),
        compliance_steps: Vec::new(),
        conservative: false,
    }
}

/// The longest delay any agent asked for, bounded by the resolved constraints,
/// executing only what the safety agents recommend.
fn conservative_fallback(
    index: usize,
    scenario: &DisruptionScenario,
    collation: &Collation,
    resolved: &ResolvedConstraints,
) -> Candidate {
    let floor = resolved.delay_floor();
    let longest_proposal = collation
        .successful()
        .filter_map(|r| ProposedCourse::of(r).delay_hours)
        .fold(0.0, f64::max);
    let mut delay = floor
        .max(longest_proposal)
        .max(scenario.delay_hours.unwrap_or(0.0));
    if let Some(cap) = resolved.delay_cap() {
        if cap + DELAY_EPSILON >= floor {
            delay = delay.min(cap);
        }
    }

    let safety: Vec<&AgentResponse> = collation
        .successful()
        .filter(|r| r.agent.is_safety())
        .collect();
    let mut actions = Vec::new();
    for response in &safety {
        if !resolved.excluded_proposals.contains(&response.agent) {
            push_action(&mut actions, Some(response.agent), &response.recommendation);
        }
    }
    push_action(&mut actions, None, HOLD_ACTION);

    Candidate {
        index,
        title: String::new(),
        description: "Maximally conservative recovery that satisfies every binding constraint with the widest margin".into(),
        course: CourseOfAction::Delay,
        members: safety.iter().map(|r| r.agent).collect(),
        actions,
        delay_hours: Some(delay),
        overridden: Vec::new(),
        notes: Vec::new(),
        compliance_steps: Vec::new(),
        conservative: true,
    }
}

/// Single fallback used when every candidate failed the hard gate
pub fn over_constrained_fallback(
    index: usize,
    collation: &Collation,
    resolved: &ResolvedConstraints,
) -> Candidate {
    let mut candidate = Candidate {
        index,
        title: "Manual safety review".into(),
        description: "No candidate satisfies every binding constraint; hold the operation for manual review".into(),
        course: CourseOfAction::Delay,
        members: collation
            .successful()
            .filter(|r| r.agent.is_safety())
            .map(|r| r.agent)
            .collect(),
        actions: Vec::new(),
        delay_hours: Some(resolved.delay_floor()),
        overridden: Vec::new(),
        notes: vec!["Constraints are mutually unsatisfiable; this fallback is degraded".into()],
        compliance_steps: Vec::new(),
        conservative: true,
    };
    push_action(&mut candidate.actions, None, "Hold operation pending manual safety review");
    push_action(&mut candidate.actions, None, "Escalate to the duty operations manager");
    finalize(&mut candidate, resolved);
    candidate.title = "Manual safety review".into();
    candidate
}

fn push_action(actions: &mut Vec<CandidateAction>, agent: Option<AgentId>, text: &str) {
    let text = text.trim();
    if text.is_empty() || actions.iter().any(|a| a.text == text) {
        return;
    }
    actions.push(CandidateAction {
        agent,
        text: text.to_string(),
        timeline: false,
    });
}

fn apply_delay_bounds(candidate: &mut Candidate, collation: &Collation, resolved: &ResolvedConstraints) {
    if candidate.course == CourseOfAction::Cancel {
        return;
    }
    let floor = resolved.delay_floor();
    let binding: Vec<&str> = resolved
        .active
        .iter()
        .filter(|c| c.min_delay().is_some_and(|h| h + DELAY_EPSILON >= floor))
        .map(|c| c.text.as_str())
        .collect();

    let current = candidate.delay_hours.unwrap_or(0.0);
    if current + DELAY_EPSILON < floor {
        candidate.notes.push(format!(
            "Timeline extended from {current:.1}h to {floor:.1}h to satisfy: {}",
            binding.join("; ")
        ));
        for member in &candidate.members {
            let proposed = collation
                .get(*member)
                .and_then(|r| ProposedCourse::of(r).delay_hours)
                .unwrap_or(0.0);
            if proposed + DELAY_EPSILON < floor && !candidate.overridden.contains(member) {
                candidate.overridden.push(*member);
            }
        }
        candidate.delay_hours = Some(floor);
        candidate
            .actions
            .retain(|a| parse_duration_hours(&a.text).map_or(true, |h| h + DELAY_EPSILON >= floor));
    } else if candidate.delay_hours.is_none() {
        candidate.delay_hours = Some(current);
    }

    if let (Some(cap), Some(delay)) = (resolved.delay_cap(), candidate.delay_hours) {
        if delay > cap + DELAY_EPSILON && cap + DELAY_EPSILON >= floor {
            candidate
                .notes
                .push(format!("Timeline shortened from {delay:.1}h to {cap:.1}h to meet the departure limit"));
            candidate.delay_hours = Some(cap);
            candidate
                .actions
                .retain(|a| parse_duration_hours(&a.text).map_or(true, |h| h <= cap + DELAY_EPSILON));
        }
    }
    candidate.overridden.sort();
}

/// Add the timeline action and compliance steps, and set the title
fn finalize(candidate: &mut Candidate, resolved: &ResolvedConstraints) {
    let timeline = match (candidate.course, candidate.delay_hours) {
        (CourseOfAction::Cancel, _) => None,
        (_, Some(hours)) if hours > DELAY_EPSILON => Some(format!("Delay departure by {hours:.1} hours")),
        _ if candidate.conservative => None,
        _ => Some("Depart at the scheduled time".to_string()),
    };
    if let Some(text) = timeline {
        candidate.actions.insert(
            0,
            CandidateAction {
                agent: None,
                text,
                timeline: true,
            },
        );
    }
    candidate.compliance_steps = resolved.requirements().cloned().collect();

    let lead = candidate
        .members
        .iter()
        .find(|m| !candidate.overridden.contains(m))
        .or(candidate.members.first())
        .map(|m| m.as_str())
        .unwrap_or("operations");
    candidate.title = match (candidate.conservative, candidate.course, candidate.delay_hours) {
        (true, _, Some(hours)) => format!("Conservative hold of {hours:.1}h"),
        (_, CourseOfAction::Cancel, _) => format!("Cancel and re-accommodate ({lead})"),
        (_, CourseOfAction::Swap, _) => format!("Aircraft swap ({lead})"),
        (_, CourseOfAction::Reroute, _) => format!("Reroute ({lead})"),
        (_, _, Some(hours)) if hours > DELAY_EPSILON => format!("Delay {hours:.1}h ({lead})"),
        _ => format!("Operate on schedule with recovery measures ({lead})"),
    };
}
