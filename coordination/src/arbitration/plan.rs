//! Recovery plans
//!
//! Every candidate that survives the hard gate gets an ordered step list. The
//! steps form a DAG (dependencies always point at earlier steps); petgraph
//! validates the order and the critical path is the longest-duration chain.

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::candidates::Candidate;
use crate::conflict::CourseOfAction;
use crate::state::types::AgentId;

const OPERATIONS_CONTROL: &str = "Operations Control";
const NETWORK_CONTROL: &str = "Network Operations Control";
const CUSTOMER_SERVICE: &str = "Customer Service";

const CONFIRM_MINUTES: u32 = 15;
const COMPLIANCE_MINUTES: u32 = 30;
const CANCEL_MINUTES: u32 = 15;
const ACTION_MINUTES: u32 = 30;
const NOTIFY_MINUTES: u32 = 20;
const VERIFY_MINUTES: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryStep {
    /// 1-based
    pub step_number: u32,
    pub name: String,
    pub description: String,
    pub responsible_party: String,
    pub dependencies: Vec<u32>,
    pub estimated_duration_minutes: u32,
    pub success_criterion: String,
    pub rollback: String,
}

/// Alternate solution to fall back to when a trigger fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contingency {
    pub trigger: String,
    pub alternate_solution_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub steps: Vec<RecoveryStep>,
    /// Step numbers along the longest-duration dependency chain
    pub critical_path: Vec<u32>,
    pub total_duration_minutes: u32,
    pub contingencies: Vec<Contingency>,
}

impl RecoveryPlan {
    pub fn step(&self, number: u32) -> Option<&RecoveryStep> {
        self.steps.iter().find(|s| s.step_number == number)
    }
}

struct PlanBuilder {
    steps: Vec<RecoveryStep>,
}

impl PlanBuilder {
    #[allow(clippy::too_many_arguments)]
    fn push(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        party: impl Into<String>,
        dependencies: Vec<u32>,
        minutes: u32,
        success_criterion: impl Into<String>,
        rollback: impl Into<String>,
    ) -> u32 {
        let step_number = self.steps.len() as u32 + 1;
        self.steps.push(RecoveryStep {
            step_number,
            name: name.into(),
            description: description.into(),
            responsible_party: party.into(),
            dependencies,
            estimated_duration_minutes: minutes,
            success_criterion: success_criterion.into(),
            rollback: rollback.into(),
        });
        step_number
    }
}

/// Build the plan for `candidate`; contingencies are attached by the engine.
pub fn build_plan(candidate: &Candidate) -> RecoveryPlan {
    let mut plan = PlanBuilder { steps: Vec::new() };

    let confirm = plan.push(
        "Confirm binding constraints",
        format!(
            "Confirm '{}' against {} compliance requirement(s) before execution",
            candidate.title,
            candidate.compliance_steps.len()
        ),
        OPERATIONS_CONTROL,
        Vec::new(),
        CONFIRM_MINUTES,
        "Every active constraint acknowledged by its owner",
        "Nothing executed yet; stop and escalate to the duty manager",
    );

    let mut gates = vec![confirm];
    for requirement in &candidate.compliance_steps {
        let step = plan.push(
            format!("Complete requirement from {}", requirement.source),
            requirement.text.clone(),
            requirement.source.responsible_party(),
            vec![confirm],
            COMPLIANCE_MINUTES,
            format!("{} confirms the requirement is met", requirement.source),
            "Hold the operation until the requirement is met",
        );
        gates.push(step);
    }

    let mut terminal = Vec::new();
    match (candidate.course, candidate.delay_hours) {
        (CourseOfAction::Cancel, _) => {
            terminal.push(plan.push(
                "Cancel flight",
                "Cancel the operation and release crew and aircraft",
                NETWORK_CONTROL,
                gates.clone(),
                CANCEL_MINUTES,
                "Flight cancelled in the schedule and reservation systems",
                "Reinstate the flight if the disruption clears",
            ));
        }
        (_, Some(hours)) if hours > 0.0 => {
            let minutes = (hours * 60.0).round().max(1.0) as u32;
            terminal.push(plan.push(
                "Retime departure",
                format!("Delay departure by {hours:.1} hours"),
                NETWORK_CONTROL,
                gates.clone(),
                minutes,
                "New departure time published and crew re-rostered",
                "Restore the original schedule",
            ));
        }
        _ => {}
    }

    let mut last_by_party: Vec<(Option<AgentId>, u32)> = Vec::new();
    for action in candidate.actions.iter().filter(|a| !a.timeline) {
        let mut dependencies = gates.clone();
        if let Some((_, previous)) = last_by_party.iter().find(|(agent, _)| *agent == action.agent) {
            dependencies.push(*previous);
        }
        let party = action
            .agent
            .map(|a| a.responsible_party())
            .unwrap_or(OPERATIONS_CONTROL);
        let step = plan.push(
            truncate_name(&action.text),
            action.text.clone(),
            party,
            dependencies,
            ACTION_MINUTES,
            format!("{party} reports the action complete"),
            format!("{party} reverts the action and reports back to operations control"),
        );
        match last_by_party.iter_mut().find(|(agent, _)| *agent == action.agent) {
            Some(entry) => entry.1 = step,
            None => last_by_party.push((action.agent, step)),
        }
        terminal.push(step);
    }

    let notify_deps = if terminal.is_empty() { gates } else { terminal };
    let notify = plan.push(
        "Notify passengers and stakeholders",
        "Publish the recovery decision to passengers, crew, airport and partners",
        CUSTOMER_SERVICE,
        notify_deps,
        NOTIFY_MINUTES,
        "All affected parties notified",
        "Issue a correction notice to every notified party",
    );
    plan.push(
        "Verify recovery complete",
        "Confirm every step finished and the operation is stable",
        OPERATIONS_CONTROL,
        vec![notify],
        VERIFY_MINUTES,
        "Operation restored with no open constraint",
        "Activate the contingency solution",
    );

    finish(plan.steps)
}

fn truncate_name(text: &str) -> String {
    const MAX: usize = 60;
    if text.chars().count() <= MAX {
        return text.to_string();
    }
    let mut name: String = text.chars().take(MAX - 3).collect();
    name.push_str("...");
    name
}

fn finish(steps: Vec<RecoveryStep>) -> RecoveryPlan {
    let (critical_path, total) = critical_path(&steps);
    RecoveryPlan {
        steps,
        critical_path,
        total_duration_minutes: total,
        contingencies: Vec::new(),
    }
}

/// Longest-duration chain through the step DAG.
///
/// Ties prefer the smaller step number, both for predecessors and for the
/// chain's final step. A cycle falls back to declared order.
pub fn critical_path(steps: &[RecoveryStep]) -> (Vec<u32>, u32) {
    if steps.is_empty() {
        return (Vec::new(), 0);
    }

    let mut graph: DiGraph<u32, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = steps.iter().map(|s| graph.add_node(s.step_number)).collect();
    let position = |number: u32| steps.iter().position(|s| s.step_number == number);
    for (i, step) in steps.iter().enumerate() {
        for dep in &step.dependencies {
            if let Some(j) = position(*dep) {
                graph.add_edge(nodes[j], nodes[i], ());
            }
        }
    }

    let order: Vec<usize> = match toposort(&graph, None) {
        Ok(sorted) => sorted.into_iter().map(|n| n.index()).collect(),
        Err(cycle) => {
            warn!(step = graph[cycle.node_id()], "Recovery plan has a dependency cycle");
            (0..steps.len()).collect()
        }
    };

    let mut finish = vec![0u32; steps.len()];
    let mut predecessor: Vec<Option<usize>> = vec![None; steps.len()];
    for i in order {
        let mut best: Option<usize> = None;
        for dep in &steps[i].dependencies {
            let Some(j) = position(*dep) else { continue };
            best = match best {
                Some(b)
                    if finish[b] > finish[j]
                        || (finish[b] == finish[j] && steps[b].step_number < steps[j].step_number) =>
                {
                    Some(b)
                }
                _ => Some(j),
            };
        }
        finish[i] = steps[i]
            .estimated_duration_minutes
            .saturating_add(best.map(|b| finish[b]).unwrap_or(0));
        predecessor[i] = best;
    }

    let mut end = 0;
    for i in 1..steps.len() {
        if finish[i] > finish[end] {
            end = i;
        }
    }

    let total = finish[end];
    let mut path = vec![steps[end].step_number];
    let mut cursor = predecessor[end];
    while let Some(i) = cursor {
        if path.contains(&steps[i].step_number) {
            break;
        }
        path.push(steps[i].step_number);
        cursor = predecessor[i];
    }
    path.reverse();
    (path, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::candidates::CandidateAction;
    use crate::conflict::BindingConstraint;

    fn candidate(course: CourseOfAction, delay: Option<f64>) -> Candidate {
        Candidate {
            index: 1,
            title: "Delay 3.0h (network)".into(),
            description: "Delay".into(),
            course,
            members: vec![AgentId::Network],
            actions: vec![
                CandidateAction {
                    agent: None,
                    text: "Delay departure by 3.0 hours".into(),
                    timeline: true,
                },
                CandidateAction {
                    agent: Some(AgentId::Network),
                    text: "Protect onward connections".into(),
                    timeline: false,
                },
                CandidateAction {
                    agent: Some(AgentId::Network),
                    text: "Re-slot the inbound rotation".into(),
                    timeline: false,
                },
            ],
            delay_hours: delay,
            overridden: Vec::new(),
            notes: Vec::new(),
            compliance_steps: vec![BindingConstraint::parse(
                AgentId::Maintenance,
                "Hydraulic inspection sign-off required",
            )],
            conservative: false,
        }
    }

    #[test]
    fn test_delay_plan_structure() {
        let plan = build_plan(&candidate(CourseOfAction::Delay, Some(3.0)));

        let names: Vec<&str> = plan.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names[0], "Confirm binding constraints");
        assert_eq!(names[1], "Complete requirement from maintenance");
        assert_eq!(names[2], "Retime departure");
        assert_eq!(plan.steps.len(), 7);

        let retime = plan.step(3).unwrap();
        assert_eq!(retime.dependencies, vec![1, 2]);
        assert_eq!(retime.estimated_duration_minutes, 180);

        // second network action waits for the first
        assert_eq!(plan.step(5).unwrap().dependencies, vec![1, 2, 4]);
        assert_eq!(plan.steps.last().unwrap().rollback, "Activate the contingency solution");
        assert!(plan.steps.iter().all(|s| !s.rollback.is_empty()));

        for step in &plan.steps {
            assert!(step.dependencies.iter().all(|d| *d < step.step_number));
        }
    }

    #[test]
    fn test_critical_path_follows_longest_chain() {
        let plan = build_plan(&candidate(CourseOfAction::Delay, Some(3.0)));
        // confirm -> requirement -> retime -> notify -> verify
        assert_eq!(plan.critical_path, vec![1, 2, 3, 6, 7]);
        assert_eq!(plan.total_duration_minutes, 15 + 30 + 180 + 20 + 10);
    }

    #[test]
    fn test_huge_delay_saturates_total() {
        let plan = build_plan(&candidate(CourseOfAction::Delay, Some(1e9)));
        let retime = plan.step(3).unwrap();
        assert_eq!(retime.estimated_duration_minutes, u32::MAX);
        assert_eq!(plan.total_duration_minutes, u32::MAX);
        assert!(plan.critical_path.contains(&3));
    }

    #[test]
    fn test_cancel_plan_has_cancel_step() {
        let mut cancel = candidate(CourseOfAction::Cancel, None);
        cancel.actions.retain(|a| !a.timeline);
        let plan = build_plan(&cancel);
        assert!(plan.steps.iter().any(|s| s.name == "Cancel flight"));
        assert!(!plan.steps.iter().any(|s| s.name == "Retime departure"));
    }

    #[test]
    fn test_critical_path_tie_prefers_lower_step() {
        let step = |n: u32, deps: Vec<u32>, minutes: u32| RecoveryStep {
            step_number: n,
            name: format!("step {n}"),
            description: String::new(),
            responsible_party: OPERATIONS_CONTROL.into(),
            dependencies: deps,
            estimated_duration_minutes: minutes,
            success_criterion: String::new(),
            rollback: "none".into(),
        };
        let steps = vec![
            step(1, vec![], 10),
            step(2, vec![1], 30),
            step(3, vec![1], 30),
            step(4, vec![2, 3], 5),
        ];
        assert_eq!(critical_path(&steps), (vec![1, 2, 4], 45));
    }

    #[test]
    fn test_cycle_falls_back_to_declared_order() {
        let steps = vec![
            RecoveryStep {
                step_number: 1,
                name: "a".into(),
                description: String::new(),
                responsible_party: OPERATIONS_CONTROL.into(),
                dependencies: vec![2],
                estimated_duration_minutes: 5,
                success_criterion: String::new(),
                rollback: "none".into(),
            },
            RecoveryStep {
                step_number: 2,
                name: "b".into(),
                description: String::new(),
                responsible_party: OPERATIONS_CONTROL.into(),
                dependencies: vec![1],
                estimated_duration_minutes: 5,
                success_criterion: String::new(),
                rollback: "none".into(),
            },
        ];
        let (path, _) = critical_path(&steps);
        assert!(!path.is_empty());
    }
}
