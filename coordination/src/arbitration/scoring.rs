//! Multi-criteria scoring and ranking

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::candidates::Candidate;
use crate::state::types::{AgentId, Collation, ImpactAssessment};

pub const WEIGHT_SAFETY: f64 = 0.4;
pub const WEIGHT_COST: f64 = 0.2;
pub const WEIGHT_PASSENGER: f64 = 0.2;
pub const WEIGHT_NETWORK: f64 = 0.2;

/// Axis value used when no agent supplied one
pub const NEUTRAL_SCORE: f64 = 50.0;
/// Safety points lost per member whose proposal was overridden
pub const OVERRIDE_PENALTY: f64 = 10.0;
/// Safety points gained by the conservative fallback
pub const CONSERVATIVE_BONUS: f64 = 15.0;

/// Per-axis scores, each in [0, 100]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AxisScores {
    pub safety: f64,
    pub cost: f64,
    pub passenger: f64,
    pub network: f64,
}

impl AxisScores {
    pub fn new(safety: f64, cost: f64, passenger: f64, network: f64) -> Self {
        Self {
            safety: clamp_score(safety),
            cost: clamp_score(cost),
            passenger: clamp_score(passenger),
            network: clamp_score(network),
        }
    }

    /// Weighted composite, rounded to 4 decimals so equal inputs tie exactly
    pub fn composite(&self) -> f64 {
        let raw = WEIGHT_SAFETY * self.safety
            + WEIGHT_COST * self.cost
            + WEIGHT_PASSENGER * self.passenger
            + WEIGHT_NETWORK * self.network;
        (raw * 10_000.0).round() / 10_000.0
    }
}

fn clamp_score(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        NEUTRAL_SCORE
    }
}

fn mean(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values
        .into_iter()
        .fold((0.0, 0usize), |(sum, count), v| (sum + v, count + 1));
    (count > 0).then(|| sum / count as f64)
}

fn worst(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    values.into_iter().reduce(f64::min)
}

/// Mean safety-agent confidence scaled to [0, 100]; neutral when none succeeded
pub fn safety_baseline(collation: &Collation) -> f64 {
    mean(
        collation
            .successful()
            .filter(|r| r.agent.is_safety())
            .map(|r| r.confidence * 100.0),
    )
    .unwrap_or(NEUTRAL_SCORE)
}

fn impacts<'a>(collation: &'a Collation, agents: &'a [AgentId]) -> impl Iterator<Item = &'a ImpactAssessment> {
    agents
        .iter()
        .filter_map(move |a| collation.get(*a))
        .filter(|r| r.is_success())
        .filter_map(|r| r.impact.as_ref())
}

/// Score one candidate.
///
/// Cost, passenger and network come from the members' impact assessments
/// (mean; worst case across business agents for conservative candidates).
/// Safety blends the safety-agent baseline with member-supplied safety scores,
/// minus a penalty per overridden member.
pub fn score_candidate(candidate: &Candidate, collation: &Collation) -> AxisScores {
    let baseline = safety_baseline(collation);

    if candidate.conservative {
        let business: Vec<AgentId> = collation
            .successful()
            .filter(|r| !r.agent.is_safety())
            .map(|r| r.agent)
            .collect();
        let axis = |pick: fn(&ImpactAssessment) -> Option<f64>| {
            worst(impacts(collation, &business).filter_map(pick)).unwrap_or(NEUTRAL_SCORE)
        };
        return AxisScores::new(
            baseline + CONSERVATIVE_BONUS,
            axis(|i| i.cost_score),
            axis(|i| i.passenger_score),
            axis(|i| i.network_score),
        );
    }

    let axis = |pick: fn(&ImpactAssessment) -> Option<f64>| {
        mean(impacts(collation, &candidate.members).filter_map(pick)).unwrap_or(NEUTRAL_SCORE)
    };
    let supplied_safety = mean(impacts(collation, &candidate.members).filter_map(|i| i.safety_score));
    let safety = match supplied_safety {
        Some(supplied) => (baseline + supplied) / 2.0,
        None => baseline,
    } - OVERRIDE_PENALTY * candidate.overridden.len() as f64;

    AxisScores::new(
        safety,
        axis(|i| i.cost_score),
        axis(|i| i.passenger_score),
        axis(|i| i.network_score),
    )
}

/// Ranking order: composite desc, safety desc, insertion index asc
pub fn rank_order(a: (&AxisScores, usize), b: (&AxisScores, usize)) -> Ordering {
    b.0.composite()
        .total_cmp(&a.0.composite())
        .then(b.0.safety.total_cmp(&a.0.safety))
        .then(a.1.cmp(&b.1))
}
