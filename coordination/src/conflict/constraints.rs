//! Binding constraint parsing
//!
//! Safety agents state constraints as free text ("crew must rest 10 hours",
//! "aircraft must not be dispatched before inspection"). Each is classified
//! once into a [`ConstraintKind`] so detection and the arbitration hard gate
//! can test proposals against it mechanically.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::state::types::{AgentId, AgentResponse, Collation, ImpactAssessment};

/// Tolerance for comparing delays in hours
pub const DELAY_EPSILON: f64 = 1e-6;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<h>\d+(?:\.\d+)?)\s*(?:hours?|hrs?|h)\b(?:\s*(?:and\s*)?(?P<m>\d+)\s*(?:minutes?|mins?|m)\b)?|(?P<mo>\d+(?:\.\d+)?)\s*(?:minutes?|mins?)\b",
    )
    .expect("DURATION_RE regex should compile")
});

static UPPER_BOUND_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:(?:within|no later than|no more than|at most|not exceed|not to exceed|maximum(?: of)?|max(?:imum)? delay(?: of)?|up to)\b|before\s+\d)")
        .expect("UPPER_BOUND_RE regex should compile")
});

static PROHIBITION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:must not|shall not|may not|cannot|can not|do not|does not|is not permitted to|are not permitted to|not be allowed to|prohibited from|no)\s+(?P<action>.+)$")
        .expect("PROHIBITION_RE regex should compile")
});

pub(crate) const NEGATIONS: &[&str] = &["not", "no", "never", "without", "don't", "cannot", "avoid"];

/// Words before a bound phrase searched for a negation
const NEGATION_WINDOW: usize = 4;

const CLAUSE_BREAKS: &[&str] = &[
    "until", "unless", "before", "after", "prior", "while", "due", "because", "if", "when", "pending",
];

const FILLER_WORDS: &[&str] = &[
    "be", "the", "a", "an", "to", "any", "this", "that", "its", "their", "flight", "is", "are",
];

/// How a constraint restricts a candidate recovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConstraintKind {
    /// Departure may not happen sooner than `hours` from now
    MinimumDelay { hours: f64 },
    /// Departure must happen within `hours`
    MaximumDelay { hours: f64 },
    /// The described action may not appear in the plan
    Prohibition { action: String },
    /// A step that must appear in the plan
    Requirement,
}

/// A safety constraint, immutable once extracted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConstraint {
    pub source: AgentId,
    pub text: String,
    pub kind: ConstraintKind,
}

impl BindingConstraint {
    pub fn parse(source: AgentId, text: &str) -> Self {
        let text = text.trim().to_string();
        let kind = classify(&text);
        Self { source, text, kind }
    }

    /// Required delay floor, if this is a minimum-delay constraint
    pub fn min_delay(&self) -> Option<f64> {
        match self.kind {
            ConstraintKind::MinimumDelay { hours } => Some(hours),
            _ => None,
        }
    }

    pub fn max_delay(&self) -> Option<f64> {
        match self.kind {
            ConstraintKind::MaximumDelay { hours } => Some(hours),
            _ => None,
        }
    }

    pub fn is_prohibition(&self) -> bool {
        matches!(self.kind, ConstraintKind::Prohibition { .. })
    }

    /// Whether a proposal with this delay and action text breaks the constraint.
    ///
    /// A `None` delay means the proposal sets no departure (e.g. cancellation)
    /// and cannot breach a delay bound. Requirements are satisfied by plan
    /// construction and never foreclose a proposal.
    pub fn forecloses(&self, delay_hours: Option<f64>, actions: &[&str]) -> bool {
        match &self.kind {
            ConstraintKind::MinimumDelay { hours } => {
                delay_hours.is_some_and(|d| d + DELAY_EPSILON < *hours)
            }
            ConstraintKind::MaximumDelay { hours } => {
                delay_hours.is_some_and(|d| d > *hours + DELAY_EPSILON)
            }
            ConstraintKind::Prohibition { action } => {
                actions.iter().any(|text| performs_action(text, action))
            }
            ConstraintKind::Requirement => false,
        }
    }
}

impl std::fmt::Display for BindingConstraint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.source, self.text)
    }
}

fn classify(text: &str) -> ConstraintKind {
    let duration = parse_duration_hours(text);

    if let Some(hours) = duration {
        return match UPPER_BOUND_RE.find(text) {
            // "must not depart within 10 hours" forbids the interval, it is a floor
            Some(bound) if negated_before(&text[..bound.start()]) => {
                ConstraintKind::MinimumDelay { hours }
            }
            Some(_) => ConstraintKind::MaximumDelay { hours },
            None => ConstraintKind::MinimumDelay { hours },
        };
    }

    if let Some(caps) = PROHIBITION_RE.captures(text) {
        let action = significant_words(&caps["action"]).join(" ");
        if !action.is_empty() {
            return ConstraintKind::Prohibition { action };
        }
    }

    ConstraintKind::Requirement
}

/// Whether one of the last few words of `prefix` is a negation.
fn negated_before(prefix: &str) -> bool {
    let words = words(prefix);
    words[words.len().saturating_sub(NEGATION_WINDOW)..]
        .iter()
        .any(|w| NEGATIONS.contains(&w.as_str()))
}

/// First duration mentioned in `text`, in hours.
pub fn parse_duration_hours(text: &str) -> Option<f64> {
    let caps = DURATION_RE.captures(text)?;
    if let Some(h) = caps.name("h") {
        let hours: f64 = h.as_str().parse().ok()?;
        let minutes: f64 = caps
            .name("m")
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(0.0);
        return Some(hours + minutes / 60.0);
    }
    let minutes: f64 = caps.name("mo")?.as_str().parse().ok()?;
    Some(minutes / 60.0)
}

pub(crate) fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

fn significant_words(text: &str) -> Vec<String> {
    words(text)
        .into_iter()
        .take_while(|w| !CLAUSE_BREAKS.contains(&w.as_str()))
        .filter(|w| !FILLER_WORDS.contains(&w.as_str()))
        .take(2)
        .collect()
}

/// Crude stem so "ferried", "ferrying" and "ferry" compare equal
fn stem(word: &str) -> String {
    if let Some(root) = word.strip_suffix("ied") {
        return format!("{root}y");
    }
    for suffix in ["ing", "ed", "es", "s"] {
        if let Some(stripped) = word.strip_suffix(suffix) {
            if stripped.len() >= 3 {
                return stripped.to_string();
            }
        }
    }
    word.to_string()
}

/// Whether `text` proposes doing the prohibited `action`.
///
/// The action's words must appear in order within a short window, and the
/// match is ignored when a negation shortly precedes it ("do not dispatch").
pub fn performs_action(text: &str, action: &str) -> bool {
    let haystack = words(text);
    let needle: Vec<String> = words(action).iter().map(|w| stem(w)).collect();
    let Some(first) = needle.first() else {
        return false;
    };

    for (i, word) in haystack.iter().enumerate() {
        if stem(word) != *first {
            continue;
        }
        let window_end = (i + 1 + needle.len() * 3).min(haystack.len());
        let mut cursor = i + 1;
        let mut matched = true;
        for want in &needle[1..] {
            match haystack[cursor..window_end].iter().position(|w| stem(w) == *want) {
                Some(offset) => cursor += offset + 1,
                None => {
                    matched = false;
                    break;
                }
            }
        }
        if !matched {
            continue;
        }
        let negated = haystack[i.saturating_sub(3)..i]
            .iter()
            .any(|w| NEGATIONS.contains(&w.as_str()));
        if !negated {
            return true;
        }
    }
    false
}

/// Delay a response proposes, in hours.
///
/// Taken from the impact assessment when supplied, otherwise from the first
/// duration in the recommendation text.
pub fn proposed_delay(response: &AgentResponse) -> Option<f64> {
    response
        .impact
        .as_ref()
        .and_then(|i: &ImpactAssessment| i.estimated_delay_hours)
        .or_else(|| parse_duration_hours(&response.recommendation))
}

/// Constraints of every successful safety response, in roster order.
///
/// Duplicate (source, text) pairs are kept once.
pub fn extract_constraints(collation: &Collation) -> Vec<BindingConstraint> {
    let mut constraints: Vec<BindingConstraint> = Vec::new();
    for response in collation.successful().filter(|r| r.agent.is_safety()) {
        for text in &response.binding_constraints {
            let constraint = BindingConstraint::parse(response.agent, text);
            if constraint.text.is_empty() {
                continue;
            }
            if !constraints
                .iter()
                .any(|c| c.source == constraint.source && c.text == constraint.text)
            {
                constraints.push(constraint);
            }
        }
    }
    constraints
}
