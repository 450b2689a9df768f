//! Orchestrator configuration
//!
//! One [`OrchestratorConfig`] is built at startup (defaults, a TOML file, then
//! environment overrides), validated, and shared read-only behind an `Arc`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::state::types::{AgentId, ScenarioField};

pub const DEFAULT_AGENT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_CHUNK_SIZE: usize = 100;
pub const DEFAULT_BACKOFF_SECS: [u64; 5] = [30, 60, 120, 240, 480];
pub const DEFAULT_MAX_SOLUTIONS: usize = 3;

/// Environment variable overriding the per-agent timeout (seconds)
pub const ENV_AGENT_TIMEOUT_SECS: &str = "RECOVERY_AGENT_TIMEOUT_SECS";
/// Environment variable overriding the batch-get chunk size
pub const ENV_CHUNK_SIZE: &str = "RECOVERY_CHUNK_SIZE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// A data table an agent reads before reasoning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSource {
    /// Name the data appears under in the assembled context
    pub name: String,
    pub table: String,
    /// Scenario field whose value is the lookup key
    pub key_field: ScenarioField,
    /// Secondary index to query instead of a primary-key batch get
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Missing data from a required source is reported by the agent
    #[serde(default)]
    pub required: bool,
}

impl ContextSource {
    pub fn new(name: impl Into<String>, table: impl Into<String>, key_field: ScenarioField) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            key_field,
            index: None,
            required: false,
        }
    }

    pub fn via_index(mut self, index: impl Into<String>) -> Self {
        self.index = Some(index.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// Per-agent settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    /// Primary model identifier handed to the reasoner
    #[serde(default = "default_model")]
    pub model: String,
    /// Tried in order when the primary model fails
    #[serde(default)]
    pub fallback_models: Vec<String>,
    #[serde(default)]
    pub context_sources: Vec<ContextSource>,
}

fn default_model() -> String {
    "default".to_string()
}

impl AgentSpec {
    pub fn new(id: AgentId) -> Self {
        Self {
            id,
            model: default_model(),
            fallback_models: Vec::new(),
            context_sources: Vec::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_fallback(mut self, model: impl Into<String>) -> Self {
        self.fallback_models.push(model.into());
        self
    }

    pub fn with_source(mut self, source: ContextSource) -> Self {
        self.context_sources.push(source);
        self
    }
}

/// Batch retrieval tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Maximum keys per backend call
    pub chunk_size: usize,
    /// Delay before each retry, in seconds
    pub backoff_schedule_secs: Vec<u64>,
    /// Retries after the first attempt
    pub max_retries: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            backoff_schedule_secs: DEFAULT_BACKOFF_SECS.to_vec(),
            max_retries: DEFAULT_BACKOFF_SECS.len(),
        }
    }
}

impl RetrievalConfig {
    /// Delay before retry number `retry` (0-based); the last entry repeats.
    pub fn backoff(&self, retry: usize) -> Duration {
        let secs = self
            .backoff_schedule_secs
            .get(retry)
            .or_else(|| self.backoff_schedule_secs.last())
            .copied()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    /// Total attempts per chunk including the first
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }
}

/// Top-level configuration of a recovery run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Agents in canonical order
    pub roster: Vec<AgentSpec>,
    pub agent_timeout_ms: u64,
    pub retrieval: RetrievalConfig,
    /// Upper bound on ranked solutions
    pub max_solutions: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut config = Self {
            roster: AgentId::all().iter().map(|id| AgentSpec::new(*id)).collect(),
            agent_timeout_ms: DEFAULT_AGENT_TIMEOUT_MS,
            retrieval: RetrievalConfig::default(),
            max_solutions: DEFAULT_MAX_SOLUTIONS,
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }
}

impl OrchestratorConfig {
    /// Parse a TOML document; unspecified fields take their defaults.
    pub fn from_toml_str(input: &str) -> ConfigResult<Self> {
        let mut config: Self = toml::from_str(input)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.roster.sort_by_key(|spec| spec.id);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    /// Apply `RECOVERY_*` overrides from `lookup`. Unparseable values are
    /// ignored with a warning.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_AGENT_TIMEOUT_SECS) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.agent_timeout_ms = secs.saturating_mul(1000),
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_AGENT_TIMEOUT_SECS),
            }
        }
        if let Some(raw) = lookup(ENV_CHUNK_SIZE) {
            match raw.trim().parse::<usize>() {
                Ok(size) => self.retrieval.chunk_size = size,
                Err(_) => tracing::warn!(value = %raw, "Ignoring invalid {}", ENV_CHUNK_SIZE),
            }
        }
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.roster.is_empty() {
            return Err(ConfigError::Invalid("roster is empty".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for spec in &self.roster {
            if !seen.insert(spec.id) {
                return Err(ConfigError::Invalid(format!(
                    "agent {} listed more than once",
                    spec.id
                )));
            }
            if spec.model.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("agent {} has no model", spec.id)));
            }
        }
        if self.retrieval.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be positive".into()));
        }
        if self.retrieval.max_retries > 0 && self.retrieval.backoff_schedule_secs.is_empty() {
            return Err(ConfigError::Invalid(
                "retries configured without a backoff schedule".into(),
            ));
        }
        if self.agent_timeout_ms == 0 {
            return Err(ConfigError::Invalid("agent timeout must be positive".into()));
        }
        if !(1..=3).contains(&self.max_solutions) {
            return Err(ConfigError::Invalid(format!(
                "max_solutions must be between 1 and 3, got {}",
                self.max_solutions
            )));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms)
    }

    /// Agent ids in roster order
    pub fn roster_ids(&self) -> Vec<AgentId> {
        self.roster.iter().map(|spec| spec.id).collect()
    }

    pub fn spec_for(&self, agent: AgentId) -> Option<&AgentSpec> {
        self.roster.iter().find(|spec| spec.id == agent)
    }
}
