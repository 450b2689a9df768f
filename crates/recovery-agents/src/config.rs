//! Reasoner endpoint and per-agent model configuration
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Per-agent environment override (`RECOVERY_MODEL_<AGENT>`, e.g.
//!    `RECOVERY_MODEL_CREW_COMPLIANCE`)
//! 2. Model named for the agent in the orchestrator TOML
//! 3. `RECOVERY_REASONER_MODEL`, then the built-in default

use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use coordination::{AgentId, OrchestratorConfig};
use serde::{Deserialize, Serialize};

/// Default OpenAI-compatible base URL
const DEFAULT_REASONER_URL: &str = "http://localhost:8000/v1";
const DEFAULT_REASONER_MODEL: &str = "recovery-reasoner";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_TOKENS: u32 = 2048;
const DEFAULT_TEMPERATURE: f32 = 0.2;

/// Model name an `AgentSpec` carries when nothing chose one
const UNSET_MODEL: &str = "default";

pub const ENV_REASONER_URL: &str = "RECOVERY_REASONER_URL";
pub const ENV_REASONER_API_KEY: &str = "RECOVERY_REASONER_API_KEY";
pub const ENV_REASONER_MODEL: &str = "RECOVERY_REASONER_MODEL";
/// Comma-separated fallback chain applied to every agent without its own
pub const ENV_FALLBACK_MODELS: &str = "RECOVERY_FALLBACK_MODELS";
const ENV_MODEL_PREFIX: &str = "RECOVERY_MODEL_";

/// OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasonerEndpoint {
    /// Base URL ending in `/v1`
    pub base_url: String,
    /// Bearer token; local servers usually need none
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for ReasonerEndpoint {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_REASONER_URL.to_string(),
            api_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
        }
    }
}

impl ReasonerEndpoint {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Agent runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsConfig {
    pub endpoint: ReasonerEndpoint,
    /// Model for agents without an override
    pub default_model: String,
    /// Tried in order when an agent's model fails
    pub fallback_models: Vec<String>,
    pub model_overrides: BTreeMap<AgentId, String>,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }
}

impl AgentsConfig {
    /// Build from `lookup`, falling back to built-in defaults for absent keys.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut endpoint = ReasonerEndpoint::default();
        if let Some(url) = lookup(ENV_REASONER_URL) {
            endpoint.base_url = url;
        }
        endpoint.api_key = lookup(ENV_REASONER_API_KEY).filter(|key| !key.trim().is_empty());

        let fallback_models = lookup(ENV_FALLBACK_MODELS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();

        let model_overrides = AgentId::all()
            .iter()
            .filter_map(|agent| {
                let key = format!("{}{}", ENV_MODEL_PREFIX, agent.as_str().to_uppercase());
                lookup(&key).map(|model| (*agent, model))
            })
            .collect();

        Self {
            endpoint,
            default_model: lookup(ENV_REASONER_MODEL)
                .unwrap_or_else(|| DEFAULT_REASONER_MODEL.to_string()),
            fallback_models,
            model_overrides,
        }
    }

    /// Model `agent` should use when the orchestrator config names none
    pub fn model_for(&self, agent: AgentId) -> &str {
        self.model_overrides
            .get(&agent)
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    /// Fill in models and fallback chains on every roster entry.
    pub fn apply_models(&self, config: &mut OrchestratorConfig) {
        for spec in &mut config.roster {
            if let Some(model) = self.model_overrides.get(&spec.id) {
                spec.model = model.clone();
            } else if spec.model == UNSET_MODEL {
                spec.model = self.default_model.clone();
            }
            if spec.fallback_models.is_empty() {
                spec.fallback_models = self
                    .fallback_models
                    .iter()
                    .filter(|m| **m != spec.model)
                    .cloned()
                    .collect();
            }
        }
    }
}

/// Check if an inference endpoint is reachable (GET /models).
pub async fn check_endpoint(endpoint: &ReasonerEndpoint) -> bool {
    let models_url = format!("{}/models", endpoint.base_url.trim_end_matches('/'));
    let mut request = reqwest::Client::new()
        .get(&models_url)
        .timeout(Duration::from_secs(5));
    if let Some(key) = &endpoint.api_key {
        request = request.bearer_auth(key);
    }
    match request.send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
