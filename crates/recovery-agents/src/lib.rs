//! Disruption recovery agent runtime
//!
//! Concrete pieces the coordination library leaves to its caller:
//!
//! - [`agents`]: default roster, context sources and the indexes they need
//! - [`prompts`]: per-agent system prompts and the invocation user message
//! - [`reasoner_http`]: [`coordination::Reasoner`] over an OpenAI-compatible endpoint
//! - [`config`]: endpoint and per-agent model configuration from the environment
//! - [`data`]: fixture tables and scenario loading for the CLI

pub mod agents;
pub mod config;
pub mod data;
pub mod prompts;
pub mod reasoner_http;

pub use agents::{default_config, default_indexes, default_roster};
pub use config::{AgentsConfig, ReasonerEndpoint};
pub use data::{load_scenario, parse_scenario_text, DataError, FixtureData};
pub use reasoner_http::HttpReasoner;
