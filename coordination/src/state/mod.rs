//! Run data model and optional persistent storage
//!
//! [`types`] holds the entities every stage passes along: scenarios, agent
//! identities, responses and collations. They are created fresh per run and
//! never mutated after being handed to the next stage.
//!
//! With the `heavy-state` feature, [`store::StateStore`] provides a RocksDB
//! store whose column families separate the data it keeps:
//!
//! - `records`: backend records served through the `KvBackend` contract
//! - `indexes`: derived secondary index definitions and entries
//! - `audit`: one audit record per run
//! - `runs`: status reports of asynchronously submitted runs
//!
//! # Usage
//!
//! ```ignore
//! use coordination::state::StateStore;
//!
//! let store = StateStore::open("./recovery-state")?.shared();
//! store.put_record("crew", &serde_json::json!({"id": "c-1", "flight": "XY123"}))?;
//! ```

#[cfg(feature = "heavy-state")]
pub mod schema;
#[cfg(feature = "heavy-state")]
pub mod store;
pub mod types;

#[cfg(feature = "heavy-state")]
pub use store::{SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    AgentId, AgentKind, AgentResponse, Collation, DisruptionScenario, ImpactAssessment, PhaseTag,
    ResponseStatus, RunId, ScenarioField,
};
