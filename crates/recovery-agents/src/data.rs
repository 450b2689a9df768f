//! Fixture data and scenario loading
//!
//! A fixture is a JSON document mapping table names to record arrays, plus
//! optional index definitions:
//!
//! ```json
//! {
//!   "tables": { "flights": [{ "id": "XY123", "origin": "ORD" }] },
//!   "indexes": [{ "name": "crew_by_flight", "table": "crew_roster", "field": "flight_number" }]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use coordination::conflict::parse_duration_hours;
use coordination::retrieval::{Record, KEY_FIELD};
use coordination::{DisruptionScenario, InMemoryBackend, IndexDefinition};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::agents;

static FLIGHT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b([A-Z]{2}\d{1,4})\b").expect("flight regex should compile"));

static TAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(N\d{1,5}[A-Z]{0,2}|[A-Z]-[A-Z]{4}|[A-Z]{2}-[A-Z]{3})\b")
        .expect("tail regex should compile")
});

static AIRPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:at|from|in|to)\s+([A-Z]{3})\b").expect("airport regex should compile")
});

#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("record {position} of table {table} has no string '{field}'")]
    MissingKey {
        table: String,
        position: usize,
        field: &'static str,
    },
}

pub type DataResult<T> = Result<T, DataError>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixtureData {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Record>>,
    /// Index definitions; the default roster's indexes when empty
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
}

impl FixtureData {
    pub fn from_json_str(input: &str, origin: &Path) -> DataResult<Self> {
        let fixture: Self = serde_json::from_str(input).map_err(|source| DataError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        fixture.validate()?;
        Ok(fixture)
    }

    pub fn load(path: &Path) -> DataResult<Self> {
        let input = std::fs::read_to_string(path).map_err(|source| DataError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&input, path)
    }

    /// Every record must carry a string key.
    pub fn validate(&self) -> DataResult<()> {
        for (table, records) in &self.tables {
            if let Some(position) = records
                .iter()
                .position(|r| r.get(KEY_FIELD).and_then(|v| v.as_str()).is_none())
            {
                return Err(DataError::MissingKey {
                    table: table.clone(),
                    position,
                    field: KEY_FIELD,
                });
            }
        }
        Ok(())
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }

    pub fn index_definitions(&self) -> Vec<IndexDefinition> {
        if self.indexes.is_empty() {
            agents::default_indexes()
        } else {
            self.indexes.clone()
        }
    }

    /// Load every table into a fresh in-memory backend. Indexes still have
    /// to be created through the backend.
    pub fn to_backend(&self) -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        for (table, records) in &self.tables {
            backend.insert_all(table, records.iter().cloned());
        }
        backend
    }

    #[cfg(feature = "rocksdb-store")]
    pub fn write_to_store(&self, store: &coordination::StateStore) -> Result<usize, coordination::StoreError> {
        for (table, records) in &self.tables {
            for record in records {
                store.put_record(table, record)?;
            }
        }
        Ok(self.record_count())
    }
}

/// Scenario from a JSON file path, or from free text when `input` is not a file.
pub fn load_scenario(input: &str) -> DataResult<DisruptionScenario> {
    let path = Path::new(input);
    if !path.is_file() {
        return Ok(parse_scenario_text(input));
    }
    let content = std::fs::read_to_string(path).map_err(|source| DataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&content).map_err(|source| DataError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Best-effort extraction of structured fields from a free-text report.
pub fn parse_scenario_text(text: &str) -> DisruptionScenario {
    let text = text.trim();
    let mut scenario = DisruptionScenario::new(text);

    let tail = TAIL_RE.captures(text).map(|c| c[1].to_string());
    if let Some(flight) = FLIGHT_RE
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .find(|f| Some(f) != tail.as_ref())
    {
        scenario = scenario.with_flight(flight);
    }
    if let Some(tail) = tail {
        scenario = scenario.with_aircraft(tail);
    }
    if let Some(caps) = AIRPORT_RE.captures(text) {
        scenario = scenario.with_airport(&caps[1]);
    }
    if let Some(hours) = parse_duration_hours(text) {
        scenario = scenario.with_delay_hours(hours);
    }
    scenario
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_fixture_parses_and_loads() {
        let input = json!({
            "tables": {
                "flights": [{"id": "XY123", "origin": "ORD"}],
                "crew_roster": [
                    {"id": "c-1", "flight_number": "XY123"},
                    {"id": "c-2", "flight_number": "XY123"}
                ]
            }
        })
        .to_string();
        let fixture = FixtureData::from_json_str(&input, Path::new("inline")).unwrap();

        assert_eq!(fixture.record_count(), 3);
        assert_eq!(fixture.index_definitions(), agents::default_indexes());
        let _backend = fixture.to_backend();
    }

    #[test]
    fn test_fixture_rejects_unkeyed_record() {
        let input = json!({"tables": {"flights": [{"id": "A1"}, {"origin": "ORD"}]}}).to_string();
        let err = FixtureData::from_json_str(&input, Path::new("inline")).unwrap_err();
        assert!(matches!(err, DataError::MissingKey { position: 1, .. }));
    }

    #[test]
    fn test_parse_free_text_scenario() {
        let scenario = parse_scenario_text(
            "Flight XY123 (N123AB) at ORD delayed 3 hours after a hydraulic leak was found",
        );
        assert_eq!(scenario.flight_number.as_deref(), Some("XY123"));
        assert_eq!(scenario.aircraft_registration.as_deref(), Some("N123AB"));
        assert_eq!(scenario.airport.as_deref(), Some("ORD"));
        assert_eq!(scenario.delay_hours, Some(3.0));
    }

    #[test]
    fn test_load_scenario_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scenario.json");
        let original = DisruptionScenario::new("Crew sick call").with_id("scn-7").with_flight("AB45");
        std::fs::write(&path, serde_json::to_string(&original).unwrap()).unwrap();

        let loaded = load_scenario(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded, original);

        let text = load_scenario("Crew sick call on AB45").unwrap();
        assert_eq!(text.flight_number.as_deref(), Some("AB45"));
    }
}
