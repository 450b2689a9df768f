//! Audit records
//!
//! One record per run carrying every input and intermediate the arbitration
//! was derived from, sealed with a blake3 digest over its JSON body.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::controller::RunStatus;
use super::service::RunStatusReport;
use crate::arbitration::ArbitratorOutput;
use crate::state::types::{Collation, DisruptionScenario, RunId};

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit log {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("audit serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("audit store: {0}")]
    Store(String),
}

pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub scenario: DisruptionScenario,
    pub collation_initial: Option<Collation>,
    pub collation_revision: Option<Collation>,
    pub arbitrator_output: Option<ArbitratorOutput>,
    /// Phase name -> wall time in ms
    pub phase_durations: BTreeMap<String, u64>,
    pub total_duration_ms: u64,
    /// blake3 hex over every other field
    pub digest: String,
}

/// Borrowed view of the digested fields
#[derive(Serialize)]
struct DigestBody<'a> {
    run_id: &'a str,
    status: RunStatus,
    scenario: &'a DisruptionScenario,
    collation_initial: &'a Option<Collation>,
    collation_revision: &'a Option<Collation>,
    arbitrator_output: &'a Option<ArbitratorOutput>,
    phase_durations: &'a BTreeMap<String, u64>,
    total_duration_ms: u64,
}

impl AuditRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        status: RunStatus,
        scenario: DisruptionScenario,
        collation_initial: Option<Collation>,
        collation_revision: Option<Collation>,
        arbitrator_output: Option<ArbitratorOutput>,
        phase_durations: BTreeMap<String, u64>,
        total_duration_ms: u64,
    ) -> Self {
        let mut record = Self {
            run_id,
            status,
            scenario,
            collation_initial,
            collation_revision,
            arbitrator_output,
            phase_durations,
            total_duration_ms,
            digest: String::new(),
        };
        record.digest = record.compute_digest();
        record
    }

    pub fn compute_digest(&self) -> String {
        let body = DigestBody {
            run_id: &self.run_id,
            status: self.status,
            scenario: &self.scenario,
            collation_initial: &self.collation_initial,
            collation_revision: &self.collation_revision,
            arbitrator_output: &self.arbitrator_output,
            phase_durations: &self.phase_durations,
            total_duration_ms: self.total_duration_ms,
        };
        // plain data with string keys always serializes
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        blake3::hash(&bytes).to_hex().to_string()
    }

    pub fn verify_digest(&self) -> bool {
        self.digest == self.compute_digest()
    }
}

/// Destination for audit records and async run status
pub trait AuditSink: Send + Sync {
    fn record_audit(&self, record: &AuditRecord) -> AuditResult<()>;

    fn record_status(&self, _request_id: &str, _report: &RunStatusReport) -> AuditResult<()> {
        Ok(())
    }
}

/// Append-only JSONL file, one audit record per line
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every record in the log, in append order.
    pub fn read_all(&self) -> AuditResult<Vec<AuditRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(AuditError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record_audit(&self, record: &AuditRecord) -> AuditResult<()> {
        let json = serde_json::to_string(record)?;
        let io_err = |source| AuditError::Io {
            path: self.path.clone(),
            source,
        };

        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{json}").map_err(io_err)?;

        info!(run_id = %record.run_id, path = %self.path.display(), "Appended audit record");
        Ok(())
    }

    fn record_status(&self, request_id: &str, report: &RunStatusReport) -> AuditResult<()> {
        debug!(request_id, state = report.state_name(), "Run status updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(run_id: &str) -> AuditRecord {
        let mut durations = BTreeMap::new();
        durations.insert("initial".to_string(), 12);
        AuditRecord::new(
            run_id.to_string(),
            RunStatus::DataUnavailable,
            DisruptionScenario::new("Bird strike on approach").with_id("scn-1"),
            None,
            None,
            None,
            durations,
            12,
        )
    }

    #[test]
    fn test_digest_detects_tampering() {
        let mut audit = record("run-1");
        assert!(audit.verify_digest());
        assert_eq!(audit.digest.len(), 64);

        audit.total_duration_ms = 99;
        assert!(!audit.verify_digest());
    }

    #[test]
    fn test_digest_is_stable() {
        let a = record("run-1");
        let mut b = a.clone();
        b.digest = b.compute_digest();
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, record("run-2").digest);
    }

    #[test]
    fn test_jsonl_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("audit").join("runs.jsonl"));

        sink.record_audit(&record("run-1")).unwrap();
        sink.record_audit(&record("run-2")).unwrap();

        let records = sink.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].run_id, "run-1");
        assert_eq!(records[1].run_id, "run-2");
        assert!(records.iter().all(AuditRecord::verify_digest));
    }

    #[test]
    fn test_missing_log_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::new(dir.path().join("none.jsonl"));
        assert!(sink.read_all().unwrap().is_empty());
    }
}
