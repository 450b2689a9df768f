//! Step checkpoint for resumable index builds
//!
//! The checkpoint is a small JSON file mapping each step id to its status and
//! attempt count. It is rewritten atomically (temp file + rename) after every
//! step so an interrupted build can pick up where it left off. An unreadable
//! or partially written file is treated as "no prior state".

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub status: StepStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StepRecord {
    fn pending() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// On-disk record of a multi-step build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCheckpoint {
    /// Schema version for forward compatibility.
    pub version: u32,
    pub steps: BTreeMap<String, StepRecord>,
}

impl Default for StepCheckpoint {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            steps: BTreeMap::new(),
        }
    }
}

impl StepCheckpoint {
    /// Current schema version.
    pub const CURRENT_VERSION: u32 = 1;

    /// Load `path`, falling back to an empty checkpoint when the file is
    /// absent, unparseable or written by a newer version.
    pub fn load_or_fresh(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Unreadable checkpoint, starting fresh");
                return Self::default();
            }
        };

        match serde_json::from_str::<Self>(&content) {
            Ok(checkpoint) if checkpoint.version <= Self::CURRENT_VERSION => checkpoint,
            Ok(checkpoint) => {
                warn!(
                    path = %path.display(),
                    found = checkpoint.version,
                    expected = Self::CURRENT_VERSION,
                    "Checkpoint version mismatch, starting fresh"
                );
                Self::default()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Corrupt checkpoint, starting fresh");
                Self::default()
            }
        }
    }

    /// Write atomically: serialize to `<path>.tmp`, then rename over `path`.
    pub fn save(&self, path: &Path) -> CheckpointResult<()> {
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        std::fs::write(&temp_path, content).map_err(|source| CheckpointError::Io {
            path: temp_path.clone(),
            source,
        })?;
        std::fs::rename(&temp_path, path).map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn status(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn get(&self, step_id: &str) -> Option<&StepRecord> {
        self.steps.get(step_id)
    }

    pub fn mark_in_progress(&mut self, step_id: &str) {
        let record = self.entry(step_id);
        record.status = StepStatus::InProgress;
        record.attempts += 1;
        record.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self, step_id: &str) {
        let record = self.entry(step_id);
        record.status = StepStatus::Completed;
        record.last_error = None;
        record.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, step_id: &str, error: impl Into<String>) {
        let record = self.entry(step_id);
        record.status = StepStatus::Failed;
        record.last_error = Some(error.into());
        record.updated_at = Utc::now();
    }

    fn entry(&mut self, step_id: &str) -> &mut StepRecord {
        self.steps
            .entry(step_id.to_string())
            .or_insert_with(StepRecord::pending)
    }
}

/// How a build treats its prior checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResumeMode {
    /// Ignore prior state and run every step
    Fresh,
    /// Skip completed steps and run everything else
    Resume,
    /// Run only steps that failed or were interrupted; pending steps are left alone
    RetryFailed,
}

impl std::str::FromStr for ResumeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fresh" => Ok(ResumeMode::Fresh),
            "resume" => Ok(ResumeMode::Resume),
            "retry-failed" | "retry_failed" => Ok(ResumeMode::RetryFailed),
            other => Err(format!("unknown resume mode: {other}")),
        }
    }
}

/// Select which of `steps` to run under `mode`, preserving order.
pub fn plan_steps(checkpoint: &StepCheckpoint, steps: &[String], mode: ResumeMode) -> Vec<String> {
    steps
        .iter()
        .filter(|id| match mode {
            ResumeMode::Fresh => true,
            ResumeMode::Resume => checkpoint.status(id) != StepStatus::Completed,
            ResumeMode::RetryFailed => matches!(
                checkpoint.status(id),
                StepStatus::Failed | StepStatus::InProgress
            ),
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn mixed() -> StepCheckpoint {
        let mut cp = StepCheckpoint::default();
        cp.mark_in_progress("a");
        cp.mark_completed("a");
        cp.mark_in_progress("b");
        cp.mark_failed("b", "throttled");
        cp.mark_in_progress("c");
        cp
    }

    #[test]
    fn test_plan_modes() {
        let cp = mixed();
        let steps = ids(&["a", "b", "c", "d"]);

        assert_eq!(plan_steps(&cp, &steps, ResumeMode::Fresh), steps);
        assert_eq!(plan_steps(&cp, &steps, ResumeMode::Resume), ids(&["b", "c", "d"]));
        assert_eq!(plan_steps(&cp, &steps, ResumeMode::RetryFailed), ids(&["b", "c"]));
    }

    #[test]
    fn test_attempts_accumulate() {
        let mut cp = mixed();
        cp.mark_in_progress("b");
        assert_eq!(cp.get("b").unwrap().attempts, 2);
        assert_eq!(cp.get("b").unwrap().last_error.as_deref(), Some("throttled"));
        cp.mark_completed("b");
        assert!(cp.get("b").unwrap().last_error.is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("indexes.json");
        let cp = mixed();
        cp.save(&path).unwrap();

        let loaded = StepCheckpoint::load_or_fresh(&path);
        assert_eq!(loaded, cp);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_corrupt_or_future_file_is_fresh() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("indexes.json");

        std::fs::write(&path, "{\"version\": 1, \"steps\": {\"a\": {\"sta").unwrap();
        assert_eq!(StepCheckpoint::load_or_fresh(&path), StepCheckpoint::default());

        std::fs::write(&path, r#"{"version": 99, "steps": {}}"#).unwrap();
        assert_eq!(StepCheckpoint::load_or_fresh(&path), StepCheckpoint::default());

        let missing = dir.path().join("absent.json");
        assert_eq!(StepCheckpoint::load_or_fresh(&missing), StepCheckpoint::default());
    }

    #[test]
    fn test_resume_mode_parse() {
        assert_eq!("retry-failed".parse::<ResumeMode>().unwrap(), ResumeMode::RetryFailed);
        assert!("later".parse::<ResumeMode>().is_err());
    }
}
