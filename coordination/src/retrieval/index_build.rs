//! Resumable derived-index build
//!
//! Applies a list of idempotent [`IndexDefinition`] steps through
//! [`KvBackend::create_index`], saving the [`StepCheckpoint`] after every state
//! change. Retryable backend errors back off along the retrieval schedule.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::backend::{BackendError, IndexDefinition, KvBackend};
use super::checkpoint::{plan_steps, CheckpointResult, ResumeMode, StepCheckpoint};
use crate::config::RetrievalConfig;

/// What one build invocation did
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexBuildReport {
    /// Steps completed during this invocation
    pub completed: Vec<String>,
    /// Steps that ended in failure during this invocation
    pub failed: Vec<String>,
    /// Steps excluded by the resume mode
    pub skipped: Vec<String>,
    /// Planned steps never started (cancellation or storage outage)
    pub not_run: Vec<String>,
}

enum StepOutcome {
    Applied,
    Cancelled,
}

impl IndexBuildReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.not_run.is_empty()
    }
}

pub struct IndexBuildRunner {
    backend: Arc<dyn KvBackend>,
    retry: RetrievalConfig,
    state_path: PathBuf,
}

impl IndexBuildRunner {
    pub fn new(backend: Arc<dyn KvBackend>, retry: RetrievalConfig, state_path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            retry,
            state_path: state_path.into(),
        }
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    /// Run the build. Only checkpoint I/O failures are returned as errors;
    /// step failures are recorded in the checkpoint and the report.
    pub async fn run(
        &self,
        indexes: &[IndexDefinition],
        mode: ResumeMode,
        cancel: &CancellationToken,
    ) -> CheckpointResult<IndexBuildReport> {
        let mut checkpoint = match mode {
            ResumeMode::Fresh => StepCheckpoint::default(),
            _ => StepCheckpoint::load_or_fresh(&self.state_path),
        };

        let step_ids: Vec<String> = indexes.iter().map(IndexDefinition::step_id).collect();
        let planned = plan_steps(&checkpoint, &step_ids, mode);
        let mut report = IndexBuildReport {
            skipped: step_ids
                .iter()
                .filter(|id| !planned.contains(id))
                .cloned()
                .collect(),
            ..Default::default()
        };
        info!(
            mode = ?mode,
            planned = planned.len(),
            skipped = report.skipped.len(),
            "Starting index build"
        );

        let mut remaining = planned.iter();
        while let Some(step_id) = remaining.next() {
            if cancel.is_cancelled() {
                warn!(step = %step_id, "Index build cancelled");
                report.not_run.push(step_id.clone());
                report.not_run.extend(remaining.by_ref().cloned());
                break;
            }
            let Some(index) = indexes.iter().find(|ix| &ix.step_id() == step_id) else {
                continue;
            };

            checkpoint.mark_in_progress(step_id);
            checkpoint.save(&self.state_path)?;

            match self.apply_with_retry(index, cancel).await {
                Ok(StepOutcome::Applied) => {
                    checkpoint.mark_completed(step_id);
                    checkpoint.save(&self.state_path)?;
                    info!(step = %step_id, "Index step completed");
                    report.completed.push(step_id.clone());
                }
                Ok(StepOutcome::Cancelled) => {
                    // left in progress so a resumed build retries it
                    warn!(step = %step_id, "Index build cancelled during backoff");
                    report.not_run.push(step_id.clone());
                    report.not_run.extend(remaining.by_ref().cloned());
                    break;
                }
                Err(err) => {
                    checkpoint.mark_failed(step_id, err.to_string());
                    checkpoint.save(&self.state_path)?;
                    warn!(step = %step_id, error = %err, "Index step failed");
                    report.failed.push(step_id.clone());
                    if matches!(err, BackendError::Unavailable(_)) {
                        report.not_run.extend(remaining.by_ref().cloned());
                        break;
                    }
                }
            }
        }

        Ok(report)
    }

    async fn apply_with_retry(
        &self,
        index: &IndexDefinition,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, BackendError> {
        let max_attempts = self.retry.max_attempts();
        let mut attempt = 0;
        loop {
            match self.backend.create_index(index).await {
                Ok(()) => return Ok(StepOutcome::Applied),
                Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                    let delay = self.retry.backoff(attempt);
                    warn!(index = %index.name, attempt = attempt + 1, error = %err, "Index creation failed, backing off");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(StepOutcome::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::backend::{Fault, InMemoryBackend};
    use crate::retrieval::checkpoint::StepStatus;
    use std::time::Duration;
    use tempfile::TempDir;

    fn indexes() -> Vec<IndexDefinition> {
        vec![
            IndexDefinition::new("by_flight", "crew", "flight"),
            IndexDefinition::new("by_tail", "maintenance", "tail"),
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.push_fault(Fault::Fail(BackendError::ResourceInUse("busy".into())));
        let runner = IndexBuildRunner::new(backend.clone(), RetrievalConfig::default(), dir.path().join("s.json"));

        let report = runner
            .run(&indexes(), ResumeMode::Fresh, &CancellationToken::new())
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.completed.len(), 2);
        assert_eq!(backend.index_calls(), 3);

        let cp = StepCheckpoint::load_or_fresh(runner.state_path());
        assert_eq!(cp.status("crew.by_flight"), StepStatus::Completed);
        assert_eq!(cp.get("crew.by_flight").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        let runner = IndexBuildRunner::new(backend.clone(), RetrievalConfig::default(), dir.path().join("s.json"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = runner.run(&indexes(), ResumeMode::Resume, &cancel).await.unwrap();
        assert_eq!(report.not_run.len(), 2);
        assert_eq!(backend.index_calls(), 0);
    }

    #[tokio::test]
    async fn test_outage_stops_remaining_steps() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.push_fault(Fault::Fail(BackendError::Unavailable("down".into())));
        let runner = IndexBuildRunner::new(backend.clone(), RetrievalConfig::default(), dir.path().join("s.json"));

        let report = runner
            .run(&indexes(), ResumeMode::Fresh, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.failed, vec!["crew.by_flight".to_string()]);
        assert_eq!(report.not_run, vec!["maintenance.by_tail".to_string()]);

        let cp = StepCheckpoint::load_or_fresh(runner.state_path());
        assert_eq!(cp.status("crew.by_flight"), StepStatus::Failed);
        assert_eq!(cp.status("maintenance.by_tail"), StepStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff() {
        let dir = TempDir::new().unwrap();
        let backend = Arc::new(InMemoryBackend::new());
        backend.set_persistent_fault(Some(Fault::Fail(BackendError::ResourceInUse("busy".into()))));
        let runner = IndexBuildRunner::new(backend.clone(), RetrievalConfig::default(), dir.path().join("s.json"));
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                cancel.cancel();
            });
        }

        let started = tokio::time::Instant::now();
        let report = runner.run(&indexes(), ResumeMode::Fresh, &cancel).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(30));
        assert_eq!(backend.index_calls(), 1);
        assert!(report.completed.is_empty() && report.failed.is_empty());
        assert_eq!(
            report.not_run,
            vec!["crew.by_flight".to_string(), "maintenance.by_tail".to_string()]
        );
        let cp = StepCheckpoint::load_or_fresh(runner.state_path());
        assert_eq!(cp.status("crew.by_flight"), StepStatus::InProgress);
    }
}
