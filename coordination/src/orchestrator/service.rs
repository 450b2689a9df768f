//! Recovery service entrypoint
//!
//! `run_sync` awaits one run in place. `submit` spawns the run and hands back
//! a request id that `status` can be polled with; status reports are kept in
//! memory and mirrored to the audit sink when it persists them.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::controller::{PhaseController, RunOutcome, RunStatus};
use super::{OrchestratorError, OrchestratorResult};
use crate::state::types::DisruptionScenario;

pub type RequestId = String;

/// State of an asynchronously submitted run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatusReport {
    Processing,
    /// Finished with a result; data-unavailable runs land here too
    Complete { outcome: Box<RunOutcome> },
    /// Cancelled or crashed
    Error { message: String },
}

impl RunStatusReport {
    pub fn state_name(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, Self::Processing)
    }

    pub fn outcome(&self) -> Option<&RunOutcome> {
        match self {
            Self::Complete { outcome } => Some(outcome),
            _ => None,
        }
    }
}

struct RunEntry {
    report: RunStatusReport,
    cancel: CancellationToken,
}

pub struct RecoveryService {
    controller: Arc<PhaseController>,
    runs: Arc<RwLock<HashMap<RequestId, RunEntry>>>,
    shutdown: CancellationToken,
}

impl RecoveryService {
    pub fn new(controller: PhaseController) -> Self {
        Self {
            controller: Arc::new(controller),
            runs: Arc::new(RwLock::new(HashMap::new())),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn controller(&self) -> &PhaseController {
        &self.controller
    }

    /// Run `scenario` and wait for the outcome.
    pub async fn run_sync(&self, scenario: DisruptionScenario) -> RunOutcome {
        self.controller.run(scenario, self.shutdown.child_token()).await
    }

    /// Start `scenario` in the background.
    pub async fn submit(&self, scenario: DisruptionScenario) -> RequestId {
        let request_id = Uuid::new_v4().to_string();
        let cancel = self.shutdown.child_token();
        {
            let mut runs = self.runs.write().await;
            runs.insert(
                request_id.clone(),
                RunEntry {
                    report: RunStatusReport::Processing,
                    cancel: cancel.clone(),
                },
            );
        }
        self.persist_status(&request_id, &RunStatusReport::Processing);
        info!(request_id = %request_id, scenario = %scenario.id, "Recovery run submitted");

        let controller = Arc::clone(&self.controller);
        let runs = Arc::clone(&self.runs);
        let id = request_id.clone();
        tokio::spawn(async move {
            let run = tokio::spawn({
                let controller = Arc::clone(&controller);
                async move { controller.run(scenario, cancel).await }
            });
            let report = match run.await {
                Ok(outcome) if outcome.status == RunStatus::Cancelled => RunStatusReport::Error {
                    message: outcome.explanation,
                },
                Ok(outcome) => RunStatusReport::Complete {
                    outcome: Box::new(outcome),
                },
                Err(err) => {
                    error!(request_id = %id, error = %err, "Recovery run task failed");
                    RunStatusReport::Error {
                        message: format!("run failed: {err}"),
                    }
                }
            };

            if let Some(sink) = controller.audit_sink() {
                if let Err(err) = sink.record_status(&id, &report) {
                    warn!(request_id = %id, error = %err, "Failed to persist run status");
                }
            }
            if let Some(entry) = runs.write().await.get_mut(&id) {
                entry.report = report;
            }
        });

        request_id
    }

    pub async fn status(&self, request_id: &str) -> Option<RunStatusReport> {
        self.runs
            .read()
            .await
            .get(request_id)
            .map(|entry| entry.report.clone())
    }

    /// Cancel a submitted run; finished runs are left as they are.
    pub async fn cancel(&self, request_id: &str) -> OrchestratorResult<()> {
        let runs = self.runs.read().await;
        let entry = runs
            .get(request_id)
            .ok_or_else(|| OrchestratorError::UnknownRequest(request_id.to_string()))?;
        if !entry.report.is_finished() {
            info!(request_id, "Cancelling recovery run");
            entry.cancel.cancel();
        }
        Ok(())
    }

    /// Cancel every run in flight, including later `run_sync` calls.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn persist_status(&self, request_id: &str, report: &RunStatusReport) {
        if let Some(sink) = self.controller.audit_sink() {
            if let Err(err) = sink.record_status(request_id, report) {
                warn!(request_id, error = %err, "Failed to persist run status");
            }
        }
    }
}

impl Drop for RecoveryService {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
