//! Orchestrator state and run outcomes.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::sync::Arc;
use uuid::Uuid;

use super::StageResult;
use crate::cancellation::CancellationToken;
use crate::errors::ResilienceError;

/// Where the orchestrator currently is in a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PipelinePhase {
    /// No run in flight.
    #[default]
    Idle,
    /// Listing candidates and consulting the ledger.
    Selecting,
    /// Executing the stage at `index`.
    Running {
        /// Zero-based stage position.
        index: usize,
        /// Stage name.
        stage: String,
    },
    /// Compensating completed stages.
    Cleaning,
    /// Writing the ledger record.
    Recording,
}

/// How a run ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every stage succeeded and the success record was written.
    Succeeded {
        /// Processed task.
        task_id: String,
        /// Stage outputs in execution order.
        results: Vec<StageResult>,
    },
    /// A stage failed terminally; completed stages were compensated.
    Failed {
        /// Processed task.
        task_id: String,
        /// Zero-based position of the failing stage.
        stage_index: usize,
        /// Name of the failing stage.
        stage: String,
        /// The stage's final error.
        #[serde(serialize_with = "serialize_error")]
        error: ResilienceError,
    },
    /// The run was stopped; completed stages were compensated.
    Stopped {
        /// Processed task.
        task_id: String,
    },
    /// Every candidate already has a settled ledger record.
    NoCandidate,
    /// The run could not reach a terminal record (source or ledger failure).
    Aborted {
        /// Task being processed, if one had been selected.
        task_id: Option<String>,
        /// What went wrong.
        #[serde(serialize_with = "serialize_error")]
        error: ResilienceError,
    },
}

impl RunOutcome {
    /// Short label used in events and logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Stopped { .. } => "stopped",
            Self::NoCandidate => "no_candidate",
            Self::Aborted { .. } => "aborted",
        }
    }

    /// The task the run worked on, if any.
    #[must_use]
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Self::Succeeded { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Stopped { task_id } => Some(task_id),
            Self::Aborted { task_id, .. } => task_id.as_deref(),
            Self::NoCandidate => None,
        }
    }

    /// True for [`RunOutcome::Succeeded`].
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }
}

fn serialize_error<S: Serializer>(error: &ResilienceError, serializer: S) -> Result<S::Ok, S::Error> {
    error.to_dict().serialize(serializer)
}

/// Reply to a trigger request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerResponse {
    /// A run was started.
    Accepted {
        /// Identifier of the new run.
        run_id: Uuid,
    },
    /// A run is already in flight; nothing was started.
    Busy,
}

impl TriggerResponse {
    /// True if a run was started.
    #[must_use]
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    /// Whether a run holds the single-flight lock.
    pub in_flight: bool,
    /// Current phase.
    #[serde(flatten)]
    pub phase: PipelinePhase,
    /// Task of the current run.
    pub current_task: Option<String>,
    /// Outcome of the most recently finished run.
    pub last_outcome: Option<RunOutcome>,
    /// When the most recent run finished.
    pub last_run_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub(crate) struct RunState {
    pub(crate) in_flight: bool,
    pub(crate) phase: PipelinePhase,
    pub(crate) current_task: Option<String>,
    pub(crate) run_id: Option<Uuid>,
    pub(crate) latest_run: Option<Uuid>,
    pub(crate) cancel: Option<Arc<CancellationToken>>,
    pub(crate) last_outcome: Option<RunOutcome>,
    pub(crate) last_run_at: Option<DateTime<Utc>>,
}

impl RunState {
    pub(crate) fn owned_by(&self, run_id: Uuid) -> bool {
        self.run_id == Some(run_id)
    }

    /// True if no run has started since `run_id`.
    pub(crate) fn is_latest(&self, run_id: Uuid) -> bool {
        self.latest_run == Some(run_id)
    }

    pub(crate) fn release(&mut self) -> Option<Arc<CancellationToken>> {
        self.in_flight = false;
        self.phase = PipelinePhase::Idle;
        self.current_task = None;
        self.run_id = None;
        self.cancel.take()
    }

    pub(crate) fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            in_flight: self.in_flight,
            phase: self.phase.clone(),
            current_task: self.current_task.clone(),
            last_outcome: self.last_outcome.clone(),
            last_run_at: self.last_run_at,
        }
    }
}
