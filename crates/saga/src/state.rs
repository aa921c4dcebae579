//! Saga state machine and the per-order saga record.

use chrono::{DateTime, Utc};
use common::short_code;
use serde::{Deserialize, Serialize};

use crate::steps::SagaStep;

/// The status of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// Started ──┬──► Completed
///           └──► Compensating ──┬──► Failed
///                               └──► CompensationFailed
/// Failed | CompensationFailed ──► Started   (payment retried)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Forward steps are being executed.
    #[default]
    Started,

    /// A step failed and compensating actions are in progress.
    Compensating,

    /// All steps completed successfully (terminal state).
    Completed,

    /// Compensation finished after a failure.
    Failed,

    /// Compensation itself failed. Needs manual reconciliation.
    CompensationFailed,
}

impl SagaStatus {
    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Started)
    }

    /// Returns true if a new forward attempt may start from this status.
    ///
    /// A saga left `CompensationFailed` by a stock step may resume; the
    /// orchestrator still refuses while the order holds an unsettled charge.
    pub fn can_resume(&self) -> bool {
        matches!(
            self,
            SagaStatus::Started | SagaStatus::Failed | SagaStatus::CompensationFailed
        )
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Started => "Started",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
            SagaStatus::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What the orchestrator knows about one order's saga.
///
/// `completed_steps` lists the steps whose effects are currently in
/// place: a step is dropped from it once compensated, or once a later
/// step has consumed its effect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaState {
    pub saga_id: String,
    pub order_number: String,
    pub status: SagaStatus,
    pub current_step: Option<SagaStep>,
    pub completed_steps: Vec<SagaStep>,
    pub compensation_attempts: u32,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaState {
    pub fn new(order_number: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            saga_id: format!("SAGA-{}", short_code()),
            order_number: order_number.into(),
            status: SagaStatus::Started,
            current_step: None,
            completed_steps: Vec::new(),
            compensation_attempts: 0,
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn begin(&mut self, step: SagaStep) {
        tracing::info!(saga_id = %self.saga_id, step = step.as_str(), "saga step started");
        self.current_step = Some(step);
        self.touch();
    }

    pub fn complete_step(&mut self, step: SagaStep) {
        self.completed_steps.retain(|s| *s != step);
        self.completed_steps.push(step);
        self.current_step = None;
        self.touch();
    }

    /// Drops a step whose effect no longer needs undoing.
    pub fn retire(&mut self, step: SagaStep) {
        self.completed_steps.retain(|s| *s != step);
        self.touch();
    }

    pub fn has_completed(&self, step: SagaStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Starts a new forward attempt after a failure.
    pub fn resume(&mut self) {
        if matches!(self.status, SagaStatus::Failed | SagaStatus::CompensationFailed) {
            self.status = SagaStatus::Started;
            self.touch();
        }
    }

    pub fn start_compensation(&mut self, error: impl Into<String>) {
        self.status = SagaStatus::Compensating;
        self.last_error = Some(error.into());
        self.touch();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = SagaStatus::Failed;
        self.current_step = None;
        self.last_error = Some(error.into());
        self.touch();
    }

    pub fn compensation_failed(&mut self, error: impl Into<String>) {
        self.status = SagaStatus::CompensationFailed;
        self.last_error = Some(error.into());
        self.touch();
    }

    pub fn complete(&mut self) {
        self.status = SagaStatus::Completed;
        self.current_step = None;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
