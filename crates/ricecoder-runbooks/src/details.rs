//! Read-only execution snapshots for callers and UIs

use crate::models::{
    ExecutionStatus, RunbookExecution, StepExecution, StepStatus, TriggerInfo,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Per-step view
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepDetails {
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Current status
    pub status: StepStatus,
    /// When the latest attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a final state
    pub completed_at: Option<DateTime<Utc>>,
    /// Time between start and completion
    pub duration: Option<Duration>,
    /// Captured output
    pub output: Option<String>,
    /// Captured error
    pub error: Option<String>,
    /// Retries consumed
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
    /// Whether an operator may retry the step now
    pub can_retry: bool,
}

impl From<&StepExecution> for StepDetails {
    fn from(step: &StepExecution) -> Self {
        let duration = match (step.started_at, step.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        };
        Self {
            step_id: step.step_id.clone(),
            step_name: step.step_name.clone(),
            status: step.status,
            started_at: step.started_at,
            completed_at: step.completed_at,
            duration,
            output: step.output.clone(),
            error: step.error.clone(),
            retry_count: step.retry_count,
            max_retries: step.max_retries,
            can_retry: step.status == StepStatus::Failed && step.can_retry(),
        }
    }
}

/// Step counts by outcome
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ExecutionProgress {
    /// Number of steps
    pub total: usize,
    /// Completed steps
    pub completed: usize,
    /// Failed steps
    pub failed: usize,
    /// Blocked steps
    pub blocked: usize,
    /// Steps not yet finished
    pub remaining: usize,
    /// Completed share, 0-100
    pub percent_complete: u32,
}

impl ExecutionProgress {
    fn of(steps: &[StepExecution]) -> Self {
        let count = |status: StepStatus| steps.iter().filter(|s| s.status == status).count();
        let total = steps.len();
        let completed = count(StepStatus::Completed);
        let failed = count(StepStatus::Failed);
        let blocked = count(StepStatus::Blocked);
        let finished = completed + failed + blocked + count(StepStatus::Skipped);
        let percent_complete = if total == 0 {
            100
        } else {
            ((completed * 100) / total) as u32
        };

        Self {
            total,
            completed,
            failed,
            blocked,
            remaining: total - finished,
            percent_complete,
        }
    }
}

/// Snapshot of an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionDetails {
    /// Execution identifier
    pub execution_id: String,
    /// Source runbook identifier
    pub runbook_id: String,
    /// Source runbook name
    pub runbook_name: String,
    /// Current status
    pub status: ExecutionStatus,
    /// Trigger metadata
    pub trigger: TriggerInfo,
    /// Whether steps were simulated
    pub is_dry_run: bool,
    /// Whether the execution is still registered
    pub is_active: bool,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// When the execution reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Elapsed time, up to now for active executions
    pub duration: Duration,
    /// Why the execution is paused
    pub pause_reason: Option<String>,
    /// Why the execution was aborted
    pub abort_reason: Option<String>,
    /// Per-step details in definition order
    pub steps: Vec<StepDetails>,
    /// Step counts
    pub progress: ExecutionProgress,
    /// Registered compensations
    pub compensation_count: usize,
}

impl ExecutionDetails {
    /// Assemble details from an execution snapshot
    pub fn from_execution(execution: &RunbookExecution, is_active: bool) -> Self {
        let end = execution.completed_at.unwrap_or_else(Utc::now);
        Self {
            execution_id: execution.id.clone(),
            runbook_id: execution.runbook_id.clone(),
            runbook_name: execution.runbook_name.clone(),
            status: execution.status,
            trigger: execution.trigger.clone(),
            is_dry_run: execution.is_dry_run,
            is_active,
            started_at: execution.started_at,
            completed_at: execution.completed_at,
            duration: (end - execution.started_at).to_std().unwrap_or(Duration::ZERO),
            pause_reason: execution.pause_reason.clone(),
            abort_reason: execution.abort_reason.clone(),
            steps: execution.step_executions.iter().map(StepDetails::from).collect(),
            progress: ExecutionProgress::of(&execution.step_executions),
            compensation_count: execution.compensation_steps.len(),
        }
    }

    /// Step details by id
    pub fn step(&self, step_id: &str) -> Option<&StepDetails> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }
}
