//! Execution state transitions
//!
//! Every transition validates the current status before touching anything, so
//! a rejected transition leaves the execution unchanged. These helpers are
//! applied inside [`crate::registry::ExecutionRegistry::modify`] closures.

use crate::error::{RunbookError, RunbookResult};
use crate::models::{ExecutionStatus, RunbookExecution, StepExecution, StepStatus};
use chrono::Utc;

/// Error recorded on steps cut short by an abort
pub const INTERRUPTED_BY_ABORT: &str = "Interrupted by abort";

/// Manages execution and step state transitions
pub struct StateManager;

impl StateManager {
    /// Pause a running execution at the next step boundary
    pub fn pause_execution(
        execution: &mut RunbookExecution,
        reason: Option<String>,
    ) -> RunbookResult<()> {
        if execution.status != ExecutionStatus::Running {
            return Err(RunbookError::InvalidTransition(format!(
                "Cannot pause execution in {:?} status",
                execution.status
            )));
        }

        execution.status = ExecutionStatus::Paused;
        execution.paused_at = Some(Utc::now());
        execution.pause_reason = reason;
        Ok(())
    }

    /// Resume a paused execution
    pub fn resume_execution(execution: &mut RunbookExecution) -> RunbookResult<()> {
        if execution.status != ExecutionStatus::Paused {
            return Err(RunbookError::InvalidTransition(format!(
                "Cannot resume execution in {:?} status",
                execution.status
            )));
        }

        execution.status = ExecutionStatus::Running;
        execution.paused_at = None;
        execution.pause_reason = None;
        Ok(())
    }

    /// Move a non-terminal execution to Aborting, returning the previous status
    pub fn begin_abort(
        execution: &mut RunbookExecution,
        reason: Option<String>,
    ) -> RunbookResult<ExecutionStatus> {
        let previous = execution.status;
        if previous.is_terminal() || previous == ExecutionStatus::Aborting {
            return Err(RunbookError::InvalidTransition(format!(
                "Cannot abort execution in {:?} status",
                previous
            )));
        }

        execution.status = ExecutionStatus::Aborting;
        execution.aborted_at = Some(Utc::now());
        execution.abort_reason = reason;
        Ok(previous)
    }

    /// Finish an abort
    ///
    /// Steps still running or waiting to retry are failed, so an aborted
    /// execution never holds an unfinished step.
    pub fn complete_abort(execution: &mut RunbookExecution) -> RunbookResult<()> {
        if execution.status != ExecutionStatus::Aborting {
            return Err(RunbookError::InvalidTransition(format!(
                "Cannot complete abort of execution in {:?} status",
                execution.status
            )));
        }

        let now = Utc::now();
        for step in execution
            .step_executions
            .iter_mut()
            .filter(|s| matches!(s.status, StepStatus::Running | StepStatus::Retrying))
        {
            step.status = StepStatus::Failed;
            step.error = Some(INTERRUPTED_BY_ABORT.to_string());
            step.completed_at = Some(now);
        }

        execution.status = ExecutionStatus::Aborted;
        execution.completed_at = Some(now);
        Ok(())
    }

    /// Mark a step attempt as started
    pub fn start_step(execution: &mut RunbookExecution, step_id: &str) -> RunbookResult<()> {
        let step = Self::step_mut(execution, step_id)?;
        step.status = StepStatus::Running;
        step.started_at = Some(Utc::now());
        step.completed_at = None;
        Ok(())
    }

    /// Mark a step as completed
    pub fn complete_step(
        execution: &mut RunbookExecution,
        step_id: &str,
        output: Option<String>,
    ) -> RunbookResult<()> {
        let step = Self::step_mut(execution, step_id)?;
        step.status = StepStatus::Completed;
        step.output = output;
        step.error = None;
        step.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a step as failed
    pub fn fail_step(
        execution: &mut RunbookExecution,
        step_id: &str,
        error: String,
    ) -> RunbookResult<()> {
        let step = Self::step_mut(execution, step_id)?;
        step.status = StepStatus::Failed;
        step.error = Some(error);
        step.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Consume one retry after a failed attempt, returning the attempt number
    pub fn schedule_retry(
        execution: &mut RunbookExecution,
        step_id: &str,
        error: String,
    ) -> RunbookResult<u32> {
        let step = Self::step_mut(execution, step_id)?;
        if !step.can_retry() {
            return Err(RunbookError::RetryExhausted {
                step_id: step_id.to_string(),
                max_retries: step.max_retries,
            });
        }

        step.retry_count += 1;
        step.status = StepStatus::Retrying;
        step.error = Some(error);
        Ok(step.retry_count)
    }

    /// Operator-requested retry of a failed step
    pub fn request_retry(execution: &mut RunbookExecution, step_id: &str) -> RunbookResult<u32> {
        let step = Self::step_mut(execution, step_id)?;
        if step.status != StepStatus::Failed {
            return Err(RunbookError::InvalidTransition(format!(
                "Step {} is {:?}, only failed steps can be retried",
                step_id, step.status
            )));
        }
        if !step.can_retry() {
            return Err(RunbookError::RetryExhausted {
                step_id: step_id.to_string(),
                max_retries: step.max_retries,
            });
        }

        step.retry_count += 1;
        step.status = StepStatus::Retrying;
        step.completed_at = None;
        Ok(step.retry_count)
    }

    /// Block a step on a denied or expired gate; the execution becomes Blocked
    pub fn block_step(
        execution: &mut RunbookExecution,
        step_id: &str,
        reason: String,
    ) -> RunbookResult<()> {
        let step = Self::step_mut(execution, step_id)?;
        step.status = StepStatus::Blocked;
        step.error = Some(reason);
        step.completed_at = Some(Utc::now());

        execution.status = ExecutionStatus::Blocked;
        execution.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Stop the execution as Failed
    pub fn fail_execution(execution: &mut RunbookExecution) {
        execution.status = ExecutionStatus::Failed;
        execution.completed_at = Some(Utc::now());
    }

    /// Finalize after the last step, returning the terminal status
    pub fn finalize(execution: &mut RunbookExecution) -> ExecutionStatus {
        execution.status = if execution.all_steps_completed() {
            ExecutionStatus::Completed
        } else {
            ExecutionStatus::CompletedWithErrors
        };
        execution.completed_at = Some(Utc::now());
        execution.status
    }

    /// Bring a halted execution back to Running so a retried step can run
    pub fn reopen(execution: &mut RunbookExecution) -> RunbookResult<ExecutionStatus> {
        let previous = execution.status;
        if !matches!(
            previous,
            ExecutionStatus::Failed | ExecutionStatus::CompletedWithErrors
        ) {
            return Err(RunbookError::InvalidTransition(format!(
                "Cannot reopen execution in {:?} status",
                previous
            )));
        }

        execution.status = ExecutionStatus::Running;
        execution.completed_at = None;
        Ok(previous)
    }

    /// Steps an operator moved to Retrying, in definition order
    pub fn pending_retries(execution: &RunbookExecution) -> Vec<String> {
        execution
            .step_executions
            .iter()
            .filter(|s| s.status == StepStatus::Retrying)
            .map(|s| s.step_id.clone())
            .collect()
    }

    fn step_mut<'a>(
        execution: &'a mut RunbookExecution,
        step_id: &str,
    ) -> RunbookResult<&'a mut StepExecution> {
        let execution_id = execution.id.clone();
        execution.step_mut(step_id).ok_or_else(|| {
            RunbookError::NotFound(format!(
                "Step {} not found in execution {}",
                step_id, execution_id
            ))
        })
    }
}
