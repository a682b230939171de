//! Per-execution step runner
//!
//! A runner drives one execution through its steps in definition order. It
//! only re-checks the execution status at step boundaries, so pause is
//! cooperative: a step already handed to the executor runs to completion.
//!
//! The runner owns the terminal transitions of a run (Completed,
//! CompletedWithErrors, Failed, Blocked). Aborts are owned by the controller;
//! when the runner sees Aborting or Aborted it simply stops.

use crate::approval::ApprovalService;
use crate::compensation::CompensationManager;
use crate::error::{RunbookError, RunbookResult};
use crate::events::{EventBus, RunbookEvent};
use crate::executor::{StepExecutor, StepOutcome};
use crate::gates::GateBuilder;
use crate::models::{
    ExecutionStatus, RunbookDefinition, RunbookExecution, RunbookStep, StepStatus,
};
use crate::registry::{try_modify, ExecutionRegistry};
use crate::repository::ExecutionRepository;
use crate::retry::RetryPolicy;
use crate::state::StateManager;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Collaborators and settings shared by every runner
pub struct RunnerContext {
    /// Active executions
    pub registry: Arc<dyn ExecutionRegistry>,
    /// Execution persistence
    pub repository: Arc<dyn ExecutionRepository>,
    /// Step collaborator
    pub step_executor: Arc<dyn StepExecutor>,
    /// Approval collaborator
    pub approvals: Arc<dyn ApprovalService>,
    /// Compensation registration
    pub compensations: CompensationManager,
    /// Outbound notifications
    pub events: EventBus,
    /// Approval gate factory
    pub gates: GateBuilder,
    /// Backoff between automatic retries
    pub retry_policy: RetryPolicy,
    /// How often a paused runner checks for resume
    pub pause_poll_interval: Duration,
    /// Simulated duration of a dry-run step
    pub dry_run_step_delay: Duration,
}

/// Drives a single execution
pub struct StepRunner {
    execution_id: String,
    runbook: Arc<RunbookDefinition>,
    start_index: usize,
    ctx: Arc<RunnerContext>,
    cancellation: CancellationToken,
}

// Steps the main pass will attempt
fn is_runnable(status: StepStatus) -> bool {
    matches!(
        status,
        StepStatus::Pending | StepStatus::Running | StepStatus::Retrying
    )
}

// Refuse runner mutations once the controller started an abort
fn ensure_active(execution: &RunbookExecution) -> RunbookResult<()> {
    match execution.status {
        ExecutionStatus::Aborting | ExecutionStatus::Aborted => Err(RunbookError::Cancelled),
        _ => Ok(()),
    }
}

impl StepRunner {
    /// Create a runner for a registered execution
    pub fn new(
        execution_id: impl Into<String>,
        runbook: Arc<RunbookDefinition>,
        ctx: Arc<RunnerContext>,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            runbook,
            start_index: 0,
            ctx,
            cancellation,
        }
    }

    /// Begin the main pass at the given step position
    pub fn starting_at(mut self, index: usize) -> Self {
        self.start_index = index;
        self
    }

    /// Run to a terminal status
    ///
    /// Returns the status the runner left the execution in. Persistence
    /// failures terminate the run as Failed.
    pub async fn run(self) -> ExecutionStatus {
        info!(
            execution_id = %self.execution_id,
            runbook_id = %self.runbook.id,
            start_index = self.start_index,
            "Step runner started"
        );

        let status = match self.drive().await {
            Ok(status) => status,
            Err(RunbookError::Cancelled) | Err(RunbookError::NotFound(_)) => {
                debug!(execution_id = %self.execution_id, "Execution no longer active, runner stopping");
                ExecutionStatus::Aborted
            }
            Err(e) => self.fail_with(e).await,
        };

        info!(
            execution_id = %self.execution_id,
            status = ?status,
            "Step runner finished"
        );
        status
    }

    async fn drive(&self) -> RunbookResult<ExecutionStatus> {
        for step in self.runbook.steps.iter().skip(self.start_index) {
            if let Some(status) = self.checkpoint().await? {
                return Ok(status);
            }

            let current = self.step_status(&step.id)?;
            if !is_runnable(current) {
                debug!(
                    execution_id = %self.execution_id,
                    step_id = %step.id,
                    status = ?current,
                    "Skipping step"
                );
                continue;
            }

            if let Some(status) = self.run_step(step).await? {
                return Ok(status);
            }
        }

        // Steps an operator retried while the pass was running
        loop {
            if let Some(status) = self.checkpoint().await? {
                return Ok(status);
            }

            let snapshot = self.snapshot()?;
            let Some(step_id) = StateManager::pending_retries(&snapshot).into_iter().next() else {
                match self.finalize().await? {
                    Some(status) => return Ok(status),
                    None => continue,
                }
            };
            let step = self
                .runbook
                .steps
                .iter()
                .find(|s| s.id == step_id)
                .ok_or_else(|| {
                    RunbookError::Invalid(format!("Step {} is not part of the runbook", step_id))
                })?;

            info!(
                execution_id = %self.execution_id,
                step_id = %step.id,
                "Re-running step retried by operator"
            );
            if let Some(status) = self.run_step(step).await? {
                return Ok(status);
            }
        }
    }

    /// Wait out pauses; `Some` means the loop must stop with that status
    async fn checkpoint(&self) -> RunbookResult<Option<ExecutionStatus>> {
        loop {
            if self.cancellation.is_cancelled() {
                return self.on_cancelled().await.map(Some);
            }

            let status = self.ctx.registry.status(&self.execution_id).ok_or_else(|| {
                RunbookError::NotFound(format!("Execution not found: {}", self.execution_id))
            })?;

            match status {
                ExecutionStatus::Paused => {
                    debug!(execution_id = %self.execution_id, "Execution paused, waiting");
                    tokio::select! {
                        _ = self.cancellation.cancelled() => {}
                        _ = tokio::time::sleep(self.ctx.pause_poll_interval) => {}
                    }
                }
                ExecutionStatus::Aborting | ExecutionStatus::Aborted => {
                    return Ok(Some(ExecutionStatus::Aborted))
                }
                status if status.is_terminal() => return Ok(Some(status)),
                _ => return Ok(None),
            }
        }
    }

    async fn run_step(&self, step: &RunbookStep) -> RunbookResult<Option<ExecutionStatus>> {
        if step.has_approval_gate {
            if let Some(status) = self.await_approval(step).await? {
                return Ok(Some(status));
            }
            // The execution may have been paused or aborted while waiting
            if let Some(status) = self.checkpoint().await? {
                return Ok(Some(status));
            }
        }

        loop {
            let (_, snapshot) = self.transition(|e| StateManager::start_step(e, &step.id))?;
            self.save(&snapshot).await?;
            debug!(
                execution_id = %self.execution_id,
                step_id = %step.id,
                step_name = %step.name,
                "Executing step"
            );

            let outcome = self.attempt(step, &snapshot).await;

            if outcome.success {
                let has_compensation = outcome.compensation.is_some();
                let compensation = outcome.compensation.map(|mut compensation| {
                    compensation.for_step_id = step.id.clone();
                    compensation
                });
                let output = outcome.output.clone();

                // Completion and its compensation land together, and are still
                // accepted while an abort waits for this step to return.
                let completed = try_modify(self.ctx.registry.as_ref(), &self.execution_id, |e| {
                    if e.status == ExecutionStatus::Aborted {
                        return Err(RunbookError::Cancelled);
                    }
                    if let Some(compensation) = compensation {
                        debug!(
                            execution_id = %e.id,
                            step_id = %step.id,
                            compensation_id = %compensation.id,
                            "Registering compensation"
                        );
                        e.compensation_steps.push(compensation);
                    }
                    StateManager::complete_step(e, &step.id, output)
                });
                let (_, snapshot) = match completed {
                    Ok(completed) => completed,
                    Err(e) => {
                        if has_compensation {
                            error!(
                                execution_id = %self.execution_id,
                                step_id = %step.id,
                                "Step finished after the abort completed, its compensation was not recorded"
                            );
                        }
                        return Err(e);
                    }
                };
                self.save(&snapshot).await?;
                info!(
                    execution_id = %self.execution_id,
                    step_id = %step.id,
                    "Step completed"
                );
                self.step_completed(step, true, outcome.output, None);
                return Ok(None);
            }

            let error = outcome
                .error
                .unwrap_or_else(|| format!("Step '{}' failed", step.name));
            let retry_allowed = snapshot.automatic_retries
                && snapshot.step(&step.id).is_some_and(|s| s.can_retry());

            if retry_allowed {
                let message = error.clone();
                let (attempt, snapshot) =
                    self.transition(|e| StateManager::schedule_retry(e, &step.id, message))?;
                self.save(&snapshot).await?;

                let delay = self.ctx.retry_policy.delay_for_attempt(attempt);
                warn!(
                    execution_id = %self.execution_id,
                    step_id = %step.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Step failed, retrying"
                );

                tokio::select! {
                    _ = self.cancellation.cancelled() => {
                        return self.on_cancelled().await.map(Some);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.ctx.registry.status(&self.execution_id) {
                    None | Some(ExecutionStatus::Aborting) | Some(ExecutionStatus::Aborted) => {
                        return Ok(Some(ExecutionStatus::Aborted))
                    }
                    _ => continue,
                }
            }

            let message = error.clone();
            let (_, snapshot) = self.transition(|e| StateManager::fail_step(e, &step.id, message))?;
            self.save(&snapshot).await?;
            warn!(
                execution_id = %self.execution_id,
                step_id = %step.id,
                error = %error,
                "Step failed"
            );
            self.step_completed(step, false, outcome.output, Some(error));

            if !snapshot.continue_on_error {
                return self.stop_failed().await.map(Some);
            }
            return Ok(None);
        }
    }

    async fn attempt(&self, step: &RunbookStep, snapshot: &RunbookExecution) -> StepOutcome {
        if snapshot.is_dry_run {
            tokio::select! {
                _ = self.cancellation.cancelled() => {}
                _ = tokio::time::sleep(self.ctx.dry_run_step_delay) => {}
            }
            return StepOutcome::succeeded(format!("[DRY RUN] Simulated step '{}'", step.name));
        }

        let call = self.ctx.step_executor.execute_step(step, &snapshot.parameters);
        let result = match step.timeout() {
            Some(limit) => tokio::time::timeout(limit, call).await.unwrap_or_else(|_| {
                Err(RunbookError::CollaboratorFailure(format!(
                    "Step '{}' timed out after {}s",
                    step.name,
                    limit.as_secs()
                )))
            }),
            None => call.await,
        };

        result.unwrap_or_else(|e| StepOutcome::failed(e.to_string()))
    }

    async fn await_approval(&self, step: &RunbookStep) -> RunbookResult<Option<ExecutionStatus>> {
        let snapshot = self.snapshot()?;
        let gate = self
            .ctx
            .gates
            .approval_gate_for(step, &snapshot.safety_analysis);
        let Some(request) = gate.approval_request(&self.execution_id) else {
            return Ok(None);
        };

        info!(
            execution_id = %self.execution_id,
            step_id = %step.id,
            request_id = %request.id,
            approval_type = ?request.approval_type,
            "Approval required"
        );
        self.ctx.events.publish(RunbookEvent::ApprovalRequired {
            execution_id: self.execution_id.clone(),
            request: request.clone(),
        });

        let wait = self
            .ctx
            .approvals
            .wait_for_approval(&request, self.cancellation.child_token());
        let decision = tokio::select! {
            _ = self.cancellation.cancelled() => {
                return self.on_cancelled().await.map(Some);
            }
            decision = tokio::time::timeout(request.remaining(), wait) => decision,
        };

        let reason = match decision {
            Ok(Ok(response)) if response.approved => {
                info!(
                    execution_id = %self.execution_id,
                    step_id = %step.id,
                    approved_by = ?response.approved_by,
                    "Approval granted"
                );
                return Ok(None);
            }
            Ok(Ok(response)) => response
                .reason
                .unwrap_or_else(|| RunbookError::ApprovalDenied(step.name.clone()).to_string()),
            Ok(Err(RunbookError::Cancelled)) => return self.on_cancelled().await.map(Some),
            Ok(Err(e)) => format!("Approval request failed: {}", e),
            Err(_) => RunbookError::ApprovalExpired(step.id.clone()).to_string(),
        };

        warn!(
            execution_id = %self.execution_id,
            step_id = %step.id,
            reason = %reason,
            "Step blocked by approval gate"
        );

        let blocked_reason = reason.clone();
        let (previous, snapshot) = self.transition(|e| {
            let previous = e.status;
            StateManager::block_step(e, &step.id, blocked_reason)?;
            Ok(previous)
        })?;
        self.save(&snapshot).await?;
        self.step_completed(step, false, None, Some(reason));
        self.ctx
            .events
            .state_changed(&self.execution_id, previous, ExecutionStatus::Blocked);
        self.ctx.registry.deregister(&self.execution_id);
        Ok(Some(ExecutionStatus::Blocked))
    }

    async fn stop_failed(&self) -> RunbookResult<ExecutionStatus> {
        let (previous, snapshot) = self.transition(|e| {
            let previous = e.status;
            StateManager::fail_execution(e);
            Ok(previous)
        })?;
        self.save(&snapshot).await?;
        self.ctx
            .events
            .state_changed(&self.execution_id, previous, ExecutionStatus::Failed);
        self.ctx.registry.deregister(&self.execution_id);
        info!(execution_id = %self.execution_id, "Execution stopped on failed step");
        Ok(ExecutionStatus::Failed)
    }

    /// Finish the run; `None` when a retry slipped in and the sweep must go on
    async fn finalize(&self) -> RunbookResult<Option<ExecutionStatus>> {
        let (finished, snapshot) = self.transition(|e| {
            if !StateManager::pending_retries(e).is_empty() {
                return Ok(None);
            }
            let previous = e.status;
            Ok(Some((previous, StateManager::finalize(e))))
        })?;
        let Some((previous, status)) = finished else {
            return Ok(None);
        };
        self.save(&snapshot).await?;
        self.ctx
            .events
            .state_changed(&self.execution_id, previous, status);
        self.ctx.registry.deregister(&self.execution_id);
        info!(
            execution_id = %self.execution_id,
            status = ?status,
            "Execution finished"
        );
        Ok(Some(status))
    }

    /// Abort on behalf of a cancelled token unless the controller already is
    async fn on_cancelled(&self) -> RunbookResult<ExecutionStatus> {
        let begun = try_modify(self.ctx.registry.as_ref(), &self.execution_id, |e| {
            StateManager::begin_abort(e, Some("Execution cancelled".to_string()))
        });
        let Ok((previous, snapshot)) = begun else {
            return Ok(ExecutionStatus::Aborted);
        };

        warn!(execution_id = %self.execution_id, "Execution cancelled, aborting");
        self.save_logged(&snapshot).await;
        self.ctx
            .events
            .state_changed(&self.execution_id, previous, ExecutionStatus::Aborting);

        if let Ok((_, snapshot)) = try_modify(
            self.ctx.registry.as_ref(),
            &self.execution_id,
            StateManager::complete_abort,
        ) {
            self.save_logged(&snapshot).await;
            self.ctx.events.state_changed(
                &self.execution_id,
                ExecutionStatus::Aborting,
                ExecutionStatus::Aborted,
            );
        }
        self.ctx.registry.deregister(&self.execution_id);
        Ok(ExecutionStatus::Aborted)
    }

    /// Terminate the run as Failed after an unexpected error
    async fn fail_with(&self, err: RunbookError) -> ExecutionStatus {
        error!(
            execution_id = %self.execution_id,
            error = %err,
            "Step runner failed, marking execution as failed"
        );

        let failed = self.transition(|e| {
            if e.status.is_terminal() {
                return Ok(None);
            }
            let previous = e.status;
            StateManager::fail_execution(e);
            Ok(Some(previous))
        });

        match failed {
            Ok((previous, snapshot)) => {
                self.save_logged(&snapshot).await;
                if let Some(previous) = previous {
                    self.ctx.events.state_changed(
                        &self.execution_id,
                        previous,
                        ExecutionStatus::Failed,
                    );
                }
                self.ctx.registry.deregister(&self.execution_id);
                snapshot.status
            }
            Err(_) => self
                .ctx
                .registry
                .status(&self.execution_id)
                .unwrap_or(ExecutionStatus::Aborted),
        }
    }

    fn transition<T>(
        &self,
        mutate: impl FnOnce(&mut RunbookExecution) -> RunbookResult<T>,
    ) -> RunbookResult<(T, RunbookExecution)> {
        try_modify(self.ctx.registry.as_ref(), &self.execution_id, |e| {
            ensure_active(e)?;
            mutate(e)
        })
    }

    fn snapshot(&self) -> RunbookResult<RunbookExecution> {
        self.ctx.registry.get(&self.execution_id).ok_or_else(|| {
            RunbookError::NotFound(format!("Execution not found: {}", self.execution_id))
        })
    }

    fn step_status(&self, step_id: &str) -> RunbookResult<StepStatus> {
        self.snapshot()?
            .step(step_id)
            .map(|s| s.status)
            .ok_or_else(|| {
                RunbookError::NotFound(format!(
                    "Step {} not found in execution {}",
                    step_id, self.execution_id
                ))
            })
    }

    async fn save(&self, execution: &RunbookExecution) -> RunbookResult<()> {
        self.ctx.repository.save_execution(execution).await.map_err(|e| match e {
            RunbookError::Persistence(_) => e,
            other => RunbookError::Persistence(other.to_string()),
        })
    }

    async fn save_logged(&self, execution: &RunbookExecution) {
        if let Err(e) = self.ctx.repository.save_execution(execution).await {
            error!(
                execution_id = %self.execution_id,
                error = %e,
                "Failed to persist execution"
            );
        }
    }

    fn step_completed(
        &self,
        step: &RunbookStep,
        success: bool,
        output: Option<String>,
        error: Option<String>,
    ) {
        self.ctx.events.publish(RunbookEvent::StepCompleted {
            execution_id: self.execution_id.clone(),
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            success,
            output,
            error,
        });
    }
}
