//! Shared fixtures for unit tests

use crate::approval::{ApprovalRequest, ApprovalResponse, ApprovalService};
use crate::error::{RunbookError, RunbookResult};
use crate::executor::{CompensationExecutor, StepExecutor, StepOutcome};
use crate::models::{
    CompensationStep, ExecutionStatus, RunbookDefinition, RunbookExecution, RunbookStep,
    StepExecution, TriggerInfo, TriggerType,
};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
use crate::safety::SafetyAnalyzer;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runbook with `step_count` harmless steps named `step-1..=n`
pub(crate) fn runbook_fixture(step_count: usize) -> RunbookDefinition {
    (1..=step_count).fold(RunbookDefinition::new("rb-1", "Restart web tier"), |rb, i| {
        rb.with_step(
            RunbookStep::new(format!("step-{}", i), format!("Step {}", i))
                .with_command(format!("echo {}", i)),
        )
    })
}

/// Running execution of [`runbook_fixture`]
pub(crate) fn execution_fixture(id: &str, step_count: usize) -> RunbookExecution {
    execution_for(id, &runbook_fixture(step_count))
}

/// Running execution for an arbitrary runbook
pub(crate) fn execution_for(id: &str, runbook: &RunbookDefinition) -> RunbookExecution {
    RunbookExecution {
        id: id.to_string(),
        runbook_id: runbook.id.clone(),
        runbook_name: runbook.name.clone(),
        status: ExecutionStatus::Running,
        trigger: TriggerInfo {
            reason: "test".to_string(),
            triggered_by: "tester".to_string(),
            trigger_type: TriggerType::Manual,
        },
        started_at: Utc::now(),
        paused_at: None,
        pause_reason: None,
        aborted_at: None,
        abort_reason: None,
        completed_at: None,
        is_dry_run: false,
        continue_on_error: false,
        automatic_retries: true,
        parameters: HashMap::new(),
        step_executions: runbook.steps.iter().map(StepExecution::for_step).collect(),
        compensation_steps: Vec::new(),
        safety_analysis: SafetyAnalyzer::new().analyze(runbook),
    }
}

/// Step executor returning scripted outcomes per step, success by default
#[derive(Default)]
pub(crate) struct ScriptedStepExecutor {
    outcomes: Mutex<HashMap<String, VecDeque<StepOutcome>>>,
    calls: Mutex<Vec<String>>,
    delay: Option<Duration>,
}

impl ScriptedStepExecutor {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every call
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue outcomes for a step; once drained the step succeeds
    pub(crate) fn script(self, step_id: &str, outcomes: Vec<StepOutcome>) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .insert(step_id.to_string(), outcomes.into());
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepExecutor for ScriptedStepExecutor {
    async fn execute_step(
        &self,
        step: &RunbookStep,
        _parameters: &HashMap<String, String>,
    ) -> RunbookResult<StepOutcome> {
        self.calls.lock().unwrap().push(step.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&step.id)
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or_else(|| StepOutcome::succeeded(format!("{} done", step.id))))
    }
}

/// Compensation executor recording the step ids it was asked to undo
#[derive(Default)]
pub(crate) struct RecordingCompensationExecutor {
    pub(crate) executed: Mutex<Vec<String>>,
}

#[async_trait]
impl CompensationExecutor for RecordingCompensationExecutor {
    async fn execute_compensation(&self, compensation: &CompensationStep) -> RunbookResult<bool> {
        self.executed
            .lock()
            .unwrap()
            .push(compensation.for_step_id.clone());
        Ok(true)
    }
}

/// Approval service answering every request the same way
pub(crate) struct FixedApprovalService {
    response: Option<ApprovalResponse>,
    delay: Option<Duration>,
    pub(crate) requests: Mutex<Vec<ApprovalRequest>>,
}

impl FixedApprovalService {
    pub(crate) fn approving() -> Self {
        Self {
            response: Some(ApprovalResponse::approved("approver")),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Approves once `delay` has passed
    pub(crate) fn approving_after(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::approving()
        }
    }

    pub(crate) fn denying(reason: &str) -> Self {
        Self {
            response: Some(ApprovalResponse::denied(reason)),
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Never answers; waits for cancellation
    pub(crate) fn silent() -> Self {
        Self {
            response: None,
            delay: None,
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ApprovalService for FixedApprovalService {
    async fn wait_for_approval(
        &self,
        request: &ApprovalRequest,
        cancellation: CancellationToken,
    ) -> RunbookResult<ApprovalResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancellation.cancelled() => return Err(RunbookError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        match &self.response {
            Some(response) => Ok(response.clone()),
            None => {
                cancellation.cancelled().await;
                Err(RunbookError::Cancelled)
            }
        }
    }
}

/// Repository whose saves fail once `fail_after` saves succeeded
pub(crate) struct FlakyRepository {
    inner: InMemoryExecutionRepository,
    saves: AtomicUsize,
    fail_after: usize,
}

impl FlakyRepository {
    pub(crate) fn failing_after(fail_after: usize) -> Self {
        Self {
            inner: InMemoryExecutionRepository::new(),
            saves: AtomicUsize::new(0),
            fail_after,
        }
    }
}

#[async_trait]
impl ExecutionRepository for FlakyRepository {
    async fn save_execution(&self, execution: &RunbookExecution) -> RunbookResult<()> {
        if self.saves.fetch_add(1, Ordering::SeqCst) >= self.fail_after {
            return Err(RunbookError::Persistence("disk full".to_string()));
        }
        self.inner.save_execution(execution).await
    }

    async fn get_execution(&self, execution_id: &str) -> RunbookResult<Option<RunbookExecution>> {
        self.inner.get_execution(execution_id).await
    }
}
