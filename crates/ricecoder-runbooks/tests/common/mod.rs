//! Collaborator doubles shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use ricecoder_runbooks::{
    ApprovalRequest, ApprovalResponse, ApprovalService, CompensationExecutor, CompensationStep,
    ExecutionController, ExecutionRepository, InMemoryExecutionRepository, RunbookConfig,
    RunbookExecution, RunbookResult, RunbookStep, StepExecutor, StepOutcome,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Route engine logs to the test output; repeated calls are ignored
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Config with millisecond delays so tests stay fast
pub fn fast_config() -> RunbookConfig {
    RunbookConfig {
        pause_poll_interval_ms: 5,
        dry_run_step_delay_ms: 1,
        retry_base_delay_ms: 1,
        max_retry_delay_ms: 5,
        ..RunbookConfig::default()
    }
}

/// Step executor with per-step scripted outcomes
#[derive(Default)]
pub struct MockStepExecutor {
    outcomes: Mutex<HashMap<String, VecDeque<StepOutcome>>>,
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<Vec<String>>,
}

impl MockStepExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn outcome(self, step_id: &str, outcome: StepOutcome) -> Self {
        self.outcomes
            .lock()
            .unwrap()
            .entry(step_id.to_string())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn delay(self, step_id: &str, delay: Duration) -> Self {
        self.delays
            .lock()
            .unwrap()
            .insert(step_id.to_string(), delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl StepExecutor for MockStepExecutor {
    async fn execute_step(
        &self,
        step: &RunbookStep,
        _parameters: &HashMap<String, String>,
    ) -> RunbookResult<StepOutcome> {
        self.calls.lock().unwrap().push(step.id.clone());
        let delay = self.delays.lock().unwrap().get(&step.id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self
            .outcomes
            .lock()
            .unwrap()
            .get_mut(&step.id)
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or_else(|| StepOutcome::succeeded(format!("{} ok", step.id))))
    }
}

/// Compensation executor recording the step each compensation undoes, in order
#[derive(Default)]
pub struct RecordingCompensations {
    executed: Mutex<Vec<String>>,
}

impl RecordingCompensations {
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompensationExecutor for RecordingCompensations {
    async fn execute_compensation(&self, compensation: &CompensationStep) -> RunbookResult<bool> {
        self.executed
            .lock()
            .unwrap()
            .push(compensation.for_step_id.clone());
        Ok(true)
    }
}

/// Approval service that denies everything with a fixed reason
pub struct DenyingApprovals {
    pub reason: String,
}

#[async_trait]
impl ApprovalService for DenyingApprovals {
    async fn wait_for_approval(
        &self,
        _request: &ApprovalRequest,
        _cancellation: CancellationToken,
    ) -> RunbookResult<ApprovalResponse> {
        Ok(ApprovalResponse::denied(self.reason.clone()))
    }
}

/// Repository counting saves
#[derive(Default)]
pub struct CountingRepository {
    inner: InMemoryExecutionRepository,
    saves: AtomicUsize,
}

impl CountingRepository {
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionRepository for CountingRepository {
    async fn save_execution(&self, execution: &RunbookExecution) -> RunbookResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        self.inner.save_execution(execution).await
    }

    async fn get_execution(&self, execution_id: &str) -> RunbookResult<Option<RunbookExecution>> {
        self.inner.get_execution(execution_id).await
    }
}

/// Controller over the given executor with default collaborators
pub fn controller_with(
    executor: Arc<MockStepExecutor>,
    compensations: Arc<RecordingCompensations>,
) -> ExecutionController {
    ExecutionController::builder(executor, compensations)
        .config(fast_config())
        .build()
        .unwrap()
}

/// Poll until `check` holds or the attempts run out
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
