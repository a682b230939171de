//! Execution controller
//!
//! Entry point of the engine. The controller decides whether a runbook may
//! start, creates and registers executions, spawns one [`StepRunner`] per
//! execution and exposes the operator operations (pause, resume, abort, retry).
//!
//! Operator operations never fail with `Err` for expected conditions; they
//! return result records carrying `success` and a message.

use crate::approval::{ApprovalQueue, ApprovalService};
use crate::compensation::CompensationManager;
use crate::config::RunbookConfig;
use crate::details::ExecutionDetails;
use crate::dry_run::{DryRunResult, DryRunSimulator};
use crate::error::{RunbookError, RunbookResult};
use crate::events::{EventBus, RunbookEvent};
use crate::executor::{CompensationExecutor, StepExecutor};
use crate::models::{
    AbortOptions, AbortResult, ExecutionStatus, OperationResult, RollbackOptions, RollbackResult,
    RunbookDefinition, RunbookExecution, RunbookSafetyAnalysis, StartOptions, StartResult,
    StepExecution, TriggerInfo,
};
use crate::parser::RunbookParser;
use crate::registry::{try_modify, ExecutionRegistry, InMemoryExecutionRegistry};
use crate::repository::{ExecutionRepository, InMemoryExecutionRepository};
use crate::runner::{RunnerContext, StepRunner};
use crate::safety::SafetyAnalyzer;
use crate::state::StateManager;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Builds an [`ExecutionController`]
pub struct ExecutionControllerBuilder {
    step_executor: Arc<dyn StepExecutor>,
    compensation_executor: Arc<dyn CompensationExecutor>,
    registry: Option<Arc<dyn ExecutionRegistry>>,
    repository: Option<Arc<dyn ExecutionRepository>>,
    approvals: Option<Arc<dyn ApprovalService>>,
    config: RunbookConfig,
}

impl ExecutionControllerBuilder {
    /// Use a custom registry
    pub fn registry(mut self, registry: Arc<dyn ExecutionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use a custom repository (in-memory by default)
    pub fn repository(mut self, repository: Arc<dyn ExecutionRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Use a custom approval service (an in-process [`ApprovalQueue`] by default)
    pub fn approvals(mut self, approvals: Arc<dyn ApprovalService>) -> Self {
        self.approvals = Some(approvals);
        self
    }

    /// Use a configuration
    pub fn config(mut self, config: RunbookConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and build the controller
    pub fn build(self) -> RunbookResult<ExecutionController> {
        self.config.validate()?;

        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(InMemoryExecutionRegistry::new()));
        let repository = self
            .repository
            .unwrap_or_else(|| Arc::new(InMemoryExecutionRepository::new()));
        let (approvals, approval_queue) = match self.approvals {
            Some(approvals) => (approvals, None),
            None => {
                let queue = Arc::new(ApprovalQueue::new());
                let approvals: Arc<dyn ApprovalService> = queue.clone();
                (approvals, Some(queue))
            }
        };

        let events = EventBus::with_capacity(self.config.event_channel_capacity);
        let compensations = CompensationManager::new(
            registry.clone(),
            repository.clone(),
            self.compensation_executor,
            events.clone(),
        );

        let ctx = Arc::new(RunnerContext {
            registry,
            repository,
            step_executor: self.step_executor,
            approvals,
            compensations,
            events,
            gates: self.config.gate_builder(),
            retry_policy: self.config.retry_policy(),
            pause_poll_interval: self.config.pause_poll_interval(),
            dry_run_step_delay: self.config.dry_run_step_delay(),
        });

        let analyzer = self.config.analyzer();
        let simulator = DryRunSimulator::new(analyzer.clone(), self.config.gate_builder())
            .with_default_estimate(self.config.default_step_timeout());

        Ok(ExecutionController {
            ctx,
            analyzer,
            simulator,
            approval_queue,
            abort_grace_period: self.config.abort_grace_period(),
            runbooks: Arc::new(DashMap::new()),
            tokens: Arc::new(DashMap::new()),
            runs: Arc::new(RwLock::new(HashMap::new())),
            rollbacks: Arc::new(RwLock::new(HashMap::new())),
        })
    }
}

/// Starts and controls runbook executions
pub struct ExecutionController {
    ctx: Arc<RunnerContext>,
    analyzer: SafetyAnalyzer,
    simulator: DryRunSimulator,
    approval_queue: Option<Arc<ApprovalQueue>>,
    abort_grace_period: Duration,
    /// Definitions kept for executions that may still be retried
    runbooks: Arc<DashMap<String, Arc<RunbookDefinition>>>,
    /// Cancellation tokens of running executions
    tokens: Arc<DashMap<String, CancellationToken>>,
    /// Runner tasks indexed by execution id
    runs: Arc<RwLock<HashMap<String, JoinHandle<ExecutionStatus>>>>,
    /// Abort-triggered rollback tasks indexed by execution id
    rollbacks: Arc<RwLock<HashMap<String, JoinHandle<RollbackResult>>>>,
}

impl ExecutionController {
    /// Start building a controller around the two execution collaborators
    pub fn builder(
        step_executor: Arc<dyn StepExecutor>,
        compensation_executor: Arc<dyn CompensationExecutor>,
    ) -> ExecutionControllerBuilder {
        ExecutionControllerBuilder {
            step_executor,
            compensation_executor,
            registry: None,
            repository: None,
            approvals: None,
            config: RunbookConfig::default(),
        }
    }

    /// The built-in approval queue, when no custom approval service was set
    pub fn approval_queue(&self) -> Option<Arc<ApprovalQueue>> {
        self.approval_queue.clone()
    }

    /// Analyze a runbook without running it
    pub fn analyze(&self, runbook: &RunbookDefinition) -> RunbookSafetyAnalysis {
        self.analyzer.analyze(runbook)
    }

    /// Simulate a runbook; nothing is persisted
    pub fn dry_run(&self, runbook: &RunbookDefinition) -> DryRunResult {
        self.simulator.simulate(runbook)
    }

    /// Start a runbook
    ///
    /// Returns as soon as the execution is persisted and registered; the steps
    /// run in a background task. Runbooks that are not safe to run unattended
    /// are refused with `Blocked` unless the start is a manual trigger.
    pub async fn start(
        &self,
        runbook: &RunbookDefinition,
        options: StartOptions,
    ) -> RunbookResult<StartResult> {
        RunbookParser::validate(runbook)?;

        let analysis = self.analyzer.analyze(runbook);
        if !analysis.can_run_automatically && !options.manual_trigger {
            warn!(
                runbook_id = %runbook.id,
                overall_risk = ?analysis.overall_risk,
                dangerous_steps = analysis.dangerous_steps.len(),
                "Automatic start blocked by safety analysis"
            );
            let message = format!(
                "Runbook '{}' cannot run automatically: {:?} risk, {} dangerous step(s), {} approval(s) required",
                runbook.name,
                analysis.overall_risk,
                analysis.dangerous_steps.len(),
                analysis.required_approvals.len()
            );
            return Ok(StartResult {
                execution_id: None,
                status: ExecutionStatus::Blocked,
                analysis,
                message,
            });
        }

        let execution = RunbookExecution {
            id: uuid::Uuid::new_v4().to_string(),
            runbook_id: runbook.id.clone(),
            runbook_name: runbook.name.clone(),
            status: ExecutionStatus::Running,
            trigger: TriggerInfo {
                reason: options.reason,
                triggered_by: options.triggered_by,
                trigger_type: options.trigger_type,
            },
            started_at: Utc::now(),
            paused_at: None,
            pause_reason: None,
            aborted_at: None,
            abort_reason: None,
            completed_at: None,
            is_dry_run: options.dry_run,
            continue_on_error: options.continue_on_error,
            automatic_retries: options.automatic_retries,
            parameters: options.parameters,
            step_executions: runbook.steps.iter().map(StepExecution::for_step).collect(),
            compensation_steps: Vec::new(),
            safety_analysis: analysis.clone(),
        };
        let execution_id = execution.id.clone();

        self.ctx.repository.save_execution(&execution).await?;
        self.ctx.registry.register(execution);
        self.ctx.events.state_changed(
            &execution_id,
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
        );

        info!(
            execution_id = %execution_id,
            runbook_id = %runbook.id,
            dry_run = options.dry_run,
            "Runbook execution started"
        );

        let token = options
            .cancellation
            .map(|parent| parent.child_token())
            .unwrap_or_default();
        let definition = Arc::new(runbook.clone());
        let mut runs = self.runs.write().await;
        runs.retain(|_, handle| !handle.is_finished());
        self.launch(&mut runs, &execution_id, definition, token, 0);

        Ok(StartResult {
            execution_id: Some(execution_id),
            status: ExecutionStatus::Running,
            analysis,
            message: format!("Runbook '{}' started", runbook.name),
        })
    }

    /// Pause a running execution at the next step boundary
    pub async fn pause(&self, execution_id: &str, reason: Option<String>) -> OperationResult {
        let paused = try_modify(self.ctx.registry.as_ref(), execution_id, |e| {
            StateManager::pause_execution(e, reason)
        });

        match paused {
            Ok((_, snapshot)) => {
                self.ctx.events.state_changed(
                    execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::Paused,
                );
                info!(execution_id = %execution_id, "Execution paused");
                self.persisted(&snapshot, "Execution paused").await
            }
            Err(e) => self.rejected(execution_id, "pause", e),
        }
    }

    /// Resume a paused execution
    pub async fn resume(&self, execution_id: &str) -> OperationResult {
        match try_modify(
            self.ctx.registry.as_ref(),
            execution_id,
            StateManager::resume_execution,
        ) {
            Ok((_, snapshot)) => {
                self.ctx.events.state_changed(
                    execution_id,
                    ExecutionStatus::Paused,
                    ExecutionStatus::Running,
                );
                info!(execution_id = %execution_id, "Execution resumed");
                self.persisted(&snapshot, "Execution resumed").await
            }
            Err(e) => self.rejected(execution_id, "resume", e),
        }
    }

    /// Abort an execution
    ///
    /// The runner is cancelled and given up to the configured grace period to
    /// return from a step already handed to the executor, so that step's
    /// result and compensation are part of the abort. Compensation rollback,
    /// when requested and compensations exist, runs in a background task
    /// awaitable with [`ExecutionController::wait_for_rollback`].
    pub async fn abort(&self, execution_id: &str, options: AbortOptions) -> AbortResult {
        let reason = options
            .reason
            .clone()
            .unwrap_or_else(|| "Aborted by operator".to_string());

        let (previous, snapshot) = match try_modify(
            self.ctx.registry.as_ref(),
            execution_id,
            |e| StateManager::begin_abort(e, Some(reason.clone())),
        ) {
            Ok(aborting) => aborting,
            Err(e) => {
                let rejected = self.rejected(execution_id, "abort", e);
                return AbortResult {
                    success: false,
                    compensation_triggered: false,
                    message: rejected.message,
                };
            }
        };

        let mut persistence_errors = Vec::new();
        if let Err(e) = self.ctx.repository.save_execution(&snapshot).await {
            persistence_errors.push(e.to_string());
        }
        self.ctx
            .events
            .state_changed(execution_id, previous, ExecutionStatus::Aborting);

        if let Some((_, token)) = self.tokens.remove(execution_id) {
            token.cancel();
        }
        self.settle_runner(execution_id).await;

        // Steps that returned during the grace period may have added compensations
        let snapshot = self.ctx.registry.get(execution_id).unwrap_or(snapshot);
        let compensation_triggered =
            options.run_compensation && !snapshot.compensation_steps.is_empty();
        if compensation_triggered {
            let manager = self.ctx.compensations.clone();
            let rollback_options = RollbackOptions {
                cancellation: options.cancellation.clone(),
                ..RollbackOptions::default()
            };
            let execution = snapshot.clone();
            let handle = tokio::spawn(async move {
                manager
                    .rollback_execution(&execution, rollback_options)
                    .await
            });
            self.rollbacks
                .write()
                .await
                .insert(execution_id.to_string(), handle);
            info!(
                execution_id = %execution_id,
                compensations = snapshot.compensation_steps.len(),
                "Compensation rollback launched"
            );
        }

        match try_modify(
            self.ctx.registry.as_ref(),
            execution_id,
            StateManager::complete_abort,
        ) {
            Ok((_, aborted)) => {
                if let Err(e) = self.ctx.repository.save_execution(&aborted).await {
                    persistence_errors.push(e.to_string());
                }
                self.ctx.events.state_changed(
                    execution_id,
                    ExecutionStatus::Aborting,
                    ExecutionStatus::Aborted,
                );
            }
            Err(e) => warn!(execution_id = %execution_id, error = %e, "Abort completed elsewhere"),
        }
        self.ctx.registry.deregister(execution_id);

        info!(execution_id = %execution_id, reason = %reason, "Execution aborted");

        let mut message = if compensation_triggered {
            "Execution aborted, compensation rollback started".to_string()
        } else {
            "Execution aborted".to_string()
        };
        if !persistence_errors.is_empty() {
            error!(
                execution_id = %execution_id,
                errors = ?persistence_errors,
                "Failed to persist aborted execution"
            );
            message = format!("{}; persistence failed: {}", message, persistence_errors.join("; "));
        }

        AbortResult {
            success: true,
            compensation_triggered,
            message,
        }
    }

    /// Retry a failed step
    ///
    /// Active executions re-run the step before they finish. Halted executions
    /// (Failed or CompletedWithErrors) are resumed from the retried step when
    /// this controller started them.
    pub async fn retry_step(&self, execution_id: &str, step_id: &str) -> OperationResult {
        if self.ctx.registry.contains(execution_id) {
            return match try_modify(self.ctx.registry.as_ref(), execution_id, |e| {
                StateManager::request_retry(e, step_id)
            }) {
                Ok((attempt, snapshot)) => {
                    info!(
                        execution_id = %execution_id,
                        step_id = %step_id,
                        attempt,
                        "Step scheduled for retry"
                    );
                    self.persisted(
                        &snapshot,
                        &format!("Step {} scheduled for retry (attempt {})", step_id, attempt),
                    )
                    .await
                }
                Err(e) => self.rejected(execution_id, "retry step", e),
            };
        }

        self.resume_halted(execution_id, step_id).await
    }

    async fn resume_halted(&self, execution_id: &str, step_id: &str) -> OperationResult {
        // Held until the new runner is recorded so concurrent retries cannot both relaunch
        let mut runs = self.runs.write().await;
        if self.ctx.registry.contains(execution_id) {
            return OperationResult::failed(format!(
                "Execution {} was resumed concurrently",
                execution_id
            ));
        }

        let mut execution = match self.ctx.repository.get_execution(execution_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                return OperationResult::failed(format!("Execution not found: {}", execution_id))
            }
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        if !matches!(
            execution.status,
            ExecutionStatus::Failed | ExecutionStatus::CompletedWithErrors
        ) {
            return OperationResult::failed(format!(
                "Execution {} is {:?}; only failed executions can be resumed by a retry",
                execution_id, execution.status
            ));
        }

        let Some(definition) = self.runbooks.get(execution_id).map(|r| Arc::clone(r.value()))
        else {
            return OperationResult::failed(format!(
                "Runbook definition for execution {} is not available; start a new execution instead",
                execution_id
            ));
        };

        let attempt = match StateManager::request_retry(&mut execution, step_id) {
            Ok(attempt) => attempt,
            Err(e) => return OperationResult::failed(e.to_string()),
        };
        let Some(index) = execution.step_index(step_id) else {
            return OperationResult::failed(format!("Step not found: {}", step_id));
        };
        let previous = match StateManager::reopen(&mut execution) {
            Ok(previous) => previous,
            Err(e) => return OperationResult::failed(e.to_string()),
        };

        if let Some(handle) = runs.remove(execution_id) {
            if let Err(e) = handle.await {
                warn!(execution_id = %execution_id, error = %e, "Previous runner ended abnormally");
            }
        }

        if let Err(e) = self.ctx.repository.save_execution(&execution).await {
            error!(execution_id = %execution_id, error = %e, "Failed to persist resumed execution");
            return OperationResult::failed(format!("Retry not started: {}", e));
        }
        self.ctx.registry.register(execution);
        self.ctx
            .events
            .state_changed(execution_id, previous, ExecutionStatus::Running);

        info!(
            execution_id = %execution_id,
            step_id = %step_id,
            attempt,
            "Halted execution resumed for retry"
        );
        self.launch(
            &mut runs,
            execution_id,
            definition,
            CancellationToken::new(),
            index,
        );

        OperationResult::ok(format!(
            "Step {} scheduled for retry (attempt {}), execution resumed",
            step_id, attempt
        ))
    }

    /// Details of an active or stored execution
    pub async fn get_execution_details(
        &self,
        execution_id: &str,
    ) -> RunbookResult<Option<ExecutionDetails>> {
        if let Some(execution) = self.ctx.registry.get(execution_id) {
            return Ok(Some(ExecutionDetails::from_execution(&execution, true)));
        }

        Ok(self
            .ctx
            .repository
            .get_execution(execution_id)
            .await?
            .map(|execution| ExecutionDetails::from_execution(&execution, false)))
    }

    /// Roll back an execution's compensations on demand
    pub async fn rollback(
        &self,
        execution_id: &str,
        options: RollbackOptions,
    ) -> RunbookResult<RollbackResult> {
        self.ctx.compensations.rollback(execution_id, options).await
    }

    /// Snapshots of every active execution
    pub fn active_executions(&self) -> Vec<RunbookExecution> {
        self.ctx.registry.list()
    }

    /// Subscribe to runbook events
    pub fn subscribe(&self) -> broadcast::Receiver<RunbookEvent> {
        self.ctx.events.subscribe()
    }

    /// Wait for an execution's runner to finish
    ///
    /// Falls back to the stored status when no runner is tracked.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
    ) -> RunbookResult<Option<ExecutionStatus>> {
        let handle = self.runs.write().await.remove(execution_id);
        if let Some(handle) = handle {
            return handle.await.map(Some).map_err(|e| {
                error!(execution_id = %execution_id, error = %e, "Runner task failed");
                RunbookError::CollaboratorFailure(format!("Runner task failed: {}", e))
            });
        }

        if let Some(status) = self.ctx.registry.status(execution_id) {
            return Ok(Some(status));
        }
        Ok(self
            .ctx
            .repository
            .get_execution(execution_id)
            .await?
            .map(|e| e.status))
    }

    /// Wait for an abort-triggered rollback to finish
    pub async fn wait_for_rollback(
        &self,
        execution_id: &str,
    ) -> RunbookResult<Option<RollbackResult>> {
        let handle = self.rollbacks.write().await.remove(execution_id);
        match handle {
            Some(handle) => handle.await.map(Some).map_err(|e| {
                error!(execution_id = %execution_id, error = %e, "Rollback task failed");
                RunbookError::RollbackFailure(format!("Rollback task failed: {}", e))
            }),
            None => Ok(None),
        }
    }

    /// Cancel every running execution and wait for background tasks
    pub async fn shutdown(&self) {
        info!(active = self.tokens.len(), "Shutting down execution controller");
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }

        let runs: Vec<_> = self.runs.write().await.drain().collect();
        for (execution_id, handle) in runs {
            if let Err(e) = handle.await {
                error!(execution_id = %execution_id, error = %e, "Runner task failed");
            }
        }

        let rollbacks: Vec<_> = self.rollbacks.write().await.drain().collect();
        for (execution_id, handle) in rollbacks {
            if let Err(e) = handle.await {
                error!(execution_id = %execution_id, error = %e, "Rollback task failed");
            }
        }
    }

    /// Give the runner a bounded chance to return from an in-flight step
    async fn settle_runner(&self, execution_id: &str) {
        let Some(mut handle) = self.runs.write().await.remove(execution_id) else {
            return;
        };

        match tokio::time::timeout(self.abort_grace_period, &mut handle).await {
            Ok(Ok(status)) => {
                debug!(execution_id = %execution_id, status = ?status, "Runner stopped for abort")
            }
            Ok(Err(e)) => {
                error!(execution_id = %execution_id, error = %e, "Runner task failed during abort")
            }
            Err(_) => {
                warn!(
                    execution_id = %execution_id,
                    grace_ms = self.abort_grace_period.as_millis() as u64,
                    "Step still running after abort grace period"
                );
                self.runs
                    .write()
                    .await
                    .insert(execution_id.to_string(), handle);
            }
        }
    }

    fn launch(
        &self,
        runs: &mut HashMap<String, JoinHandle<ExecutionStatus>>,
        execution_id: &str,
        definition: Arc<RunbookDefinition>,
        token: CancellationToken,
        start_index: usize,
    ) {
        self.runbooks
            .insert(execution_id.to_string(), Arc::clone(&definition));
        self.tokens.insert(execution_id.to_string(), token.clone());

        let runner = StepRunner::new(execution_id, definition, self.ctx.clone(), token)
            .starting_at(start_index);
        let runbooks = Arc::clone(&self.runbooks);
        let tokens = Arc::clone(&self.tokens);
        let id = execution_id.to_string();

        let handle = tokio::spawn(async move {
            let status = runner.run().await;
            tokens.remove(&id);
            // Only halted executions can be resumed by a retry
            if !matches!(
                status,
                ExecutionStatus::Failed | ExecutionStatus::CompletedWithErrors
            ) {
                runbooks.remove(&id);
            }
            debug!(execution_id = %id, status = ?status, "Runner task finished");
            status
        });
        runs.insert(execution_id.to_string(), handle);
    }

    async fn persisted(&self, snapshot: &RunbookExecution, message: &str) -> OperationResult {
        match self.ctx.repository.save_execution(snapshot).await {
            Ok(()) => OperationResult::ok(message),
            Err(e) => {
                error!(execution_id = %snapshot.id, error = %e, "Failed to persist execution");
                OperationResult::failed(format!("{}, but persisting failed: {}", message, e))
            }
        }
    }

    fn rejected(&self, execution_id: &str, operation: &str, err: RunbookError) -> OperationResult {
        debug!(
            execution_id = %execution_id,
            operation = %operation,
            error = %err,
            "Operation rejected"
        );
        match err {
            RunbookError::NotFound(_) => OperationResult::failed(format!(
                "Cannot {}: execution {} is not active",
                operation, execution_id
            )),
            other => OperationResult::failed(format!("Cannot {}: {}", operation, other)),
        }
    }
}
