//! Compensation registration and rollback
//!
//! Completed steps may register an inverse action. A rollback replays the
//! registered compensations in reverse registration order (LIFO), optionally
//! limited to the compensations for a target step and every step after it.

use crate::error::{RunbookError, RunbookResult};
use crate::events::{EventBus, RunbookEvent};
use crate::executor::CompensationExecutor;
use crate::models::{
    CompensationStep, ExecutionStatus, RollbackOptions, RollbackResult, RunbookExecution,
};
use crate::registry::ExecutionRegistry;
use crate::repository::ExecutionRepository;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Message reported when an execution has nothing to roll back
pub const NO_COMPENSATIONS_MESSAGE: &str = "No compensation steps registered for execution";

/// Registers compensations and replays them on rollback
#[derive(Clone)]
pub struct CompensationManager {
    registry: Arc<dyn ExecutionRegistry>,
    repository: Arc<dyn ExecutionRepository>,
    executor: Arc<dyn CompensationExecutor>,
    events: EventBus,
}

impl CompensationManager {
    /// Create a compensation manager
    pub fn new(
        registry: Arc<dyn ExecutionRegistry>,
        repository: Arc<dyn ExecutionRepository>,
        executor: Arc<dyn CompensationExecutor>,
        events: EventBus,
    ) -> Self {
        Self {
            registry,
            repository,
            executor,
            events,
        }
    }

    /// Append a compensation to an execution and persist it
    ///
    /// Active executions are updated in the registry; otherwise the stored
    /// execution is loaded from the repository.
    pub async fn register_compensation(
        &self,
        execution_id: &str,
        for_step_id: &str,
        mut compensation: CompensationStep,
    ) -> RunbookResult<()> {
        compensation.for_step_id = for_step_id.to_string();
        debug!(
            execution_id = %execution_id,
            step_id = %for_step_id,
            compensation_id = %compensation.id,
            "Registering compensation"
        );

        let mut pending = Some(compensation);
        let snapshot = self.registry.modify(execution_id, &mut |execution| {
            if let Some(compensation) = pending.take() {
                execution.compensation_steps.push(compensation);
            }
        });

        let execution = match (snapshot, pending) {
            (Some(execution), _) => execution,
            (None, Some(compensation)) => {
                let mut execution = self
                    .repository
                    .get_execution(execution_id)
                    .await?
                    .ok_or_else(|| {
                        RunbookError::NotFound(format!("Execution not found: {}", execution_id))
                    })?;
                if execution.status == ExecutionStatus::Aborted {
                    return Err(RunbookError::InvalidTransition(format!(
                        "Execution {} was aborted; its rollback set is closed",
                        execution_id
                    )));
                }
                execution.compensation_steps.push(compensation);
                execution
            }
            (None, None) => {
                return Err(RunbookError::NotFound(format!(
                    "Execution not found: {}",
                    execution_id
                )))
            }
        };

        self.repository.save_execution(&execution).await
    }

    /// Roll back an execution by id
    pub async fn rollback(
        &self,
        execution_id: &str,
        options: RollbackOptions,
    ) -> RunbookResult<RollbackResult> {
        let execution = match self.registry.get(execution_id) {
            Some(execution) => execution,
            None => self
                .repository
                .get_execution(execution_id)
                .await?
                .ok_or_else(|| {
                    RunbookError::NotFound(format!("Execution not found: {}", execution_id))
                })?,
        };

        Ok(self.rollback_execution(&execution, options).await)
    }

    /// Roll back using an execution snapshot
    pub async fn rollback_execution(
        &self,
        execution: &RunbookExecution,
        options: RollbackOptions,
    ) -> RollbackResult {
        let started_at = Utc::now();
        let mut result = RollbackResult {
            execution_id: execution.id.clone(),
            success: false,
            message: String::new(),
            executed: Vec::new(),
            errors: Vec::new(),
            dry_run: options.dry_run,
            started_at,
            completed_at: started_at,
        };

        if execution.compensation_steps.is_empty() {
            info!(execution_id = %execution.id, "No compensation steps to roll back");
            result.message = NO_COMPENSATIONS_MESSAGE.to_string();
            return self.finish(result);
        }

        let candidates = match Self::select_candidates(execution, options.target_step_id.as_deref())
        {
            Ok(candidates) => candidates,
            Err(message) => {
                warn!(execution_id = %execution.id, "{}", message);
                result.message = message;
                return self.finish(result);
            }
        };

        info!(
            execution_id = %execution.id,
            compensation_count = candidates.len(),
            dry_run = options.dry_run,
            "Starting rollback"
        );

        // Replay in reverse registration order
        for compensation in candidates.into_iter().rev() {
            if options
                .cancellation
                .as_ref()
                .is_some_and(|token| token.is_cancelled())
            {
                warn!(execution_id = %execution.id, "Rollback cancelled");
                result.errors.push("Rollback cancelled".to_string());
                break;
            }

            if options.dry_run {
                debug!(
                    execution_id = %execution.id,
                    compensation_id = %compensation.id,
                    command = %compensation.command,
                    "Would execute compensation"
                );
                result.executed.push(compensation.id.clone());
                continue;
            }

            debug!(
                execution_id = %execution.id,
                compensation_id = %compensation.id,
                step_id = %compensation.for_step_id,
                "Executing compensation"
            );

            let failure = match self.executor.execute_compensation(compensation).await {
                Ok(true) => {
                    result.executed.push(compensation.id.clone());
                    None
                }
                Ok(false) => Some(format!(
                    "Compensation {} for step {} failed",
                    compensation.id, compensation.for_step_id
                )),
                Err(e) => Some(format!(
                    "Compensation {} for step {} failed: {}",
                    compensation.id, compensation.for_step_id, e
                )),
            };

            if let Some(failure) = failure {
                error!(
                    execution_id = %execution.id,
                    compensation_id = %compensation.id,
                    error = %failure,
                    "Compensation failed"
                );
                result.errors.push(failure);
                if !options.continue_on_error {
                    break;
                }
            }
        }

        result.success = result.errors.is_empty();
        result.message = match (result.success, options.dry_run) {
            (true, true) => format!(
                "Dry run: {} compensation step(s) would be executed",
                result.executed.len()
            ),
            (true, false) => format!(
                "Rolled back {} compensation step(s)",
                result.executed.len()
            ),
            (false, _) => format!(
                "Rollback finished with {} error(s)",
                result.errors.len()
            ),
        };

        info!(
            execution_id = %execution.id,
            executed = result.executed.len(),
            errors = result.errors.len(),
            "Rollback finished"
        );
        self.finish(result)
    }

    fn select_candidates<'a>(
        execution: &'a RunbookExecution,
        target_step_id: Option<&str>,
    ) -> Result<Vec<&'a CompensationStep>, String> {
        let Some(target) = target_step_id else {
            return Ok(execution.compensation_steps.iter().collect());
        };

        let position = execution
            .step_index(target)
            .ok_or_else(|| format!("Target step {} not found in execution", target))?;

        Ok(execution
            .compensation_steps
            .iter()
            .filter(|c| {
                execution
                    .step_index(&c.for_step_id)
                    .is_some_and(|index| index >= position)
            })
            .collect())
    }

    fn finish(&self, mut result: RollbackResult) -> RollbackResult {
        result.completed_at = Utc::now();
        self.events.publish(RunbookEvent::RollbackCompleted {
            execution_id: result.execution_id.clone(),
            result: result.clone(),
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryExecutionRegistry;
    use crate::repository::InMemoryExecutionRepository;
    use crate::test_support::execution_fixture;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingExecutor {
        executed: Mutex<Vec<String>>,
        failing_steps: Vec<String>,
    }

    #[async_trait]
    impl CompensationExecutor for RecordingExecutor {
        async fn execute_compensation(&self, compensation: &CompensationStep) -> RunbookResult<bool> {
            self.executed
                .lock()
                .unwrap()
                .push(compensation.for_step_id.clone());
            Ok(!self.failing_steps.contains(&compensation.for_step_id))
        }
    }

    struct Fixture {
        manager: CompensationManager,
        registry: Arc<InMemoryExecutionRegistry>,
        repository: Arc<InMemoryExecutionRepository>,
        executor: Arc<RecordingExecutor>,
    }

    fn fixture(failing_steps: &[&str]) -> Fixture {
        let registry = Arc::new(InMemoryExecutionRegistry::new());
        let repository = Arc::new(InMemoryExecutionRepository::new());
        let executor = Arc::new(RecordingExecutor {
            executed: Mutex::new(Vec::new()),
            failing_steps: failing_steps.iter().map(|s| s.to_string()).collect(),
        });
        let manager = CompensationManager::new(
            registry.clone(),
            repository.clone(),
            executor.clone(),
            EventBus::new(),
        );
        Fixture {
            manager,
            registry,
            repository,
            executor,
        }
    }

    fn with_compensations(steps: &[&str]) -> RunbookExecution {
        let mut execution = execution_fixture("exec-1", 3);
        for step in steps {
            execution.compensation_steps.push(CompensationStep::new(
                *step,
                format!("undo {}", step),
                format!("revert {}", step),
            ));
        }
        execution
    }

    #[tokio::test]
    async fn test_register_updates_registry_and_repository() {
        let f = fixture(&[]);
        f.registry.register(execution_fixture("exec-1", 2));

        f.manager
            .register_compensation(
                "exec-1",
                "step-1",
                CompensationStep::new("ignored", "undo", "revert"),
            )
            .await
            .unwrap();

        let active = f.registry.get("exec-1").unwrap();
        assert_eq!(active.compensation_steps.len(), 1);
        assert_eq!(active.compensation_steps[0].for_step_id, "step-1");
        let stored = f.repository.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(stored.compensation_steps, active.compensation_steps);
    }

    #[tokio::test]
    async fn test_register_falls_back_to_repository() {
        let f = fixture(&[]);
        f.repository
            .save_execution(&execution_fixture("exec-1", 2))
            .await
            .unwrap();

        f.manager
            .register_compensation("exec-1", "step-2", CompensationStep::new("x", "undo", "revert"))
            .await
            .unwrap();

        let stored = f.repository.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(stored.compensation_steps.len(), 1);

        let missing = f
            .manager
            .register_compensation("nope", "step-1", CompensationStep::new("x", "undo", "revert"))
            .await;
        assert!(matches!(missing, Err(RunbookError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_register_refuses_aborted_execution() {
        let f = fixture(&[]);
        let mut aborted = execution_fixture("exec-1", 2);
        aborted.status = ExecutionStatus::Aborted;
        f.repository.save_execution(&aborted).await.unwrap();

        let result = f
            .manager
            .register_compensation("exec-1", "step-2", CompensationStep::new("x", "undo", "revert"))
            .await;

        assert!(matches!(result, Err(RunbookError::InvalidTransition(_))));
        let stored = f.repository.get_execution("exec-1").await.unwrap().unwrap();
        assert!(stored.compensation_steps.is_empty());
    }

    #[tokio::test]
    async fn test_rollback_without_compensations_fails() {
        let f = fixture(&[]);
        let execution = execution_fixture("exec-1", 2);

        for (dry_run, continue_on_error) in [(false, false), (false, true), (true, false), (true, true)] {
            let result = f
                .manager
                .rollback_execution(
                    &execution,
                    RollbackOptions {
                        dry_run,
                        continue_on_error,
                        ..RollbackOptions::default()
                    },
                )
                .await;
            assert!(!result.success);
            assert_eq!(result.message, NO_COMPENSATIONS_MESSAGE);
        }
    }

    #[tokio::test]
    async fn test_rollback_replays_in_reverse_order() {
        let f = fixture(&[]);
        let execution = with_compensations(&["step-1", "step-2", "step-3"]);

        let result = f
            .manager
            .rollback_execution(&execution, RollbackOptions::default())
            .await;

        assert!(result.success);
        assert_eq!(
            *f.executor.executed.lock().unwrap(),
            vec!["step-3", "step-2", "step-1"]
        );
        assert_eq!(result.executed[0], execution.compensation_steps[2].id);
    }

    #[tokio::test]
    async fn test_rollback_to_target_step() {
        let f = fixture(&[]);
        let execution = with_compensations(&["step-1", "step-2", "step-3"]);

        let result = f
            .manager
            .rollback_execution(
                &execution,
                RollbackOptions {
                    target_step_id: Some("step-2".to_string()),
                    ..RollbackOptions::default()
                },
            )
            .await;

        assert!(result.success);
        assert_eq!(*f.executor.executed.lock().unwrap(), vec!["step-3", "step-2"]);
    }

    #[tokio::test]
    async fn test_rollback_unknown_target() {
        let f = fixture(&[]);
        let execution = with_compensations(&["step-1"]);
        let result = f
            .manager
            .rollback_execution(
                &execution,
                RollbackOptions {
                    target_step_id: Some("ghost".to_string()),
                    ..RollbackOptions::default()
                },
            )
            .await;
        assert!(!result.success);
        assert!(f.executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_rollback_executes_nothing() {
        let f = fixture(&[]);
        let execution = with_compensations(&["step-1", "step-2"]);

        let result = f
            .manager
            .rollback_execution(
                &execution,
                RollbackOptions {
                    dry_run: true,
                    ..RollbackOptions::default()
                },
            )
            .await;

        assert!(result.success);
        assert!(result.dry_run);
        assert_eq!(result.executed.len(), 2);
        assert!(f.executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_continue_on_error_collects_errors() {
        let f = fixture(&["step-2"]);
        let execution = with_compensations(&["step-1", "step-2", "step-3"]);

        let result = f
            .manager
            .rollback_execution(&execution, RollbackOptions::default())
            .await;

        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            *f.executor.executed.lock().unwrap(),
            vec!["step-3", "step-2", "step-1"]
        );
        assert_eq!(result.executed.len(), 2);
    }

    #[tokio::test]
    async fn test_first_error_halts_without_continue_on_error() {
        let f = fixture(&["step-2"]);
        let execution = with_compensations(&["step-1", "step-2", "step-3"]);

        let result = f
            .manager
            .rollback_execution(
                &execution,
                RollbackOptions {
                    continue_on_error: false,
                    ..RollbackOptions::default()
                },
            )
            .await;

        assert!(!result.success);
        assert_eq!(*f.executor.executed.lock().unwrap(), vec!["step-3", "step-2"]);
    }

    #[tokio::test]
    async fn test_cancelled_rollback_stops() {
        let f = fixture(&[]);
        let execution = with_compensations(&["step-1", "step-2"]);
        let token = CancellationToken::new();
        token.cancel();

        let result = f
            .manager
            .rollback_execution(
                &execution,
                RollbackOptions {
                    cancellation: Some(token),
                    ..RollbackOptions::default()
                },
            )
            .await;

        assert!(!result.success);
        assert!(f.executor.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_emits_event() {
        let f = fixture(&[]);
        let mut events = f.manager.events.subscribe();
        f.registry.register(with_compensations(&["step-1"]));

        let result = f
            .manager
            .rollback("exec-1", RollbackOptions::default())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            RunbookEvent::RollbackCompleted { result: event, .. } => assert_eq!(event, result),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            f.manager.rollback("missing", RollbackOptions::default()).await,
            Err(RunbookError::NotFound(_))
        ));
    }
}
