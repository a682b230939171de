//! Property-based tests for pause, resume and abort transitions

#[cfg(test)]
mod tests {
    use crate::models::*;
    use crate::state::StateManager;
    use crate::test_support::execution_fixture;
    use proptest::prelude::*;

    fn arb_step_status() -> impl Strategy<Value = StepStatus> {
        prop::sample::select(vec![
            StepStatus::Pending,
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Skipped,
        ])
    }

    fn arb_execution_status() -> impl Strategy<Value = ExecutionStatus> {
        prop::sample::select(vec![
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Aborting,
            ExecutionStatus::Aborted,
            ExecutionStatus::Completed,
            ExecutionStatus::CompletedWithErrors,
            ExecutionStatus::Failed,
            ExecutionStatus::Blocked,
        ])
    }

    // Running execution with arbitrary per-step progress
    fn arb_running_execution() -> impl Strategy<Value = RunbookExecution> {
        prop::collection::vec(arb_step_status(), 1..8).prop_map(|statuses| {
            let mut execution = execution_fixture("exec-prop", statuses.len());
            for (step, status) in execution.step_executions.iter_mut().zip(statuses) {
                step.status = status;
            }
            execution
        })
    }

    proptest! {
        /// Pausing then resuming returns to Running without touching step progress
        #[test]
        fn prop_pause_resume_preserves_steps(
            mut execution in arb_running_execution(),
            reason in prop::option::of("[a-z ]{1,20}"),
        ) {
            let original_steps = execution.step_executions.clone();

            StateManager::pause_execution(&mut execution, reason.clone()).unwrap();
            prop_assert_eq!(execution.status, ExecutionStatus::Paused);
            prop_assert_eq!(&execution.pause_reason, &reason);
            prop_assert_eq!(&execution.step_executions, &original_steps);

            StateManager::resume_execution(&mut execution).unwrap();
            prop_assert_eq!(execution.status, ExecutionStatus::Running);
            prop_assert!(execution.paused_at.is_none());
            prop_assert!(execution.pause_reason.is_none());
            prop_assert_eq!(&execution.step_executions, &original_steps);
        }

        /// Pause succeeds only from Running and a rejected pause changes nothing
        #[test]
        fn prop_pause_only_from_running(status in arb_execution_status()) {
            let mut execution = execution_fixture("exec-prop", 2);
            execution.status = status;

            let result = StateManager::pause_execution(&mut execution, None);
            if status == ExecutionStatus::Running {
                prop_assert!(result.is_ok());
                prop_assert_eq!(execution.status, ExecutionStatus::Paused);
            } else {
                prop_assert!(result.is_err());
                prop_assert_eq!(execution.status, status);
                prop_assert!(execution.paused_at.is_none());
            }
        }

        /// Resume succeeds only from Paused
        #[test]
        fn prop_resume_only_from_paused(status in arb_execution_status()) {
            let mut execution = execution_fixture("exec-prop", 2);
            execution.status = status;

            let result = StateManager::resume_execution(&mut execution);
            prop_assert_eq!(result.is_ok(), status == ExecutionStatus::Paused);
            if status != ExecutionStatus::Paused {
                prop_assert_eq!(execution.status, status);
            }
        }

        /// Abort is accepted from every non-terminal status except Aborting
        #[test]
        fn prop_abort_from_non_terminal(status in arb_execution_status()) {
            let mut execution = execution_fixture("exec-prop", 2);
            execution.status = status;

            let result = StateManager::begin_abort(&mut execution, None);
            let allowed = !status.is_terminal() && status != ExecutionStatus::Aborting;
            prop_assert_eq!(result.is_ok(), allowed);
            if allowed {
                prop_assert_eq!(execution.status, ExecutionStatus::Aborting);
                StateManager::complete_abort(&mut execution).unwrap();
                prop_assert_eq!(execution.status, ExecutionStatus::Aborted);
            } else {
                prop_assert_eq!(execution.status, status);
            }
        }
    }
}
