//! In-flight execution registry
//!
//! The registry is the single shared mutable resource of the engine. Every
//! mutation goes through [`ExecutionRegistry::modify`], which applies a closure
//! under the entry's lock so check-and-set transitions are atomic.

use crate::error::{RunbookError, RunbookResult};
use crate::models::{ExecutionStatus, RunbookExecution};
use dashmap::DashMap;

/// Concurrency-safe index of active executions keyed by execution id
pub trait ExecutionRegistry: Send + Sync {
    /// Register an execution, replacing any entry with the same id
    fn register(&self, execution: RunbookExecution);

    /// Snapshot of an active execution
    fn get(&self, execution_id: &str) -> Option<RunbookExecution>;

    /// Apply a mutation atomically, returning the updated snapshot
    ///
    /// Returns `None` when the execution is not registered.
    fn modify(
        &self,
        execution_id: &str,
        mutate: &mut dyn FnMut(&mut RunbookExecution),
    ) -> Option<RunbookExecution>;

    /// Remove an execution, returning its last state
    fn deregister(&self, execution_id: &str) -> Option<RunbookExecution>;

    /// Whether an execution is registered
    fn contains(&self, execution_id: &str) -> bool;

    /// Status of an active execution
    fn status(&self, execution_id: &str) -> Option<ExecutionStatus>;

    /// Snapshots of every active execution
    fn list(&self) -> Vec<RunbookExecution>;
}

/// [`ExecutionRegistry`] backed by a `DashMap`
#[derive(Debug, Default)]
pub struct InMemoryExecutionRegistry {
    executions: DashMap<String, RunbookExecution>,
}

impl InMemoryExecutionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
        }
    }

    /// Number of active executions
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// Whether no execution is active
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

impl ExecutionRegistry for InMemoryExecutionRegistry {
    fn register(&self, execution: RunbookExecution) {
        self.executions.insert(execution.id.clone(), execution);
    }

    fn get(&self, execution_id: &str) -> Option<RunbookExecution> {
        self.executions.get(execution_id).map(|e| e.value().clone())
    }

    fn modify(
        &self,
        execution_id: &str,
        mutate: &mut dyn FnMut(&mut RunbookExecution),
    ) -> Option<RunbookExecution> {
        let mut entry = self.executions.get_mut(execution_id)?;
        mutate(entry.value_mut());
        Some(entry.value().clone())
    }

    fn deregister(&self, execution_id: &str) -> Option<RunbookExecution> {
        self.executions.remove(execution_id).map(|(_, e)| e)
    }

    fn contains(&self, execution_id: &str) -> bool {
        self.executions.contains_key(execution_id)
    }

    fn status(&self, execution_id: &str) -> Option<ExecutionStatus> {
        self.executions.get(execution_id).map(|e| e.status)
    }

    fn list(&self) -> Vec<RunbookExecution> {
        self.executions.iter().map(|e| e.value().clone()).collect()
    }
}

/// Apply a fallible transition atomically
///
/// Returns the transition's value together with the snapshot taken after the
/// closure ran, or `NotFound` when the execution is not registered.
pub fn try_modify<T>(
    registry: &dyn ExecutionRegistry,
    execution_id: &str,
    transition: impl FnOnce(&mut RunbookExecution) -> RunbookResult<T>,
) -> RunbookResult<(T, RunbookExecution)> {
    let mut transition = Some(transition);
    let mut outcome = None;
    let snapshot = registry.modify(execution_id, &mut |execution| {
        if let Some(transition) = transition.take() {
            outcome = Some(transition(execution));
        }
    });

    match (outcome, snapshot) {
        (Some(Ok(value)), Some(snapshot)) => Ok((value, snapshot)),
        (Some(Err(err)), _) => Err(err),
        _ => Err(RunbookError::NotFound(format!(
            "Execution not found: {}",
            execution_id
        ))),
    }
}
