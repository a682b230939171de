//! Persistence collaborator for execution state
//!
//! The engine saves an execution after every mutation, so implementations must
//! behave as an idempotent upsert keyed by execution id.

use crate::error::{RunbookError, RunbookResult};
use crate::models::RunbookExecution;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};

/// Saves and loads executions
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Insert or replace an execution
    async fn save_execution(&self, execution: &RunbookExecution) -> RunbookResult<()>;

    /// Load an execution, `None` when unknown
    async fn get_execution(&self, execution_id: &str) -> RunbookResult<Option<RunbookExecution>>;
}

/// Repository kept in memory
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    executions: DashMap<String, RunbookExecution>,
}

impl InMemoryExecutionRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self {
            executions: DashMap::new(),
        }
    }

    /// Number of stored executions
    pub fn len(&self) -> usize {
        self.executions.len()
    }

    /// Whether nothing is stored
    pub fn is_empty(&self) -> bool {
        self.executions.is_empty()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save_execution(&self, execution: &RunbookExecution) -> RunbookResult<()> {
        self.executions
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> RunbookResult<Option<RunbookExecution>> {
        Ok(self.executions.get(execution_id).map(|e| e.value().clone()))
    }
}

/// Repository storing one JSON document per execution in a directory
#[derive(Debug, Clone)]
pub struct FileExecutionRepository {
    root: PathBuf,
}

impl FileExecutionRepository {
    /// Create a repository rooted at `root`; the directory is created lazily
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the execution files
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, execution_id: &str) -> RunbookResult<PathBuf> {
        if execution_id.is_empty()
            || execution_id
                .chars()
                .any(|c| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'))
        {
            return Err(RunbookError::Persistence(format!(
                "Invalid execution id for file storage: {:?}",
                execution_id
            )));
        }
        Ok(self.root.join(format!("{}.json", execution_id)))
    }
}

#[async_trait]
impl ExecutionRepository for FileExecutionRepository {
    async fn save_execution(&self, execution: &RunbookExecution) -> RunbookResult<()> {
        let path = self.path_for(&execution.id)?;

        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            RunbookError::Persistence(format!(
                "Failed to create storage directory at {}: {}",
                self.root.display(),
                e
            ))
        })?;

        let json = serde_json::to_vec_pretty(execution)?;

        // Write then rename so readers never observe a partial document. The
        // runner and the controller may save the same execution concurrently.
        let tmp_path = self
            .root
            .join(format!("{}.{}.tmp", execution.id, uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp_path, json).await.map_err(|e| {
            RunbookError::Persistence(format!(
                "Failed to write execution state to {}: {}",
                tmp_path.display(),
                e
            ))
        })?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(|e| {
            RunbookError::Persistence(format!(
                "Failed to move execution state into {}: {}",
                path.display(),
                e
            ))
        })?;

        tracing::trace!(execution_id = %execution.id, path = %path.display(), "Execution saved");
        Ok(())
    }

    async fn get_execution(&self, execution_id: &str) -> RunbookResult<Option<RunbookExecution>> {
        let path = self.path_for(execution_id)?;

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(RunbookError::Persistence(format!(
                    "Failed to read execution state from {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let execution = serde_json::from_slice(&content).map_err(|e| {
            RunbookError::Persistence(format!(
                "Failed to deserialize execution state from {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(Some(execution))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExecutionStatus, StepStatus};
    use crate::test_support::execution_fixture;

    #[tokio::test]
    async fn test_in_memory_upsert() {
        let repo = InMemoryExecutionRepository::new();
        let mut execution = execution_fixture("exec-1", 2);

        repo.save_execution(&execution).await.unwrap();
        execution.status = ExecutionStatus::Completed;
        repo.save_execution(&execution).await.unwrap();

        assert_eq!(repo.len(), 1);
        let loaded = repo.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Completed);
        assert!(repo.get_execution("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_repository_persists_state() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileExecutionRepository::new(dir.path().join("executions"));
        let mut execution = execution_fixture("exec-1", 3);
        execution.step_executions[1].status = StepStatus::Failed;
        execution.step_executions[1].error = Some("boom".to_string());

        repo.save_execution(&execution).await.unwrap();
        repo.save_execution(&execution).await.unwrap();

        let loaded = repo.get_execution("exec-1").await.unwrap().unwrap();
        assert_eq!(loaded.step_executions, execution.step_executions);
        assert_eq!(loaded.safety_analysis, execution.safety_analysis);
        let leftovers = std::fs::read_dir(repo.root())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_file_repository_missing_execution() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileExecutionRepository::new(dir.path());
        assert!(repo.get_execution("unknown").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_repository_rejects_path_like_ids() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileExecutionRepository::new(dir.path());
        let result = repo.get_execution("../etc/passwd").await;
        assert!(matches!(result, Err(RunbookError::Persistence(_))));
    }

    #[tokio::test]
    async fn test_file_repository_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let repo = FileExecutionRepository::new(dir.path());
        assert!(matches!(
            repo.get_execution("bad").await,
            Err(RunbookError::Persistence(_))
        ));
    }
}
