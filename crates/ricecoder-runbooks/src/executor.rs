//! Step and compensation collaborators
//!
//! The engine never decides what a step does. It hands each step to a
//! [`StepExecutor`] and each compensation to a [`CompensationExecutor`].

use crate::error::RunbookResult;
use crate::models::{CompensationStep, RunbookStep};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome of a single step attempt
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepOutcome {
    /// Whether the step succeeded
    pub success: bool,
    /// Captured output
    pub output: Option<String>,
    /// Error text on failure
    pub error: Option<String>,
    /// Inverse action registered when the step succeeds
    pub compensation: Option<CompensationStep>,
}

impl StepOutcome {
    /// Successful outcome with output
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            ..Self::default()
        }
    }

    /// Failed outcome with an error
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// Attach a compensation
    pub fn with_compensation(mut self, compensation: CompensationStep) -> Self {
        self.compensation = Some(compensation);
        self
    }
}

/// Executes runbook steps
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one attempt of a step
    ///
    /// `Err` is treated like a failed outcome carrying the error text.
    async fn execute_step(
        &self,
        step: &RunbookStep,
        parameters: &HashMap<String, String>,
    ) -> RunbookResult<StepOutcome>;
}

/// Executes compensation steps during rollback
#[async_trait]
pub trait CompensationExecutor: Send + Sync {
    /// Run a compensation, returning whether it succeeded
    async fn execute_compensation(&self, compensation: &CompensationStep) -> RunbookResult<bool>;
}
