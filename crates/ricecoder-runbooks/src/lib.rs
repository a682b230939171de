#![warn(missing_docs)]

//! Ricecoder Runbooks
//!
//! Runbook execution and safety engine. Declarative operational runbooks are
//! analyzed for danger, gated behind confirmations and approvals, executed step
//! by step with bounded retries, and can be paused, resumed, aborted, simulated
//! or rolled back through registered compensations.

pub mod approval;
pub mod compensation;
pub mod config;
pub mod controller;
pub mod details;
pub mod dry_run;
pub mod error;
pub mod events;
pub mod executor;
pub mod gates;
pub mod models;
pub mod parser;
pub mod registry;
pub mod repository;
pub mod retry;
pub mod runner;
pub mod safety;
pub mod state;

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod safety_properties;

#[cfg(test)]
mod pause_resume_properties;

pub use approval::{ApprovalQueue, ApprovalRequest, ApprovalResponse, ApprovalService};
pub use compensation::CompensationManager;
pub use config::RunbookConfig;
pub use controller::{ExecutionController, ExecutionControllerBuilder};
pub use details::{ExecutionDetails, ExecutionProgress, StepDetails};
pub use dry_run::{DryRunResult, DryRunSimulator, DryRunStepResult};
pub use error::*;
pub use events::{EventBus, RunbookEvent};
pub use executor::{CompensationExecutor, StepExecutor, StepOutcome};
pub use gates::{ConfirmationLevel, Gate, GateBuilder, GatedStep};
pub use models::*;
pub use parser::{RunbookFormat, RunbookParser};
pub use registry::{ExecutionRegistry, InMemoryExecutionRegistry};
pub use repository::{ExecutionRepository, FileExecutionRepository, InMemoryExecutionRepository};
pub use retry::RetryPolicy;
pub use runner::{RunnerContext, StepRunner};
pub use safety::{DangerPolicy, DangerRule, SafetyAnalyzer};
pub use state::StateManager;
