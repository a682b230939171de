//! Core data models for runbooks and their executions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A declarative, ordered runbook definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookDefinition {
    /// Unique runbook identifier
    pub id: String,
    /// Runbook name
    pub name: String,
    /// Runbook description
    #[serde(default)]
    pub description: String,
    /// Ordered runbook steps
    pub steps: Vec<RunbookStep>,
}

impl RunbookDefinition {
    /// Create an empty runbook definition
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
        }
    }

    /// Append a step, builder style
    pub fn with_step(mut self, step: RunbookStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Position of a step in the definition
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// A single step in a runbook
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunbookStep {
    /// Unique step identifier
    pub id: String,
    /// Step name
    pub name: String,
    /// Step description
    #[serde(default)]
    pub description: String,
    /// Command text handed to the step executor
    #[serde(default)]
    pub command: Option<String>,
    /// Whether the step destroys or removes something
    #[serde(default)]
    pub is_destructive: bool,
    /// Whether the step touches production systems
    #[serde(default)]
    pub affects_production: bool,
    /// Whether the step carries a confirmation gate
    #[serde(default)]
    pub has_confirmation: bool,
    /// Whether the step carries an approval gate
    #[serde(default)]
    pub has_approval_gate: bool,
    /// Maximum number of retries after the first attempt
    #[serde(default)]
    pub max_retries: u32,
    /// Step timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Steps that must run before this one (must appear earlier in the list)
    #[serde(default)]
    pub dependencies: Vec<String>,
}

impl RunbookStep {
    /// Create a step with the given id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the command text
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Mark the step as destructive
    pub fn destructive(mut self) -> Self {
        self.is_destructive = true;
        self
    }

    /// Mark the step as affecting production
    pub fn production(mut self) -> Self {
        self.affects_production = true;
        self
    }

    /// Attach a confirmation gate
    pub fn with_confirmation(mut self) -> Self {
        self.has_confirmation = true;
        self
    }

    /// Attach an approval gate
    pub fn with_approval_gate(mut self) -> Self {
        self.has_approval_gate = true;
        self
    }

    /// Set the retry budget
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the timeout in seconds
    pub fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }

    /// Step timeout as a duration
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Runbook execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Execution has been created but not started
    Pending,
    /// Execution is running
    Running,
    /// Execution is paused at a step boundary
    Paused,
    /// Abort requested, runner is stopping
    Aborting,
    /// Execution was aborted
    Aborted,
    /// Every step completed
    Completed,
    /// Execution finished but some steps did not complete
    CompletedWithErrors,
    /// Execution stopped on a failed step
    Failed,
    /// Execution was refused or an approval gate was denied
    Blocked,
}

impl ExecutionStatus {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Aborted
                | ExecutionStatus::Completed
                | ExecutionStatus::CompletedWithErrors
                | ExecutionStatus::Failed
                | ExecutionStatus::Blocked
        )
    }
}

/// Step execution status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not started
    Pending,
    /// Step is running
    Running,
    /// Step completed successfully
    Completed,
    /// Step failed
    Failed,
    /// Step is scheduled for another attempt
    Retrying,
    /// Step was skipped
    Skipped,
    /// Step was blocked by a gate
    Blocked,
}

/// What triggered an execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// A person started the runbook
    #[default]
    Manual,
    /// A schedule started the runbook
    Scheduled,
    /// An alert started the runbook
    Alert,
    /// A self-healing rule started the runbook
    SelfHealing,
    /// An API caller started the runbook
    Api,
}

/// Trigger metadata recorded on an execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerInfo {
    /// Why the runbook was started
    pub reason: String,
    /// Who or what started it
    pub triggered_by: String,
    /// Kind of trigger
    pub trigger_type: TriggerType,
}

/// Execution record for a single step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepExecution {
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Current status
    pub status: StepStatus,
    /// When the latest attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a final state
    pub completed_at: Option<DateTime<Utc>>,
    /// Captured output
    pub output: Option<String>,
    /// Captured error text
    pub error: Option<String>,
    /// Retries consumed so far
    pub retry_count: u32,
    /// Retry budget
    pub max_retries: u32,
}

impl StepExecution {
    /// Create a pending record for a step
    pub fn for_step(step: &RunbookStep) -> Self {
        Self {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            output: None,
            error: None,
            retry_count: 0,
            max_retries: step.max_retries,
        }
    }

    /// Whether another retry fits in the budget
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }
}

/// A registered inverse action used to undo a completed step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompensationStep {
    /// Compensation identifier
    pub id: String,
    /// Step this compensation undoes
    pub for_step_id: String,
    /// Human readable description
    pub description: String,
    /// Reversal command
    pub command: String,
    /// When the compensation was registered
    pub registered_at: DateTime<Utc>,
}

impl CompensationStep {
    /// Create a compensation for a step
    pub fn new(
        for_step_id: impl Into<String>,
        description: impl Into<String>,
        command: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            for_step_id: for_step_id.into(),
            description: description.into(),
            command: command.into(),
            registered_at: Utc::now(),
        }
    }
}

/// One invocation of a runbook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunbookExecution {
    /// Execution identifier
    pub id: String,
    /// Source runbook identifier
    pub runbook_id: String,
    /// Source runbook name
    pub runbook_name: String,
    /// Current status
    pub status: ExecutionStatus,
    /// Trigger metadata
    pub trigger: TriggerInfo,
    /// When the execution started
    pub started_at: DateTime<Utc>,
    /// When the execution was paused
    pub paused_at: Option<DateTime<Utc>>,
    /// Why the execution was paused
    pub pause_reason: Option<String>,
    /// When the execution was aborted
    pub aborted_at: Option<DateTime<Utc>>,
    /// Why the execution was aborted
    pub abort_reason: Option<String>,
    /// When the execution reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether steps are simulated
    pub is_dry_run: bool,
    /// Whether failed steps let the run continue
    pub continue_on_error: bool,
    /// Whether failed steps are retried automatically
    #[serde(default = "default_true")]
    pub automatic_retries: bool,
    /// Caller supplied parameters handed to the step executor
    #[serde(default)]
    pub parameters: HashMap<String, String>,
    /// One record per runbook step, in definition order
    pub step_executions: Vec<StepExecution>,
    /// Compensations in registration order
    pub compensation_steps: Vec<CompensationStep>,
    /// Safety analysis taken at start
    pub safety_analysis: RunbookSafetyAnalysis,
}

fn default_true() -> bool {
    true
}

impl RunbookExecution {
    /// Step record by step id
    pub fn step(&self, step_id: &str) -> Option<&StepExecution> {
        self.step_executions.iter().find(|s| s.step_id == step_id)
    }

    /// Mutable step record by step id
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepExecution> {
        self.step_executions.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Position of a step record
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.step_executions.iter().position(|s| s.step_id == step_id)
    }

    /// Whether every step completed
    pub fn all_steps_completed(&self) -> bool {
        self.step_executions
            .iter()
            .all(|s| s.status == StepStatus::Completed)
    }
}

/// Danger classification for a single step
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DangerLevel {
    /// No danger detected
    None,
    /// Minor danger
    Low,
    /// Moderate danger
    Medium,
    /// Requires approval
    High,
    /// Requires multi-person approval
    Critical,
}

/// Overall risk classification for a runbook
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Safe to run unattended
    Low,
    /// Several dangerous steps
    Medium,
    /// At least one high danger step
    High,
    /// At least one critical step
    Critical,
}

/// A step the safety analyzer flagged
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DangerousStep {
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Danger classification
    pub danger_level: DangerLevel,
    /// Why the step was flagged
    pub reason: String,
    /// Suggested mitigations
    pub mitigations: Vec<String>,
}

/// Kind of approval needed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalType {
    /// One approver is enough
    Single,
    /// Several distinct approvers are needed
    MultiPerson,
}

/// Approval derived from a dangerous step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApprovalRequirement {
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Kind of approval
    pub approval_type: ApprovalType,
    /// Number of distinct approvers
    pub required_approvers: u32,
    /// Why the approval is needed
    pub reason: String,
    /// How long an approval stays valid
    pub expires_in: Duration,
}

/// Per-runbook safety verdict
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunbookSafetyAnalysis {
    /// Runbook identifier
    pub runbook_id: String,
    /// Overall risk
    pub overall_risk: RiskLevel,
    /// Dangerous step findings
    pub dangerous_steps: Vec<DangerousStep>,
    /// Approvals needed before the runbook may run
    pub required_approvals: Vec<ApprovalRequirement>,
    /// Gate configuration warnings
    pub warnings: Vec<String>,
    /// Whether an unattended start is allowed
    pub can_run_automatically: bool,
    /// Whether a dry run is recommended first
    pub recommends_dry_run: bool,
    /// When the analysis was computed
    pub analyzed_at: DateTime<Utc>,
}

impl RunbookSafetyAnalysis {
    /// Finding for a step, if any
    pub fn finding(&self, step_id: &str) -> Option<&DangerousStep> {
        self.dangerous_steps.iter().find(|d| d.step_id == step_id)
    }

    /// Approval requirement for a step, if any
    pub fn approval_for(&self, step_id: &str) -> Option<&ApprovalRequirement> {
        self.required_approvals.iter().find(|a| a.step_id == step_id)
    }
}

/// Options for starting a runbook
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// A person explicitly asked for this run
    pub manual_trigger: bool,
    /// Kind of trigger
    pub trigger_type: TriggerType,
    /// Why the runbook is started
    pub reason: String,
    /// Who starts it
    pub triggered_by: String,
    /// Simulate steps instead of executing them
    pub dry_run: bool,
    /// Keep going after a step fails
    pub continue_on_error: bool,
    /// Retry failed steps automatically within their budget
    pub automatic_retries: bool,
    /// Parameters handed to the step executor
    pub parameters: HashMap<String, String>,
    /// Caller cancellation
    pub cancellation: Option<CancellationToken>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            manual_trigger: false,
            trigger_type: TriggerType::Manual,
            reason: String::new(),
            triggered_by: "system".to_string(),
            dry_run: false,
            continue_on_error: false,
            automatic_retries: true,
            parameters: HashMap::new(),
            cancellation: None,
        }
    }
}

impl StartOptions {
    /// Options for an explicit, person-initiated run
    pub fn manual(triggered_by: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            manual_trigger: true,
            trigger_type: TriggerType::Manual,
            reason: reason.into(),
            triggered_by: triggered_by.into(),
            ..Self::default()
        }
    }
}

/// Options for aborting an execution
#[derive(Debug, Clone, Default)]
pub struct AbortOptions {
    /// Why the execution is aborted
    pub reason: Option<String>,
    /// Replay registered compensations in the background
    pub run_compensation: bool,
    /// Caller cancellation for the rollback
    pub cancellation: Option<CancellationToken>,
}

/// Options for a compensation rollback
#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Only roll back compensations for this step and later ones
    pub target_step_id: Option<String>,
    /// Report what would run without executing
    pub dry_run: bool,
    /// Keep going after a compensation fails
    pub continue_on_error: bool,
    /// Caller cancellation
    pub cancellation: Option<CancellationToken>,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            target_step_id: None,
            dry_run: false,
            continue_on_error: true,
            cancellation: None,
        }
    }
}

/// Result of a start request
#[derive(Debug, Clone)]
pub struct StartResult {
    /// Execution identifier, absent when the start was blocked
    pub execution_id: Option<String>,
    /// Status after the call
    pub status: ExecutionStatus,
    /// Safety analysis used to decide
    pub analysis: RunbookSafetyAnalysis,
    /// Human readable outcome
    pub message: String,
}

/// Result of a controller operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    /// Whether the operation took effect
    pub success: bool,
    /// Human readable outcome
    pub message: String,
}

impl OperationResult {
    /// Successful outcome
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    /// Failed outcome
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Result of an abort request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortResult {
    /// Whether the execution was aborted
    pub success: bool,
    /// Whether a background rollback was launched
    pub compensation_triggered: bool,
    /// Human readable outcome
    pub message: String,
}

/// Result of a compensation rollback
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RollbackResult {
    /// Execution identifier
    pub execution_id: String,
    /// True only when no error occurred
    pub success: bool,
    /// Human readable outcome
    pub message: String,
    /// Compensation ids executed (or reported under dry run), in replay order
    pub executed: Vec<String>,
    /// Errors collected during replay
    pub errors: Vec<String>,
    /// Whether compensations were only reported
    pub dry_run: bool,
    /// When the rollback started
    pub started_at: DateTime<Utc>,
    /// When the rollback finished
    pub completed_at: DateTime<Utc>,
}
