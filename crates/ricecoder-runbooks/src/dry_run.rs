//! Side-effect-free runbook simulation
//!
//! The simulator predicts what an execution would do without invoking any
//! collaborator. It owns no repository, so nothing it produces is persisted.

use crate::gates::{GateBuilder, GatedStep};
use crate::models::{RunbookDefinition, RunbookSafetyAnalysis, RunbookStep};
use crate::safety::SafetyAnalyzer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Estimated duration of a step without a timeout
pub const DEFAULT_STEP_ESTIMATE: Duration = Duration::from_secs(30);

/// Predicted outcome for one step
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DryRunStepResult {
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Predicted success
    pub would_succeed: bool,
    /// Description of what would run
    pub simulated_output: String,
    /// Estimated duration
    pub estimated_duration: Duration,
    /// Destructive or production warnings
    pub warnings: Vec<String>,
    /// Whether an approval would be requested
    pub requires_approval: bool,
    /// Gates the step would pass through
    pub gates: Vec<GatedStep>,
}

/// Predicted outcome for a whole runbook
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DryRunResult {
    /// Runbook identifier
    pub runbook_id: String,
    /// Runbook name
    pub runbook_name: String,
    /// Safety analysis for the runbook
    pub analysis: RunbookSafetyAnalysis,
    /// Per-step predictions in definition order
    pub steps: Vec<DryRunStepResult>,
    /// Sum of the step estimates
    pub estimated_total_duration: Duration,
    /// Whether every step is predicted to succeed
    pub would_succeed: bool,
    /// When the simulation ran
    pub simulated_at: DateTime<Utc>,
}

impl DryRunResult {
    /// Steps that would wait for an approval
    pub fn approval_steps(&self) -> impl Iterator<Item = &DryRunStepResult> {
        self.steps.iter().filter(|s| s.requires_approval)
    }
}

/// Predicts runbook outcomes
#[derive(Debug, Clone)]
pub struct DryRunSimulator {
    analyzer: SafetyAnalyzer,
    gates: GateBuilder,
    default_estimate: Duration,
}

impl Default for DryRunSimulator {
    fn default() -> Self {
        Self::new(SafetyAnalyzer::new(), GateBuilder::new())
    }
}

impl DryRunSimulator {
    /// Create a simulator
    pub fn new(analyzer: SafetyAnalyzer, gates: GateBuilder) -> Self {
        Self {
            analyzer,
            gates,
            default_estimate: DEFAULT_STEP_ESTIMATE,
        }
    }

    /// Override the estimate used for steps without a timeout
    pub fn with_default_estimate(mut self, estimate: Duration) -> Self {
        self.default_estimate = estimate;
        self
    }

    /// Simulate a runbook
    pub fn simulate(&self, runbook: &RunbookDefinition) -> DryRunResult {
        let analysis = self.analyzer.analyze(runbook);
        let steps: Vec<DryRunStepResult> = runbook
            .steps
            .iter()
            .map(|step| self.simulate_step(step, &analysis))
            .collect();

        let estimated_total_duration: Duration = steps.iter().map(|s| s.estimated_duration).sum();
        let would_succeed = steps.iter().all(|s| s.would_succeed);

        tracing::debug!(
            runbook_id = %runbook.id,
            steps = steps.len(),
            estimated_secs = estimated_total_duration.as_secs(),
            "Dry run simulated"
        );

        DryRunResult {
            runbook_id: runbook.id.clone(),
            runbook_name: runbook.name.clone(),
            analysis,
            steps,
            estimated_total_duration,
            would_succeed,
            simulated_at: Utc::now(),
        }
    }

    fn simulate_step(
        &self,
        step: &RunbookStep,
        analysis: &RunbookSafetyAnalysis,
    ) -> DryRunStepResult {
        let mut warnings = Vec::new();
        if step.is_destructive {
            warnings.push(format!("Step '{}' is destructive", step.name));
        }
        if step.affects_production {
            warnings.push(format!("Step '{}' affects production", step.name));
        }

        let simulated_output = match &step.command {
            Some(command) => format!("[DRY RUN] Would execute '{}': {}", step.name, command),
            None => format!("[DRY RUN] Would execute '{}'", step.name),
        };

        DryRunStepResult {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            would_succeed: true,
            simulated_output,
            estimated_duration: step.timeout().unwrap_or(self.default_estimate),
            warnings,
            requires_approval: step.has_approval_gate
                || analysis.approval_for(&step.id).is_some(),
            gates: self.gates.gates_for_step(step, analysis),
        }
    }
}
