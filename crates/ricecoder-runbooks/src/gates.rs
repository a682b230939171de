//! Confirmation and approval gate descriptors
//!
//! Gates are ephemeral: they are derived from a step (and the runbook's safety
//! analysis) right before the step runs and are never persisted.

use crate::approval::ApprovalRequest;
use crate::models::{ApprovalType, RunbookSafetyAnalysis, RunbookStep};
use crate::safety::{required_approvers, DEFAULT_APPROVAL_EXPIRY};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timeout carried by timed confirmations
pub const TIMED_CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Text an operator types to confirm a destructive step
pub const DESTRUCTIVE_CONFIRMATION_TEXT: &str = "DELETE";

/// How a confirmation must be given
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "level")]
pub enum ConfirmationLevel {
    /// A plain yes/no
    Simple,
    /// The operator types the given text exactly
    TypeToConfirm {
        /// Text that must be typed
        text: String,
    },
    /// The operator confirms within a time window
    TimedConfirmation {
        /// Confirmation window
        timeout: Duration,
    },
}

/// Gate requirement attached to a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Gate {
    /// Operator confirmation
    Confirmation {
        /// Prompt shown to the operator
        message: String,
        /// Confirmation level
        level: ConfirmationLevel,
    },
    /// Approval from one or more approvers
    Approval {
        /// Why approval is needed
        reason: String,
        /// Kind of approval
        approval_type: ApprovalType,
        /// Explicit approvers; empty means anyone allowed to approve
        approvers: Vec<String>,
        /// How long the approval request stays open
        expires_in: Duration,
    },
}

/// A gate bound to a specific step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatedStep {
    /// Step identifier
    pub step_id: String,
    /// Step name
    pub step_name: String,
    /// Gate requirement
    pub gate: Gate,
}

impl GatedStep {
    /// Whether this is an approval gate
    pub fn is_approval(&self) -> bool {
        matches!(self.gate, Gate::Approval { .. })
    }

    /// Check an operator's typed confirmation
    ///
    /// Type-to-confirm gates require a literal match; other confirmations accept
    /// any input. Approval gates are never satisfied by a confirmation.
    pub fn confirm(&self, input: &str) -> bool {
        match &self.gate {
            Gate::Confirmation {
                level: ConfirmationLevel::TypeToConfirm { text },
                ..
            } => input == text,
            Gate::Confirmation { .. } => true,
            Gate::Approval { .. } => false,
        }
    }

    /// Build the approval request for this gate
    ///
    /// Returns `None` for confirmation gates.
    pub fn approval_request(&self, execution_id: &str) -> Option<ApprovalRequest> {
        match &self.gate {
            Gate::Approval {
                reason,
                approval_type,
                approvers,
                expires_in,
            } => {
                let requested_at = Utc::now();
                let expires_at = requested_at
                    + chrono::Duration::from_std(*expires_in)
                        .unwrap_or_else(|_| chrono::Duration::hours(24));
                Some(ApprovalRequest {
                    id: uuid::Uuid::new_v4().to_string(),
                    execution_id: execution_id.to_string(),
                    step_id: self.step_id.clone(),
                    step_name: self.step_name.clone(),
                    reason: reason.clone(),
                    approval_type: *approval_type,
                    required_approvers: required_approvers(*approval_type),
                    approvers: approvers.clone(),
                    requested_at,
                    expires_at,
                })
            }
            Gate::Confirmation { .. } => None,
        }
    }
}

/// Builds gate descriptors
#[derive(Debug, Clone)]
pub struct GateBuilder {
    approval_expiry: Duration,
}

impl Default for GateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GateBuilder {
    /// Create a builder with the default 24h approval expiry
    pub fn new() -> Self {
        Self {
            approval_expiry: DEFAULT_APPROVAL_EXPIRY,
        }
    }

    /// Create a builder with a custom approval expiry
    pub fn with_approval_expiry(approval_expiry: Duration) -> Self {
        Self { approval_expiry }
    }

    /// Build a confirmation gate
    pub fn confirmation_gate(
        &self,
        step: &RunbookStep,
        message: impl Into<String>,
        level: ConfirmationLevel,
    ) -> GatedStep {
        GatedStep {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            gate: Gate::Confirmation {
                message: message.into(),
                level,
            },
        }
    }

    /// Build a type-to-confirm level for the given text
    pub fn type_to_confirm(text: impl Into<String>) -> ConfirmationLevel {
        ConfirmationLevel::TypeToConfirm { text: text.into() }
    }

    /// Build a timed confirmation level
    pub fn timed_confirmation() -> ConfirmationLevel {
        ConfirmationLevel::TimedConfirmation {
            timeout: TIMED_CONFIRMATION_TIMEOUT,
        }
    }

    /// Build an approval gate
    pub fn approval_gate(
        &self,
        step: &RunbookStep,
        reason: impl Into<String>,
        approval_type: ApprovalType,
        approvers: Option<Vec<String>>,
    ) -> GatedStep {
        GatedStep {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            gate: Gate::Approval {
                reason: reason.into(),
                approval_type,
                approvers: approvers.unwrap_or_default(),
                expires_in: self.approval_expiry,
            },
        }
    }

    /// Derive every gate a step carries
    pub fn gates_for_step(
        &self,
        step: &RunbookStep,
        analysis: &RunbookSafetyAnalysis,
    ) -> Vec<GatedStep> {
        let mut gates = Vec::new();

        if step.has_confirmation {
            let (message, level) = if step.is_destructive {
                (
                    format!(
                        "Step '{}' is destructive. Type {} to continue.",
                        step.name, DESTRUCTIVE_CONFIRMATION_TEXT
                    ),
                    Self::type_to_confirm(DESTRUCTIVE_CONFIRMATION_TEXT),
                )
            } else if step.affects_production {
                (
                    format!("Step '{}' affects production. Confirm to continue.", step.name),
                    Self::timed_confirmation(),
                )
            } else {
                (
                    format!("Confirm step '{}'", step.name),
                    ConfirmationLevel::Simple,
                )
            };
            gates.push(self.confirmation_gate(step, message, level));
        }

        if step.has_approval_gate {
            gates.push(self.approval_gate_for(step, analysis));
        }

        gates
    }

    /// Approval gate for a step, typed from the analysis finding
    pub fn approval_gate_for(
        &self,
        step: &RunbookStep,
        analysis: &RunbookSafetyAnalysis,
    ) -> GatedStep {
        let (reason, approval_type) = match analysis.approval_for(&step.id) {
            Some(requirement) => (requirement.reason.clone(), requirement.approval_type),
            None => match analysis.finding(&step.id) {
                Some(finding) => (finding.reason.clone(), ApprovalType::Single),
                None => (
                    format!("Step '{}' requires approval", step.name),
                    ApprovalType::Single,
                ),
            },
        };
        self.approval_gate(step, reason, approval_type, None)
    }
}
