//! Safety analysis for runbook steps
//!
//! Classifies each step by danger using a keyword rule table, derives the
//! approvals a runbook needs and the warnings about missing gates, and rolls
//! everything up into an overall risk verdict.

use crate::models::{
    ApprovalRequirement, ApprovalType, DangerLevel, DangerousStep, RiskLevel, RunbookDefinition,
    RunbookSafetyAnalysis, RunbookStep,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default approval expiry (24 hours)
pub const DEFAULT_APPROVAL_EXPIRY: Duration = Duration::from_secs(24 * 60 * 60);

/// Distinct approvers needed for a multi-person approval
pub const MULTI_PERSON_APPROVERS: u32 = 2;

/// Number of dangerous findings above which a runbook is at least medium risk
const MEDIUM_RISK_FINDING_COUNT: usize = 3;

/// A row of the danger decision table
///
/// Each condition is either required (`Some(true)`), required absent
/// (`Some(false)`) or ignored (`None`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DangerRule {
    /// Condition on a dangerous keyword match
    #[serde(default)]
    pub dangerous: Option<bool>,
    /// Condition on a critical-context keyword match
    #[serde(default)]
    pub critical_context: Option<bool>,
    /// Condition on the step's production flag
    #[serde(default)]
    pub affects_production: Option<bool>,
    /// Level assigned when the row matches
    pub level: DangerLevel,
}

impl DangerRule {
    fn new(
        dangerous: Option<bool>,
        critical_context: Option<bool>,
        affects_production: Option<bool>,
        level: DangerLevel,
    ) -> Self {
        Self {
            dangerous,
            critical_context,
            affects_production,
            level,
        }
    }

    fn matches(&self, signals: &DangerSignals) -> bool {
        fn check(condition: Option<bool>, value: bool) -> bool {
            condition.map_or(true, |expected| expected == value)
        }

        check(self.dangerous, signals.dangerous_keyword.is_some())
            && check(self.critical_context, signals.critical_keyword.is_some())
            && check(self.affects_production, signals.affects_production)
    }
}

/// Keyword matches and flags observed on a step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DangerSignals {
    /// First dangerous keyword found
    pub dangerous_keyword: Option<String>,
    /// First critical-context keyword found
    pub critical_keyword: Option<String>,
    /// Step production flag
    pub affects_production: bool,
}

/// Data-driven danger classification policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DangerPolicy {
    /// Keywords naming destructive operations
    pub dangerous_keywords: Vec<String>,
    /// Keywords naming critical targets
    pub critical_context_keywords: Vec<String>,
    /// Ordered decision table; first matching row wins
    pub rules: Vec<DangerRule>,
}

impl Default for DangerPolicy {
    fn default() -> Self {
        let words = |list: &[&str]| list.iter().map(|w| w.to_string()).collect();
        Self {
            dangerous_keywords: words(&[
                "delete", "remove", "drop", "truncate", "destroy", "terminate", "shutdown",
                "kill", "purge", "wipe", "format",
            ]),
            critical_context_keywords: words(&["production", "prod", "database", "cluster", "all"]),
            rules: vec![
                DangerRule::new(Some(true), Some(true), Some(true), DangerLevel::Critical),
                DangerRule::new(Some(true), None, Some(true), DangerLevel::High),
                DangerRule::new(Some(true), Some(true), None, DangerLevel::High),
                DangerRule::new(Some(true), None, None, DangerLevel::Medium),
                DangerRule::new(None, None, Some(true), DangerLevel::Medium),
            ],
        }
    }
}

impl DangerPolicy {
    /// Collect the keyword matches and flags for a step
    pub fn signals(&self, step: &RunbookStep) -> DangerSignals {
        let mut text = step.name.to_lowercase();
        if let Some(command) = &step.command {
            text.push(' ');
            text.push_str(&command.to_lowercase());
        }

        let find = |keywords: &[String]| {
            keywords
                .iter()
                .find(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
                .cloned()
        };

        DangerSignals {
            dangerous_keyword: find(&self.dangerous_keywords),
            critical_keyword: find(&self.critical_context_keywords),
            affects_production: step.affects_production,
        }
    }

    /// Evaluate the decision table against a set of signals
    pub fn level_for(&self, signals: &DangerSignals) -> DangerLevel {
        self.rules
            .iter()
            .find(|rule| rule.matches(signals))
            .map(|rule| rule.level)
            .unwrap_or(DangerLevel::None)
    }

    /// Classify a step
    pub fn classify(&self, step: &RunbookStep) -> DangerLevel {
        self.level_for(&self.signals(step))
    }
}

/// Computes safety verdicts for runbooks
#[derive(Debug, Clone)]
pub struct SafetyAnalyzer {
    policy: DangerPolicy,
    approval_expiry: Duration,
}

impl Default for SafetyAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyAnalyzer {
    /// Create an analyzer with the default policy
    pub fn new() -> Self {
        Self {
            policy: DangerPolicy::default(),
            approval_expiry: DEFAULT_APPROVAL_EXPIRY,
        }
    }

    /// Create an analyzer with a custom policy
    pub fn with_policy(policy: DangerPolicy) -> Self {
        Self {
            policy,
            approval_expiry: DEFAULT_APPROVAL_EXPIRY,
        }
    }

    /// Override the approval expiry
    pub fn with_approval_expiry(mut self, expiry: Duration) -> Self {
        self.approval_expiry = expiry;
        self
    }

    /// The policy in use
    pub fn policy(&self) -> &DangerPolicy {
        &self.policy
    }

    /// Analyze a runbook
    pub fn analyze(&self, runbook: &RunbookDefinition) -> RunbookSafetyAnalysis {
        let mut dangerous_steps = Vec::new();
        let mut required_approvals = Vec::new();
        let mut warnings = Vec::new();

        for step in &runbook.steps {
            let signals = self.policy.signals(step);
            let level = self.policy.level_for(&signals);

            if level > DangerLevel::None {
                let reason = describe_danger(&signals);
                if level >= DangerLevel::High {
                    required_approvals.push(self.approval_requirement(step, level, &reason));
                }
                dangerous_steps.push(DangerousStep {
                    step_id: step.id.clone(),
                    step_name: step.name.clone(),
                    danger_level: level,
                    reason,
                    mitigations: mitigations_for(step, level),
                });
            }

            if step.is_destructive && !step.has_confirmation {
                warnings.push(format!(
                    "Step '{}' is destructive but has no confirmation gate",
                    step.name
                ));
            }
            if step.affects_production && !step.has_approval_gate {
                warnings.push(format!(
                    "Step '{}' affects production but has no approval gate",
                    step.name
                ));
            }
        }

        let overall_risk = overall_risk(&dangerous_steps);
        let can_run_automatically = overall_risk <= RiskLevel::Low && required_approvals.is_empty();
        let recommends_dry_run = !dangerous_steps.is_empty();

        tracing::debug!(
            runbook_id = %runbook.id,
            overall_risk = ?overall_risk,
            findings = dangerous_steps.len(),
            approvals = required_approvals.len(),
            "Runbook safety analysis complete"
        );

        RunbookSafetyAnalysis {
            runbook_id: runbook.id.clone(),
            overall_risk,
            dangerous_steps,
            required_approvals,
            warnings,
            can_run_automatically,
            recommends_dry_run,
            analyzed_at: Utc::now(),
        }
    }

    fn approval_requirement(
        &self,
        step: &RunbookStep,
        level: DangerLevel,
        reason: &str,
    ) -> ApprovalRequirement {
        let approval_type = if level == DangerLevel::Critical {
            ApprovalType::MultiPerson
        } else {
            ApprovalType::Single
        };

        ApprovalRequirement {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            approval_type,
            required_approvers: required_approvers(approval_type),
            reason: reason.to_string(),
            expires_in: self.approval_expiry,
        }
    }
}

/// Number of distinct approvers an approval type needs
pub fn required_approvers(approval_type: ApprovalType) -> u32 {
    match approval_type {
        ApprovalType::Single => 1,
        ApprovalType::MultiPerson => MULTI_PERSON_APPROVERS,
    }
}

fn overall_risk(findings: &[DangerousStep]) -> RiskLevel {
    if findings.is_empty() {
        return RiskLevel::Low;
    }
    if findings.iter().any(|f| f.danger_level == DangerLevel::Critical) {
        return RiskLevel::Critical;
    }
    if findings.iter().any(|f| f.danger_level == DangerLevel::High) {
        return RiskLevel::High;
    }
    if findings.len() > MEDIUM_RISK_FINDING_COUNT {
        return RiskLevel::Medium;
    }
    RiskLevel::Low
}

fn describe_danger(signals: &DangerSignals) -> String {
    let mut parts = Vec::new();
    if let Some(keyword) = &signals.dangerous_keyword {
        parts.push(format!("dangerous operation '{}'", keyword));
    }
    if let Some(keyword) = &signals.critical_keyword {
        parts.push(format!("critical context '{}'", keyword));
    }
    if signals.affects_production {
        parts.push("affects production".to_string());
    }
    let mut reason = parts.join(", ");
    if let Some(first) = reason.get(..1) {
        reason = first.to_uppercase() + &reason[1..];
    }
    reason
}

fn mitigations_for(step: &RunbookStep, level: DangerLevel) -> Vec<String> {
    let mut mitigations = vec!["Run a dry run before executing".to_string()];

    if step.is_destructive || level >= DangerLevel::High {
        mitigations.push("Take a backup or snapshot of affected resources".to_string());
    }
    if !step.has_confirmation {
        mitigations.push("Add a confirmation gate to the step".to_string());
    }
    if level >= DangerLevel::High && !step.has_approval_gate {
        mitigations.push("Add an approval gate to the step".to_string());
    }
    if level == DangerLevel::Critical {
        mitigations.push("Require sign-off from a second operator".to_string());
    }

    mitigations
}
