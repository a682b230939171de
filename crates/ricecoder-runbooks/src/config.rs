//! Engine configuration
//!
//! Values come from built-in defaults, an optional configuration file
//! (TOML, YAML or JSON, picked by extension) and `RICECODER_RUNBOOKS_*`
//! environment variables, in increasing order of precedence.

use crate::error::{RunbookError, RunbookResult};
use crate::gates::GateBuilder;
use crate::retry::RetryPolicy;
use crate::safety::{DangerPolicy, SafetyAnalyzer};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "RICECODER_RUNBOOKS";

/// Runbook engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunbookConfig {
    /// How often a paused runner checks whether it was resumed
    pub pause_poll_interval_ms: u64,
    /// Simulated duration of a dry-run step
    pub dry_run_step_delay_ms: u64,
    /// Delay before the first automatic retry
    pub retry_base_delay_ms: u64,
    /// Cap on any single retry delay
    pub max_retry_delay_ms: u64,
    /// How long approval requests stay open
    pub approval_expiry_secs: u64,
    /// Duration estimate for steps without a timeout
    pub default_step_timeout_secs: u64,
    /// Event bus capacity
    pub event_channel_capacity: usize,
    /// How long an abort waits for an in-flight step before finishing
    pub abort_grace_period_ms: u64,
    /// Danger classification policy
    pub safety: DangerPolicy,
}

impl Default for RunbookConfig {
    fn default() -> Self {
        Self {
            pause_poll_interval_ms: 1000,
            dry_run_step_delay_ms: 100,
            retry_base_delay_ms: 1000,
            max_retry_delay_ms: 60_000,
            approval_expiry_secs: 24 * 60 * 60,
            default_step_timeout_secs: 30,
            event_channel_capacity: 1024,
            abort_grace_period_ms: 5000,
            safety: DangerPolicy::default(),
        }
    }
}

impl RunbookConfig {
    /// Load from an optional file plus `RICECODER_RUNBOOKS_*` overrides
    pub fn load(path: Option<&Path>) -> RunbookResult<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    /// Load using a custom environment prefix
    pub fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> RunbookResult<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(false));
        }
        builder = builder.add_source(Environment::with_prefix(env_prefix).try_parsing(true));

        let config: RunbookConfig = builder.build()?.try_deserialize()?;
        config.validate()?;

        tracing::debug!(
            pause_poll_interval_ms = config.pause_poll_interval_ms,
            retry_base_delay_ms = config.retry_base_delay_ms,
            "Runbook configuration loaded"
        );
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(content: &str) -> RunbookResult<Self> {
        let config: RunbookConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> RunbookResult<()> {
        if self.pause_poll_interval_ms == 0 {
            return Err(RunbookError::Config(
                "pause_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.retry_base_delay_ms {
            return Err(RunbookError::Config(format!(
                "max_retry_delay_ms ({}) must not be below retry_base_delay_ms ({})",
                self.max_retry_delay_ms, self.retry_base_delay_ms
            )));
        }
        if self.approval_expiry_secs == 0 {
            return Err(RunbookError::Config(
                "approval_expiry_secs must be greater than zero".to_string(),
            ));
        }
        if self.default_step_timeout_secs == 0 {
            return Err(RunbookError::Config(
                "default_step_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(RunbookError::Config(
                "event_channel_capacity must be greater than zero".to_string(),
            ));
        }
        if self
            .safety
            .dangerous_keywords
            .iter()
            .chain(&self.safety.critical_context_keywords)
            .any(|k| k.trim().is_empty())
        {
            return Err(RunbookError::Config(
                "safety keywords must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Pause poll interval
    pub fn pause_poll_interval(&self) -> Duration {
        Duration::from_millis(self.pause_poll_interval_ms)
    }

    /// Dry-run step delay
    pub fn dry_run_step_delay(&self) -> Duration {
        Duration::from_millis(self.dry_run_step_delay_ms)
    }

    /// Approval expiry
    pub fn approval_expiry(&self) -> Duration {
        Duration::from_secs(self.approval_expiry_secs)
    }

    /// Estimated duration of a step without a timeout
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }

    /// Abort grace period
    pub fn abort_grace_period(&self) -> Duration {
        Duration::from_millis(self.abort_grace_period_ms)
    }

    /// Backoff policy for automatic retries
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.retry_base_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
        )
    }

    /// Analyzer using the configured policy and expiry
    pub fn analyzer(&self) -> SafetyAnalyzer {
        SafetyAnalyzer::with_policy(self.safety.clone()).with_approval_expiry(self.approval_expiry())
    }

    /// Gate builder using the configured expiry
    pub fn gate_builder(&self) -> GateBuilder {
        GateBuilder::with_approval_expiry(self.approval_expiry())
    }
}
