//! Runbook definition parser

use crate::error::{RunbookError, RunbookResult};
use crate::models::RunbookDefinition;
use std::collections::HashSet;
use std::fmt::Display;

/// Serialization format of a runbook definition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunbookFormat {
    /// YAML document
    Yaml,
    /// JSON document
    Json,
}

impl RunbookFormat {
    /// Format implied by a file extension (`yaml`, `yml` or `json`)
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "yaml" | "yml" => Some(Self::Yaml),
            "json" => Some(Self::Json),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Yaml => "YAML",
            Self::Json => "JSON",
        }
    }
}

/// Parses and validates runbook definitions
pub struct RunbookParser;

impl RunbookParser {
    /// Parse and validate a runbook in the given format
    pub fn parse(content: &str, format: RunbookFormat) -> RunbookResult<RunbookDefinition> {
        let runbook = match format {
            RunbookFormat::Yaml => decoded(format, serde_yaml::from_str(content))?,
            RunbookFormat::Json => decoded(format, serde_json::from_str(content))?,
        };

        Self::validate(&runbook)?;
        Ok(runbook)
    }

    /// Serialize a runbook in the given format; JSON is pretty-printed
    pub fn serialize(runbook: &RunbookDefinition, format: RunbookFormat) -> RunbookResult<String> {
        match format {
            RunbookFormat::Yaml => encoded(format, serde_yaml::to_string(runbook)),
            RunbookFormat::Json => encoded(format, serde_json::to_string_pretty(runbook)),
        }
    }

    /// Parse a runbook from a YAML string
    pub fn parse_yaml(yaml_content: &str) -> RunbookResult<RunbookDefinition> {
        Self::parse(yaml_content, RunbookFormat::Yaml)
    }

    /// Parse a runbook from a JSON string
    pub fn parse_json(json_content: &str) -> RunbookResult<RunbookDefinition> {
        Self::parse(json_content, RunbookFormat::Json)
    }

    /// Serialize a runbook to YAML
    pub fn to_yaml(runbook: &RunbookDefinition) -> RunbookResult<String> {
        Self::serialize(runbook, RunbookFormat::Yaml)
    }

    /// Serialize a runbook to pretty JSON
    pub fn to_json(runbook: &RunbookDefinition) -> RunbookResult<String> {
        Self::serialize(runbook, RunbookFormat::Json)
    }

    /// Validate a runbook definition
    ///
    /// Validates:
    /// - Required fields (id, name, at least one step)
    /// - Step ids are non-empty and unique
    /// - Dependencies only name steps that appear earlier in the list
    /// - Timeouts are non-zero when present
    pub fn validate(runbook: &RunbookDefinition) -> RunbookResult<()> {
        if runbook.id.is_empty() {
            return Err(RunbookError::Invalid("Runbook id is required".to_string()));
        }

        if runbook.name.is_empty() {
            return Err(RunbookError::Invalid("Runbook name is required".to_string()));
        }

        if runbook.steps.is_empty() {
            return Err(RunbookError::Invalid(
                "Runbook must have at least one step".to_string(),
            ));
        }

        // Steps run in list order, so a dependency must already be seen
        let mut seen = HashSet::new();
        for step in &runbook.steps {
            if step.id.is_empty() {
                return Err(RunbookError::Invalid("Step id cannot be empty".to_string()));
            }
            if step.name.is_empty() {
                return Err(RunbookError::Invalid(format!(
                    "Step {} name cannot be empty",
                    step.id
                )));
            }
            if step.timeout_secs == Some(0) {
                return Err(RunbookError::Invalid(format!(
                    "Step {} timeout must be greater than zero",
                    step.id
                )));
            }
            for dep in &step.dependencies {
                if !seen.contains(dep.as_str()) {
                    let known = runbook.steps.iter().any(|s| &s.id == dep);
                    return Err(RunbookError::Invalid(if known {
                        format!(
                            "Step {} depends on step {} which runs after it",
                            step.id, dep
                        )
                    } else {
                        format!("Step {} depends on non-existent step {}", step.id, dep)
                    }));
                }
            }
            if !seen.insert(step.id.as_str()) {
                return Err(RunbookError::Invalid(format!(
                    "Duplicate step id: {}",
                    step.id
                )));
            }
        }

        Ok(())
    }
}

fn decoded<E: Display>(
    format: RunbookFormat,
    result: Result<RunbookDefinition, E>,
) -> RunbookResult<RunbookDefinition> {
    result.map_err(|e| RunbookError::Invalid(format!("Failed to parse {}: {}", format.label(), e)))
}

fn encoded<E: Display>(format: RunbookFormat, result: Result<String, E>) -> RunbookResult<String> {
    result.map_err(|e| {
        RunbookError::Invalid(format!("Failed to serialize to {}: {}", format.label(), e))
    })
}
