//! Configuration validation.
//!
//! Structural checks that do not need provider schemas. Every problem is
//! collected so a single run reports all of them; schema conformance and
//! reference resolution happen later, during planning.

use crate::error::{ConfigError, ConvergeError, Result};
use crate::value::AttrPath;
use std::collections::HashSet;
use tracing::debug;

use super::spec::{DeployConfig, ModuleConfig, ResourceConfig, StateBackend};

/// Validator for configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates a configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any check fails. Use
    /// [`ConfigValidator::check`] to get every error.
    pub fn validate(&self, config: &DeployConfig) -> Result<ValidationResult> {
        let result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(ConvergeError::Config(ConfigError::ValidationError {
                message: first_error.message.clone(),
                field: Some(first_error.field.clone()),
            }))
        }
    }

    /// Runs every check and returns all findings.
    #[must_use]
    pub fn check(&self, config: &DeployConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_project(config, &mut result);
        Self::validate_state(config, &mut result);
        Self::validate_settings(config, &mut result);

        if config.resources.is_empty() && config.data.is_empty() && config.modules.is_empty() {
            result.warnings.push(String::from("No resources defined in configuration"));
        }

        Self::validate_blocks(&config.resources, "resources", &mut result);
        Self::validate_blocks(&config.data, "data", &mut result);
        Self::validate_modules(&config.modules, "modules", &mut result);

        result
    }

    fn validate_project(config: &DeployConfig, result: &mut ValidationResult) {
        let project = &config.project;
        if project.name.is_empty() {
            result.error("project.name", "Project name cannot be empty");
        } else if !is_valid_name(&project.name) {
            result.error(
                "project.name",
                format!(
                    "Project name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    project.name
                ),
            );
        }

        if project.environment.is_empty() {
            result.error("project.environment", "Environment cannot be empty");
        }
    }

    fn validate_state(config: &DeployConfig, result: &mut ValidationResult) {
        let state = &config.state;
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error("state.bucket", "S3 bucket name is required when using S3 backend");
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket is ignored by the local backend"));
                }
            }
        }
    }

    fn validate_settings(config: &DeployConfig, result: &mut ValidationResult) {
        let settings = &config.settings;
        if settings.parallelism == 0 {
            result.error("settings.parallelism", "Parallelism must be at least 1");
        }
        if settings.operation_timeout_secs == 0 {
            result.error("settings.operation_timeout_secs", "Operation timeout must be positive");
        }
        if settings.max_replan_attempts == 0 {
            result.error("settings.max_replan_attempts", "At least one plan attempt is required");
        }
        if settings.retry.max_attempts == 0 {
            result.error("settings.retry.max_attempts", "Retry attempts must be at least 1");
        }
        if settings.retry.multiplier < 1.0 {
            result.error("settings.retry.multiplier", "Backoff multiplier must be at least 1.0");
        }
        if settings.retry.initial_backoff_ms > settings.retry.max_backoff_ms {
            result.error(
                "settings.retry.initial_backoff_ms",
                "Initial backoff cannot exceed the maximum backoff",
            );
        }
    }

    fn validate_blocks(blocks: &[ResourceConfig], prefix: &str, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, block) in blocks.iter().enumerate() {
            let field = format!("{prefix}[{i}]");

            if !is_identifier(&block.resource_type) || !block.resource_type.contains('_') {
                result.error(
                    format!("{field}.type"),
                    format!(
                        "Resource type '{}' is invalid. Expected PROVIDER_KIND, e.g. local_file.",
                        block.resource_type
                    ),
                );
            }

            if !is_identifier(&block.name) {
                result.error(
                    format!("{field}.name"),
                    format!("Resource name '{}' is invalid", block.name),
                );
            }

            if !seen.insert((block.resource_type.as_str(), block.name.as_str())) {
                result.error(
                    format!("{field}.name"),
                    format!("Duplicate {}.{}", block.resource_type, block.name),
                );
            }

            if block.count.is_some() && block.for_each.is_some() {
                result.error(field.clone(), "count and for_each are mutually exclusive");
            }

            for (j, dep) in block.depends_on.iter().enumerate() {
                if dep.trim().is_empty() || dep.contains("${") {
                    result.error(
                        format!("{field}.depends_on[{j}]"),
                        "depends_on entries are plain TYPE.NAME references",
                    );
                }
            }

            for (j, path) in block.lifecycle.ignore_changes.iter().enumerate() {
                if let Err(e) = path.parse::<AttrPath>() {
                    result.error(format!("{field}.lifecycle.ignore_changes[{j}]"), e);
                }
            }
        }
    }

    fn validate_modules(modules: &[ModuleConfig], prefix: &str, result: &mut ValidationResult) {
        let mut seen = HashSet::new();

        for (i, module) in modules.iter().enumerate() {
            let field = format!("{prefix}[{i}]");

            if !is_identifier(&module.name) {
                result.error(format!("{field}.name"), format!("Module name '{}' is invalid", module.name));
            }
            if !seen.insert(module.name.as_str()) {
                result.error(format!("{field}.name"), format!("Duplicate module {}", module.name));
            }
            if module.count.is_some() && module.for_each.is_some() {
                result.error(field.clone(), "count and for_each are mutually exclusive");
            }

            Self::validate_blocks(&module.resources, &format!("{field}.resources"), result);
            Self::validate_blocks(&module.data, &format!("{field}.data"), result);
            Self::validate_modules(&module.modules, &format!("{field}.modules"), result);
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {}
        _ => return false,
    }

    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.ends_with('-')
        && !name.contains("--")
}

/// Resource types and names: a letter or underscore, then letters, digits,
/// underscores or hyphens.
fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_name() {
        assert!(is_valid_name("site"));
        assert!(is_valid_name("my-site-123"));
        assert!(is_valid_name("a"));
    }

    #[test]
    fn test_invalid_name() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Site")); // uppercase
        assert!(!is_valid_name("123-site")); // starts with number
        assert!(!is_valid_name("my_site")); // underscore
        assert!(!is_valid_name("site-")); // ends with hyphen
        assert!(!is_valid_name("my--site")); // consecutive hyphens
    }

    #[test]
    fn test_identifier() {
        assert!(is_identifier("local_file"));
        assert!(is_identifier("_x-1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("a.b"));
    }

    #[test]
    fn test_collects_every_error() {
        let yaml = r"
project: {name: Bad_Name}
settings: {parallelism: 0}
state: {backend: s3}
resources:
  - {type: null_resource, name: a, count: 2, for_each: [x]}
  - {type: null_resource, name: a}
";
        let config: DeployConfig = serde_yaml::from_str(yaml).unwrap();
        let result = ConfigValidator::new().check(&config);
        let fields: Vec<&str> = result.errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"project.name"));
        assert!(fields.contains(&"settings.parallelism"));
        assert!(fields.contains(&"state.bucket"));
        assert!(fields.contains(&"resources[0]"));
        assert!(fields.contains(&"resources[1].name"));
        assert!(ConfigValidator::new().validate(&config).is_err());
    }

    #[test]
    fn test_empty_config_warns() {
        let config = DeployConfig::empty("demo");
        let result = ConfigValidator::new().validate(&config).unwrap();
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 1);
    }
}
