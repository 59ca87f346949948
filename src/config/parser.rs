//! Configuration parser for loading configuration files.
//!
//! This module handles loading configuration from YAML files and environment
//! variables, with proper precedence and error handling.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::spec::DeployConfig;

/// Configuration parser for loading configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        if !path.exists() {
            return Err(ConvergeError::Config(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }));
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("Failed to read file: {e}"),
                location: Some(path.display().to_string()),
            })
        })?;

        self.parse_yaml(&content, Some(path))
    }

    /// Parses configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DeployConfig> {
        debug!("Parsing YAML configuration");

        let config: DeployConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = match (source, e.location()) {
                (Some(p), Some(loc)) => Some(format!("{}:{}:{}", p.display(), loc.line(), loc.column())),
                (Some(p), None) => Some(p.display().to_string()),
                (None, Some(loc)) => Some(format!("line {} column {}", loc.line(), loc.column())),
                (None, None) => None,
            };
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration for project {} ({} resources, {} data sources, {} modules)",
            config.project.name,
            config.resources.len(),
            config.data.len(),
            config.modules.len()
        );
        Ok(config)
    }

    /// Loads configuration with environment variable overrides.
    ///
    /// Environment variables are checked in the format
    /// `CONVERGE_<SECTION>_<KEY>` (e.g. `CONVERGE_PROJECT_NAME`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an override
    /// has an invalid value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<DeployConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse.
    pub fn apply_env_overrides(config: &mut DeployConfig) -> Result<()> {
        if let Ok(name) = std::env::var("CONVERGE_PROJECT_NAME") {
            debug!("Overriding project.name from environment");
            config.project.name = name;
        }

        if let Ok(env) = std::env::var("CONVERGE_PROJECT_ENVIRONMENT") {
            debug!("Overriding project.environment from environment");
            config.project.environment = env;
        }

        if let Ok(bucket) = std::env::var("CONVERGE_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var("CONVERGE_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Ok(path) = std::env::var("CONVERGE_STATE_PATH") {
            debug!("Overriding state.path from environment");
            config.state.path = Some(path);
        }

        if let Ok(value) = std::env::var("CONVERGE_PARALLELISM") {
            debug!("Overriding settings.parallelism from environment");
            config.settings.parallelism = value.parse().map_err(|_| {
                ConvergeError::Config(ConfigError::validation(
                    format!("CONVERGE_PARALLELISM must be a positive integer, got \"{value}\""),
                    "settings.parallelism",
                ))
            })?;
        }

        Ok(())
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| {
                ConvergeError::Config(ConfigError::ParseError {
                    message: format!("Failed to load .env file: {e}"),
                    location: Some(env_path.display().to_string()),
                })
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["converge.yaml", "converge.yml"];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        let found: Vec<PathBuf> = DEFAULT_CONFIG_FILES
            .iter()
            .map(|name| current.join(name))
            .filter(|p| p.exists())
            .collect();
        if let Some(first) = found.first() {
            if found.len() > 1 {
                warn!("Multiple configuration files in {}, using {}", current.display(), first.display());
            }
            info!("Found configuration file: {}", first.display());
            return Ok(first.clone());
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConvergeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_minimal_config() {
        let yaml = r"
project:
  name: test-project
state:
  backend: local
";
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "test-project");
        assert_eq!(config.project.environment, "dev");
        assert!(config.resources.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
project:
  name: site
  environment: prod

settings:
  parallelism: 4
  retry:
    max_attempts: 2

state:
  backend: s3
  bucket: converge-state
  prefix: site/prod

guardrails:
  max_destroy: 3

providers:
  local:
    serialize: true

data:
  - type: local_file
    name: seed
    attributes:
      filename: seed.txt

resources:
  - type: local_file
    name: motd
    count: 2
    lifecycle:
      ignore_changes: [content]
    attributes:
      filename: "motd-${count.index}.txt"
      content: "${data.local_file.seed.content}"
"#;
        let config = ConfigParser::new().parse_yaml(yaml, None).unwrap();
        assert_eq!(config.project.name, "site");
        assert_eq!(config.settings.parallelism, 4);
        assert_eq!(config.settings.retry.max_attempts, 2);
        assert_eq!(config.settings.retry.initial_backoff_ms, 500);
        assert_eq!(config.max_destroy(), Some(3));
        assert!(config.provider_serialized("local"));
        assert_eq!(config.resources[0].count, Some(2));
        assert_eq!(config.resources[0].lifecycle.ignore_changes, vec!["content"]);
    }

    #[test]
    fn test_parse_error_has_location() {
        let err = ConfigParser::new()
            .parse_yaml("project: [unclosed", Some(Path::new("converge.yaml")))
            .unwrap_err();
        match err {
            ConvergeError::Config(ConfigError::ParseError { location, .. }) => {
                assert!(location.unwrap().starts_with("converge.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_find_config_file_walks_up() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("converge.yml"), "project: {name: x}\n").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();

        let found = find_config_file(&nested).unwrap();
        assert_eq!(found, dir.path().join("converge.yml"));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = ConfigParser::new().load_file(dir.path().join("nope.yaml")).unwrap_err();
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_init_template_is_valid() {
        let template = include_str!("../../templates/converge.yaml");
        let config = ConfigParser::new().parse_yaml(template, None).unwrap();
        let result = crate::config::ConfigValidator::new().check(&config);
        assert!(result.errors.is_empty(), "{:?}", result.errors);
        assert_eq!(config.resources.len(), 2);
        assert_eq!(config.data.len(), 1);
    }
}
