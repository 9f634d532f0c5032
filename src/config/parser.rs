//! Settings parser for loading engine configuration.
//!
//! This module handles loading settings from YAML files, `.env` files and
//! environment variables, with environment values taking precedence.

use crate::error::{ConfigError, ConvergeError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

use super::spec::{EngineConfig, StateBackend};

/// Settings parser.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Directory holding the `.env` file.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new settings parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the directory searched for `.env`.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads settings from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
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

    /// Parses settings from a YAML string. An empty document yields defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<EngineConfig> {
        debug!("Parsing YAML configuration");

        if content.trim().is_empty() {
            return Ok(EngineConfig::default());
        }

        let config: EngineConfig = serde_yaml::from_str(content).map_err(|e| {
            let location = source.map(|p| p.display().to_string());
            ConvergeError::Config(ConfigError::ParseError {
                message: format!("YAML parse error: {e}"),
                location,
            })
        })?;

        debug!(
            "Parsed configuration: {} backend, key '{}'",
            config.state.backend, config.state.key
        );
        Ok(config)
    }

    /// Loads settings with `.env` and environment overrides applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or an
    /// override holds an unusable value.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<EngineConfig> {
        self.load_dotenv()?;
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config)?;
        Ok(config)
    }

    /// Applies `HALLDYLL_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnvVar`] for values that do not parse.
    pub fn apply_env_overrides(config: &mut EngineConfig) -> Result<()> {
        Self::apply_overrides_from(config, |name| std::env::var(name).ok())
    }

    fn apply_overrides_from<F>(config: &mut EngineConfig, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(key) = var("HALLDYLL_STATE_KEY") {
            debug!("Overriding state.key from environment");
            config.state.key = key;
        }

        if let Some(backend) = var("HALLDYLL_STATE_BACKEND") {
            debug!("Overriding state.backend from environment");
            config.state.backend = StateBackend::from_str(&backend)
                .map_err(|_| invalid_env("HALLDYLL_STATE_BACKEND", &backend))?;
        }

        if let Some(bucket) = var("HALLDYLL_STATE_BUCKET") {
            debug!("Overriding state.bucket from environment");
            config.state.bucket = Some(bucket);
        }

        if let Some(prefix) = var("HALLDYLL_STATE_PREFIX") {
            debug!("Overriding state.prefix from environment");
            config.state.prefix = Some(prefix);
        }

        if let Some(region) = var("HALLDYLL_STATE_REGION") {
            debug!("Overriding state.region from environment");
            config.state.region = Some(region);
        }

        if let Some(parallelism) = var("HALLDYLL_PARALLELISM") {
            debug!("Overriding execution.parallelism from environment");
            config.execution.parallelism = parallelism
                .parse()
                .map_err(|_| invalid_env("HALLDYLL_PARALLELISM", &parallelism))?;
        }

        if let Some(level) = var("HALLDYLL_LOG_LEVEL") {
            debug!("Overriding logging.level from environment");
            config.logging.level = level;
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

fn invalid_env(name: &str, value: &str) -> ConvergeError {
    ConvergeError::Config(ConfigError::InvalidEnvVar {
        name: name.to_string(),
        value: value.to_string(),
    })
}

/// Default settings file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &["halldyll.converge.yaml", "halldyll.converge.yml"];

/// Finds the settings file in `start_dir` or its parents.
///
/// # Errors
///
/// Returns an error if no settings file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
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
    use crate::config::{LogFormat, ReadThrough};
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_parse_empty_config() {
        let config = ConfigParser::new().parse_yaml("", None).expect("defaults");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r"
state:
  backend: s3
  key: network/prod
  bucket: halldyll-state
  prefix: infra
lock:
  lease_secs: 120
execution:
  parallelism: 4
  apply_deadline_secs: 3600
diff:
  read_through: refresh
logging:
  level: debug
  format: json
";
        let config = ConfigParser::new().parse_yaml(yaml, None).expect("valid config");
        assert_eq!(config.state.backend, StateBackend::S3);
        assert_eq!(config.state.key, "network/prod");
        assert_eq!(config.state.bucket.as_deref(), Some("halldyll-state"));
        assert_eq!(config.lock.lease_secs, 120);
        assert_eq!(config.lock.acquire_timeout_secs, 60);
        assert_eq!(config.execution.parallelism, 4);
        assert_eq!(config.execution.max_attempts, 3);
        assert_eq!(config.execution.apply_deadline_secs, Some(3600));
        assert_eq!(config.diff.read_through, ReadThrough::Refresh);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = ConfigParser::new()
            .parse_yaml("state: [", Some(Path::new("halldyll.converge.yaml")))
            .expect_err("invalid yaml");
        match err {
            ConvergeError::Config(ConfigError::ParseError { location, .. }) => {
                assert_eq!(location.as_deref(), Some("halldyll.converge.yaml"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_env_overrides() {
        let vars = HashMap::from([
            ("HALLDYLL_STATE_KEY", "staging"),
            ("HALLDYLL_STATE_BACKEND", "memory"),
            ("HALLDYLL_PARALLELISM", "2"),
            ("HALLDYLL_LOG_LEVEL", "warn"),
        ]);
        let mut config = EngineConfig::default();
        ConfigParser::apply_overrides_from(&mut config, |name| vars.get(name).map(ToString::to_string))
            .expect("valid overrides");

        assert_eq!(config.state.key, "staging");
        assert_eq!(config.state.backend, StateBackend::Memory);
        assert_eq!(config.execution.parallelism, 2);
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_invalid_env_override() {
        let mut config = EngineConfig::default();
        let err = ConfigParser::apply_overrides_from(&mut config, |name| {
            (name == "HALLDYLL_PARALLELISM").then(|| String::from("many"))
        })
        .expect_err("not a number");
        assert!(matches!(err, ConvergeError::Config(ConfigError::InvalidEnvVar { .. })));
    }

    #[test]
    fn test_find_config_file_searches_parents() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");
        std::fs::write(temp.path().join("halldyll.converge.yaml"), "state:\n  key: root\n")
            .expect("write");

        let found = find_config_file(&nested).expect("found in parent");
        assert_eq!(found, temp.path().join("halldyll.converge.yaml"));

        let config = ConfigParser::new().load_file(&found).expect("load");
        assert_eq!(config.state.key, "root");
    }

    #[test]
    fn test_load_missing_file() {
        let temp = TempDir::new().expect("temp dir");
        let err = ConfigParser::new()
            .load_file(temp.path().join("missing.yaml"))
            .expect_err("missing");
        assert!(matches!(err, ConvergeError::Config(ConfigError::FileNotFound { .. })));
    }
}
