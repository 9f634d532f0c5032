//! Settings validation.
//!
//! Collects every error and warning before failing, so a single run
//! reports all problems in a settings file.

use crate::error::{ConfigError, ConvergeError, Result};
use tracing::{debug, warn};

use super::spec::{EngineConfig, ExecutionConfig, LockConfig, StateBackend, StateConfig};

/// Validator for engine settings.
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

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Validates engine settings.
    ///
    /// # Errors
    ///
    /// Returns the first error found, if any.
    pub fn validate(&self, config: &EngineConfig) -> Result<ValidationResult> {
        let mut result = ValidationResult::default();

        Self::validate_state(&config.state, &mut result);
        Self::validate_lock(&config.lock, &mut result);
        Self::validate_execution(&config.execution, &mut result);

        for warning in &result.warnings {
            warn!("{warning}");
        }

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

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        if !is_valid_key(&state.key) {
            result.error(
                "state.key",
                format!(
                    "State key '{}' is invalid. Use '/'-separated segments of letters, digits, '-', '_' or '.'",
                    state.key
                ),
            );
        }

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
                        .push(String::from("state.bucket is ignored with local backend"));
                }
            }
            StateBackend::Memory => {
                result
                    .warnings
                    .push(String::from("memory backend keeps no state across runs"));
            }
        }
    }

    /// Validates lock timings.
    fn validate_lock(lock: &LockConfig, result: &mut ValidationResult) {
        if lock.lease_secs == 0 {
            result.error("lock.lease_secs", "Lock lease must be at least 1 second");
        }

        if lock.retry_interval_ms == 0 {
            result.error("lock.retry_interval_ms", "Lock retry interval must be positive");
        } else if lock.retry_interval_ms > lock.acquire_timeout_secs.saturating_mul(1000)
            && lock.acquire_timeout_secs > 0
        {
            result.warnings.push(String::from(
                "lock.retry_interval_ms exceeds the acquire timeout; only one retry will happen",
            ));
        }
    }

    /// Validates executor tuning.
    fn validate_execution(execution: &ExecutionConfig, result: &mut ValidationResult) {
        if execution.parallelism == 0 {
            result.error("execution.parallelism", "Parallelism must be at least 1");
        }

        if execution.max_attempts == 0 {
            result.error("execution.max_attempts", "max_attempts must be at least 1");
        }

        if execution.initial_backoff_ms > execution.max_backoff_ms {
            result.error(
                "execution.initial_backoff_ms",
                format!(
                    "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                    execution.initial_backoff_ms, execution.max_backoff_ms
                ),
            );
        }

        if execution.action_timeout_secs == 0 {
            result.error("execution.action_timeout_secs", "Action timeout must be at least 1 second");
        }

        if execution.apply_deadline_secs == Some(0) {
            result.error("execution.apply_deadline_secs", "Apply deadline must be at least 1 second");
        }
    }
}

/// Checks a state-store key: non-empty `/`-separated segments of ASCII
/// alphanumerics, `-`, `_` or `.`, with no `.` or `..` segment.
fn is_valid_key(key: &str) -> bool {
    if key.is_empty() {
        return false;
    }

    key.split('/').all(|segment| {
        !segment.is_empty()
            && segment != "."
            && segment != ".."
            && segment
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    })
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }

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
    fn test_valid_key() {
        assert!(is_valid_key("default"));
        assert!(is_valid_key("network/prod"));
        assert!(is_valid_key("app_v2.state"));
    }

    #[test]
    fn test_invalid_key() {
        assert!(!is_valid_key(""));
        assert!(!is_valid_key("/prod"));
        assert!(!is_valid_key("prod/"));
        assert!(!is_valid_key("a//b"));
        assert!(!is_valid_key("../escape"));
        assert!(!is_valid_key("with space"));
    }

    #[test]
    fn test_defaults_are_valid() {
        let result = ConfigValidator::new()
            .validate(&EngineConfig::default())
            .expect("defaults validate");
        assert!(result.is_valid());
        assert_eq!(result.warning_count(), 0);
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = EngineConfig::default();
        config.state.backend = StateBackend::S3;

        let err = ConfigValidator::new().validate(&config).expect_err("bucket missing");
        match err {
            ConvergeError::Config(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field.as_deref(), Some("state.bucket"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_all_errors_collected() {
        let mut config = EngineConfig::default();
        config.execution.parallelism = 0;
        config.execution.max_attempts = 0;
        config.execution.initial_backoff_ms = 60_000;

        let mut result = ValidationResult::default();
        ConfigValidator::validate_execution(&config.execution, &mut result);
        assert_eq!(result.error_count(), 3);
        assert_eq!(result.errors[0].to_string(), "execution.parallelism: Parallelism must be at least 1");
    }

    #[test]
    fn test_memory_backend_warns() {
        let mut config = EngineConfig::default();
        config.state.backend = StateBackend::Memory;
        let result = ConfigValidator::new().validate(&config).expect("valid");
        assert_eq!(result.warning_count(), 1);
    }
}
