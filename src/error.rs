//! Error types for the Halldyll reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a
//! reconciliation cycle: engine settings, graph construction, state storage,
//! locking, provider calls, and planning.
//!
//! A partially failed apply is not an error: it is reported through
//! [`crate::planner::ApplyStatus::PartialFailure`] with per-address outcomes.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Halldyll reconciliation engine.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// Engine settings errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resource declaration errors detected while building the graph.
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    /// State storage errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Lock protocol errors.
    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    /// Provider backend errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Engine settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The settings file was not found.
    #[error("Configuration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The settings file could not be parsed.
    #[error("Failed to parse configuration: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Configuration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// An environment override holds an unusable value.
    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnvVar {
        /// Name of the variable.
        name: String,
        /// The rejected value.
        value: String,
    },
}

/// Resource declaration errors. All of these are fatal and raised before
/// any side effect occurs.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The dependency graph contains a cycle.
    #[error("Dependency cycle detected: {}", chain.join(" -> "))]
    Cycle {
        /// Addresses forming the cycle, first address repeated at the end.
        chain: Vec<String>,
    },

    /// A reference or explicit dependency points to an undeclared address.
    #[error("{from} references undeclared resource {target}")]
    UnresolvedReference {
        /// Address of the referencing resource.
        from: String,
        /// The dangling reference or dependency.
        target: String,
    },

    /// The same address was declared twice.
    #[error("Duplicate resource address: {address}")]
    DuplicateAddress {
        /// The duplicated address.
        address: String,
    },

    /// No provider is registered for a resource type.
    #[error("No provider registered for resource type '{resource_type}'")]
    UnknownResourceType {
        /// The unknown type.
        resource_type: String,
    },

    /// An address or reference string is malformed.
    #[error("Invalid address '{input}': {reason}")]
    InvalidAddress {
        /// The rejected input.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A removed resource still has live dependents that are not being
    /// rewritten or destroyed first.
    #[error("Cannot delete {address}: dependents still reference it ({})", dependents.join(", "))]
    DependentsRemain {
        /// Address of the resource that would be deleted.
        address: String,
        /// Remaining resources whose recorded dependencies include it.
        dependents: Vec<String>,
    },
}

/// State storage errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// The caller's serial does not match the stored serial.
    #[error("State conflict on '{key}': expected serial {expected}, found {found}")]
    Conflict {
        /// State-store key.
        key: String,
        /// Serial the caller based its write on.
        expected: u64,
        /// Serial currently stored.
        found: u64,
    },

    /// A saved plan was computed against a different snapshot.
    #[error("Plan is stale: computed at serial {plan_serial} of lineage {plan_lineage}, state is at serial {state_serial} of lineage {state_lineage}")]
    StalePlan {
        /// Serial the plan was computed from.
        plan_serial: u64,
        /// Lineage the plan was computed from.
        plan_lineage: String,
        /// Current serial.
        state_serial: u64,
        /// Current lineage.
        state_lineage: String,
    },

    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// Local filesystem backend error.
    #[error("Local state backend error: {message}")]
    LocalError {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State format version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Supported state format version.
        expected: String,
        /// Found state format version.
        found: String,
    },
}

/// Lock protocol errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// A valid lock is held by someone else.
    #[error("State '{key}' is locked by {holder} (since {acquired_at})")]
    Held {
        /// State-store key.
        key: String,
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired (RFC 3339).
        acquired_at: String,
    },

    /// The caller does not hold the lock it tried to renew or release.
    #[error("{holder} does not hold the lock on '{key}'")]
    NotHolder {
        /// State-store key.
        key: String,
        /// The caller's holder identifier.
        holder: String,
    },

    /// Lock acquisition failed for a backend reason.
    #[error("Failed to acquire lock on '{key}': {message}")]
    AcquireFailed {
        /// State-store key.
        key: String,
        /// Description of the failure.
        message: String,
    },
}

/// Provider backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Transient failure; the call may be retried.
    #[error("{operation} failed (retryable): {message}")]
    Retryable {
        /// Operation name (create, read, update, delete).
        operation: String,
        /// Backend message.
        message: String,
    },

    /// Permanent failure.
    #[error("{operation} failed: {message}")]
    Terminal {
        /// Operation name (create, read, update, delete).
        operation: String,
        /// Backend message.
        message: String,
    },

    /// The object identified by `id` does not exist.
    #[error("Object not found: {id}")]
    NotFound {
        /// Provider-assigned identifier.
        id: String,
    },

    /// The call exceeded the per-action timeout.
    #[error("{operation} timed out after {secs}s")]
    Timeout {
        /// Operation name.
        operation: String,
        /// Timeout that elapsed, in seconds.
        secs: u64,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// Replace expansion produced a cycle in the action graph.
    #[error("Plan is infeasible, actions wait on each other: {}", cycle.join(" -> "))]
    Infeasible {
        /// Actions forming the cycle.
        cycle: Vec<String>,
    },

    /// A change would destroy a resource marked `prevent_destroy`.
    #[error("{address} has prevent_destroy set but the plan would destroy it")]
    DestroyPrevented {
        /// Protected address.
        address: String,
    },

    /// The plan document does not match its fingerprint.
    #[error("Plan fingerprint mismatch: expected {expected}, computed {computed}")]
    FingerprintMismatch {
        /// Fingerprint carried by the plan.
        expected: String,
        /// Fingerprint recomputed from the plan contents.
        computed: String,
    },

    /// The plan document could not be (de)serialized.
    #[error("Plan serialization error: {message}")]
    SerializationError {
        /// Description of the failure.
        message: String,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, ConvergeError>;

impl ConvergeError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    ///
    /// State conflicts are deliberately not retryable here: the caller must
    /// re-plan from fresh state.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(ProviderError::Retryable { .. } | ProviderError::Timeout { .. })
                | Self::Lock(LockError::Held { .. } | LockError::AcquireFailed { .. })
        )
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::Provider(ProviderError::Retryable { .. } | ProviderError::Timeout { .. }) => {
                Some(5)
            }
            Self::Lock(LockError::Held { .. }) => Some(10),
            Self::Lock(LockError::AcquireFailed { .. }) => Some(2),
            _ => None,
        }
    }

    /// Returns true for declaration errors that abort before planning.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            Self::Graph(_) | Self::Plan(PlanError::DestroyPrevented { .. })
        )
    }

    /// Returns true if this is a concurrent-modification conflict.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::State(StateError::Conflict { .. } | StateError::StalePlan { .. })
        )
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }
}

impl GraphError {
    /// Creates an invalid address error.
    #[must_use]
    pub fn invalid_address(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidAddress {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a local backend error with the given message.
    #[must_use]
    pub fn local(message: impl Into<String>) -> Self {
        Self::LocalError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates a retryable error.
    #[must_use]
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Retryable {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates a terminal error.
    #[must_use]
    pub fn terminal(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Terminal {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Returns true if the call may be retried.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. } | Self::Timeout { .. })
    }
}
