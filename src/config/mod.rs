//! Engine settings.
//!
//! This module handles all settings-related functionality:
//! - Parsing and deserializing `halldyll.converge.yaml`
//! - Environment and `.env` overrides
//! - Validation of settings values

mod parser;
mod spec;
mod validator;

pub use parser::{find_config_file, ConfigParser, DEFAULT_CONFIG_FILES};
pub use spec::{
    DiffConfig, EngineConfig, ExecutionConfig, LockConfig, LogFormat, LoggingConfig, ReadThrough,
    StateBackend, StateConfig, DEFAULT_STATE_DIR,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
