//! State management for the reconciliation engine.
//!
//! This module provides persistent storage of resource records, the
//! serial compare-and-swap protocol that protects it, and leased locks
//! serializing applies per state-store key.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;

use std::sync::Arc;
use tracing::info;

use crate::config::{StateBackend, StateConfig};
use crate::error::{ConfigError, Result};

pub use local::LocalStateStore;
pub use lock::{generate_holder_id, Heartbeat, LockInfo, LockManager, DEFAULT_LEASE};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{ApplyHistoryEntry, ResourceRecord, StateSnapshot, MAX_HISTORY, STATE_VERSION};

/// Opens the backend selected by `config`.
///
/// # Errors
///
/// Returns an error if the S3 backend is selected without a bucket.
pub async fn open_store(config: &StateConfig) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.backend {
        StateBackend::Local => Arc::new(LocalStateStore::with_base_dir(&config.path)),
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
        StateBackend::S3 => {
            let bucket = config
                .bucket
                .as_deref()
                .ok_or_else(|| ConfigError::validation("S3 backend requires a bucket", "state.bucket"))?;
            Arc::new(S3StateStore::new(bucket, config.prefix.as_deref(), config.region.as_deref()).await?)
        }
    };

    info!("Using {} state backend for key '{}'", store.backend_type(), config.key);
    Ok(store)
}
