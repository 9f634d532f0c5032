//! State store protocol.
//!
//! Every backend implements the same protocol: snapshot reads, serial
//! compare-and-swap writes, and leased locks, all addressed by a
//! state-store key.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::{LockError, Result, StateError};

use super::lock::LockInfo;
use super::types::StateSnapshot;

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the snapshot stored under `key`.
    ///
    /// Returns `None` if nothing was ever stored; its serial is then zero.
    async fn get(&self, key: &str) -> Result<Option<StateSnapshot>>;

    /// Stores `snapshot` under `key` if the stored serial equals
    /// `expected_serial`, returning the new serial.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Conflict`] if another writer got there first.
    async fn put(&self, key: &str, snapshot: &StateSnapshot, expected_serial: u64) -> Result<u64>;

    /// Takes the lock on `key` if none exists or the existing lease expired.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] if a valid lock is held.
    async fn acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo>;

    /// Extends the lease of a lock held by `holder`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHolder`] if `holder` does not hold the lock.
    async fn renew_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo>;

    /// Removes the lock if `holder` holds it.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHolder`] otherwise; nothing is changed.
    async fn release_lock(&self, key: &str, holder: &str) -> Result<()>;

    /// Returns the current lock record, expired or not.
    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Removes any lock on `key`, returning what was removed.
    async fn force_unlock(&self, key: &str) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

/// Checks a compare-and-swap precondition shared by every backend.
pub(crate) fn check_serial(key: &str, expected: u64, current: Option<&StateSnapshot>) -> Result<()> {
    let found = current.map_or(0, |s| s.serial);
    if found == expected {
        Ok(())
    } else {
        Err(StateError::Conflict {
            key: key.to_string(),
            expected,
            found,
        }
        .into())
    }
}

/// Returns the snapshot as it will be stored at `expected + 1`.
pub(crate) fn next_snapshot(snapshot: &StateSnapshot, expected: u64) -> StateSnapshot {
    let mut next = snapshot.clone();
    next.serial = expected + 1;
    next
}

/// Fails with [`LockError::Held`] if `existing` is a valid lock.
pub(crate) fn check_lock_free(key: &str, existing: Option<&LockInfo>) -> Result<()> {
    match existing {
        Some(lock) if !lock.is_expired() => Err(LockError::Held {
            key: key.to_string(),
            holder: lock.holder.clone(),
            acquired_at: lock.acquired_at.to_rfc3339(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// Fails with [`LockError::NotHolder`] unless `existing` belongs to `holder`.
pub(crate) fn check_holder<'a>(
    key: &str,
    holder: &str,
    existing: Option<&'a LockInfo>,
) -> Result<&'a LockInfo> {
    match existing {
        Some(lock) if lock.holder == holder => Ok(lock),
        _ => Err(LockError::NotHolder {
            key: key.to_string(),
            holder: holder.to_string(),
        }
        .into()),
    }
}
