//! In-memory state storage backend.
//!
//! Used for dry runs and tests. State lives only as long as the store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

use super::lock::LockInfo;
use super::store::{check_holder, check_lock_free, check_serial, next_snapshot, StateStore};
use super::types::StateSnapshot;

#[derive(Debug, Default)]
struct Slot {
    snapshot: Option<StateSnapshot>,
    lock: Option<LockInfo>,
}

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateSnapshot>> {
        let slots = self.slots.lock().await;
        Ok(slots.get(key).and_then(|s| s.snapshot.clone()))
    }

    async fn put(&self, key: &str, snapshot: &StateSnapshot, expected_serial: u64) -> Result<u64> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_default();
        check_serial(key, expected_serial, slot.snapshot.as_ref())?;

        let next = next_snapshot(snapshot, expected_serial);
        let serial = next.serial;
        slot.snapshot = Some(next);
        debug!("Stored state '{key}' at serial {serial}");
        Ok(serial)
    }

    async fn acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_default();
        check_lock_free(key, slot.lock.as_ref())?;

        let info = LockInfo::new(key, holder, lease);
        slot.lock = Some(info.clone());
        Ok(info)
    }

    async fn renew_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_default();
        let renewed = check_holder(key, holder, slot.lock.as_ref())?
            .clone()
            .renewed(lease);
        slot.lock = Some(renewed.clone());
        Ok(renewed)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let mut slots = self.slots.lock().await;
        let slot = slots.entry(key.to_string()).or_default();
        check_holder(key, holder, slot.lock.as_ref())?;
        slot.lock = None;
        Ok(())
    }

    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        let slots = self.slots.lock().await;
        Ok(slots.get(key).and_then(|s| s.lock.clone()))
    }

    async fn force_unlock(&self, key: &str) -> Result<Option<LockInfo>> {
        let mut slots = self.slots.lock().await;
        Ok(slots.get_mut(key).and_then(|s| s.lock.take()))
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
