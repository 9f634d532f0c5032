//! Leased state locks.
//!
//! At most one valid lock exists per state-store key. A lock expires on its
//! own if the holder stops renewing it, so a crashed holder never blocks
//! other actors for longer than one lease.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::LockConfig;
use crate::error::{ConvergeError, LockError, Result};
use crate::planner::CancellationSignal;

use super::store::StateStore;

/// Default lease duration.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// Information about a state lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// State-store key the lock protects.
    pub key: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lease expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates a new lock record starting now.
    #[must_use]
    pub fn new(key: &str, holder: &str, lease: Duration) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            key: key.to_string(),
            holder: holder.to_string(),
            acquired_at: now,
            expires_at: expiry_after(now, lease),
        }
    }

    /// Checks if the lease has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns this lock with its lease extended from now.
    #[must_use]
    pub fn renewed(mut self, lease: Duration) -> Self {
        self.expires_at = expiry_after(Utc::now(), lease);
        self
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

fn expiry_after(start: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lease)
        .ok()
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(|_| String::from("unknown"), |h| h.to_string_lossy().to_string());

    let pid = std::process::id();
    let uuid = &Uuid::new_v4().to_string()[..8];

    format!("{hostname}-{pid}-{uuid}")
}

/// Acquires, renews and releases the lock on one state-store key.
pub struct LockManager {
    store: Arc<dyn StateStore>,
    key: String,
    holder: String,
    lease: Duration,
    acquire_timeout: Duration,
    retry_interval: Duration,
}

impl LockManager {
    /// Creates a lock manager with a generated holder id and default timings.
    #[must_use]
    pub fn new(store: Arc<dyn StateStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            holder: generate_holder_id(),
            lease: DEFAULT_LEASE,
            acquire_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_secs(2),
        }
    }

    /// Creates a lock manager using configured timings.
    #[must_use]
    pub fn from_config(store: Arc<dyn StateStore>, key: impl Into<String>, config: &LockConfig) -> Self {
        Self::new(store, key)
            .with_lease(Duration::from_secs(config.lease_secs))
            .with_acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .with_retry_interval(Duration::from_millis(config.retry_interval_ms))
    }

    /// Overrides the holder id.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Sets the lease duration.
    #[must_use]
    pub const fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Sets how long [`Self::acquire`] waits for a held lock.
    #[must_use]
    pub const fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets the polling interval while waiting for a held lock.
    #[must_use]
    pub const fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Holder id used by this manager.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// State-store key.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lease duration.
    #[must_use]
    pub const fn lease(&self) -> Duration {
        self.lease
    }

    /// Acquires the lock, polling until the acquire timeout elapses.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Held`] if the lock is still held at the deadline,
    /// or any backend error immediately.
    pub async fn acquire(&self) -> Result<LockInfo> {
        let deadline = Instant::now() + self.acquire_timeout;

        loop {
            match self
                .store
                .acquire_lock(&self.key, &self.holder, self.lease)
                .await
            {
                Ok(info) => {
                    info!(
                        "Acquired lock on '{}' as {} (lease {}s)",
                        self.key,
                        self.holder,
                        self.lease.as_secs()
                    );
                    return Ok(info);
                }
                Err(ConvergeError::Lock(LockError::Held { holder, .. }))
                    if Instant::now() < deadline =>
                {
                    let wait = self
                        .retry_interval
                        .min(deadline.saturating_duration_since(Instant::now()));
                    debug!("Lock on '{}' held by {holder}, retrying in {wait:?}", self.key);
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Extends the lease.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHolder`] if the lock was lost.
    pub async fn renew(&self) -> Result<LockInfo> {
        self.store
            .renew_lock(&self.key, &self.holder, self.lease)
            .await
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::NotHolder`] if this manager does not hold it.
    pub async fn release(&self) -> Result<()> {
        self.store.release_lock(&self.key, &self.holder).await?;
        info!("Released lock on '{}'", self.key);
        Ok(())
    }

    /// Removes whatever lock is present, regardless of holder.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be reached.
    pub async fn force_release(&self) -> Result<Option<LockInfo>> {
        let removed = self.store.force_unlock(&self.key).await?;
        if let Some(lock) = &removed {
            warn!("Force-released lock on '{}' held by {}", self.key, lock.holder);
        }
        Ok(removed)
    }

    /// Starts renewing the lease every third of its duration.
    ///
    /// If renewal is refused, or the lease passes without a successful
    /// renewal, `cancel` is triggered so the running apply stops starting
    /// new actions.
    #[must_use]
    pub fn spawn_heartbeat(&self, cancel: CancellationSignal) -> Heartbeat {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let holder = self.holder.clone();
        let lease = self.lease;
        let period = (lease / 3).max(Duration::from_millis(1));
        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            let mut last_renewed = Instant::now();

            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {}
                }

                match store.renew_lock(&key, &holder, lease).await {
                    Ok(_) => {
                        last_renewed = Instant::now();
                        debug!("Renewed lock on '{key}'");
                    }
                    Err(ConvergeError::Lock(LockError::NotHolder { .. })) => {
                        error!("Lock on '{key}' was taken over, cancelling apply");
                        lost_flag.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        break;
                    }
                    Err(e) if last_renewed.elapsed() >= lease => {
                        error!("Lease on '{key}' expired without renewal ({e}), cancelling apply");
                        lost_flag.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        break;
                    }
                    Err(e) => warn!("Failed to renew lock on '{key}': {e}"),
                }
            }
        });

        Heartbeat {
            stop: Some(stop_tx),
            handle: Some(handle),
            lost,
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("backend", &self.store.backend_type())
            .field("key", &self.key)
            .field("holder", &self.holder)
            .field("lease", &self.lease)
            .finish_non_exhaustive()
    }
}

/// Background lease renewal, stopped explicitly or on drop.
#[derive(Debug)]
pub struct Heartbeat {
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    lost: Arc<AtomicBool>,
}

impl Heartbeat {
    /// Returns true if the lease was lost.
    #[must_use]
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Stops renewing and waits for the task to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!("Heartbeat task ended abnormally: {e}");
            }
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
