//! Local file-based state storage backend.
//!
//! Each key maps to a directory under the base directory holding
//! `state.json` and `lock.json`. Snapshots are written to a uniquely named
//! temporary file and renamed into place; lock files are linked into place
//! so they never appear half written.
//!
//! Every read-compare-write runs under `write.guard`, a sidecar created
//! exclusively, so the serial check holds across processes sharing the
//! directory and not just across tasks.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DEFAULT_STATE_DIR;
use crate::error::{ConvergeError, LockError, Result, StateError};

use super::lock::LockInfo;
use super::store::{check_holder, check_lock_free, check_serial, next_snapshot, StateStore};
use super::types::StateSnapshot;

/// State file name.
const STATE_FILE: &str = "state.json";

/// Lock file name.
const LOCK_FILE: &str = "lock.json";

/// Write guard file name.
const GUARD_FILE: &str = "write.guard";

/// Age after which a guard is assumed to belong to a crashed writer.
const GUARD_STALE_AFTER: Duration = Duration::from_secs(30);

/// How long to wait for the write guard.
const GUARD_WAIT: Duration = Duration::from_secs(10);

/// Polling interval while the write guard is held elsewhere.
const GUARD_POLL: Duration = Duration::from_millis(5);

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory holding one subdirectory per key.
    base_dir: PathBuf,
    /// Age after which a leftover write guard is broken.
    guard_stale_after: Duration,
}

/// Exclusive write guard for one key directory, removed on drop.
struct WriteGuard {
    path: PathBuf,
    token: String,
}

impl WriteGuard {
    async fn acquire(path: PathBuf, stale_after: Duration) -> Result<Self> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + GUARD_WAIT;

        loop {
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    if let Err(e) = file.write_all(token.as_bytes()).await {
                        let _ = fs::remove_file(&path).await;
                        return Err(StateError::local(format!(
                            "Failed to write {}: {e}",
                            path.display()
                        ))
                        .into());
                    }
                    return Ok(Self { path, token });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => {
                    return Err(StateError::local(format!(
                        "Failed to create {}: {e}",
                        path.display()
                    ))
                    .into());
                }
            }

            if is_older_than(&path, stale_after).await {
                Self::break_stale(&path, stale_after).await?;
                continue;
            }

            if Instant::now() >= deadline {
                return Err(StateError::local(format!(
                    "Timed out waiting for {}",
                    path.display()
                ))
                .into());
            }
            tokio::time::sleep(GUARD_POLL).await;
        }
    }

    /// Moves a stale guard aside. A guard that turns out to be fresh once
    /// moved is linked back if its slot is still free.
    async fn break_stale(path: &Path, stale_after: Duration) -> Result<()> {
        let tombstone = path.with_extension(format!("{}.stale", Uuid::new_v4()));
        match fs::rename(path, &tombstone).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StateError::local(format!(
                    "Failed to move stale {}: {e}",
                    path.display()
                ))
                .into());
            }
        }

        if is_older_than(&tombstone, stale_after).await {
            warn!("Broke stale write guard {}", path.display());
        } else if let Err(e) = fs::hard_link(&tombstone, path).await {
            warn!("Could not restore write guard {}: {e}", path.display());
        }

        let _ = fs::remove_file(&tombstone).await;
        Ok(())
    }
}

impl Drop for WriteGuard {
    fn drop(&mut self) {
        // Leave the file alone if it was broken and recreated by another writer.
        let ours = std::fs::read_to_string(&self.path).is_ok_and(|t| t == self.token);
        if ours {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!("Failed to remove write guard {}: {e}", self.path.display());
            }
        }
    }
}

async fn is_older_than(path: &Path, age: Duration) -> bool {
    fs::metadata(path)
        .await
        .ok()
        .and_then(|m| m.modified().ok())
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|elapsed| elapsed >= age)
}

/// Unique sibling path for a temporary write.
fn temp_path(path: &Path) -> PathBuf {
    path.with_extension(format!("{}.tmp", Uuid::new_v4()))
}

impl LocalStateStore {
    /// Creates a store rooted at `.halldyll` in the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(DEFAULT_STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a store rooted at a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            guard_stale_after: GUARD_STALE_AFTER,
        }
    }

    /// Sets the age after which a leftover write guard is broken.
    #[must_use]
    pub const fn with_guard_stale_after(mut self, age: Duration) -> Self {
        self.guard_stale_after = age;
        self
    }

    /// Base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn key_dir(&self, key: &str) -> PathBuf {
        self.base_dir.join(key)
    }

    fn state_path(&self, key: &str) -> PathBuf {
        self.key_dir(key).join(STATE_FILE)
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.key_dir(key).join(LOCK_FILE)
    }

    /// Creates the key directory and takes its write guard.
    async fn guard(&self, key: &str) -> Result<WriteGuard> {
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StateError::local(format!("Failed to create state directory: {e}")))?;
        WriteGuard::acquire(dir.join(GUARD_FILE), self.guard_stale_after).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StateError::corrupted(format!(
                    "Failed to read {}: {e}",
                    path.display()
                ))
                .into());
            }
        };

        let value = serde_json::from_str(&content).map_err(|e| {
            StateError::corrupted(format!("Failed to parse {}: {e}", path.display()))
        })?;
        Ok(Some(value))
    }

    /// Writes and syncs `content` to a fresh temporary file.
    async fn write_temp(path: &Path, content: &str) -> Result<PathBuf> {
        let temp = temp_path(path);
        let written = async {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp)
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.sync_all().await
        }
        .await;

        match written {
            Ok(()) => Ok(temp),
            Err(e) => {
                let _ = fs::remove_file(&temp).await;
                Err(StateError::local(format!("Failed to write {}: {e}", temp.display())).into())
            }
        }
    }

    /// Writes `content` to a temporary sibling, then renames it over `path`.
    async fn write_atomic(path: &Path, content: &str) -> Result<()> {
        let temp = Self::write_temp(path, content).await?;
        if let Err(e) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(StateError::local(format!("Failed to rename {}: {e}", path.display())).into());
        }
        Ok(())
    }

    /// Links a fully written lock file into place only if none exists.
    ///
    /// Returns false if another lock file is present.
    async fn create_lock_file(path: &Path, key: &str, info: &LockInfo) -> Result<bool> {
        let content = serde_json::to_string_pretty(info)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        let temp = Self::write_temp(path, &content).await?;

        let linked = fs::hard_link(&temp, path).await;
        let _ = fs::remove_file(&temp).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(LockError::AcquireFailed {
                key: key.to_string(),
                message: format!("Failed to create lock file: {e}"),
            }
            .into()),
        }
    }

    async fn remove_lock_file(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StateError::local(format!("Failed to delete lock file: {e}")).into()),
        }
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn get(&self, key: &str) -> Result<Option<StateSnapshot>> {
        let path = self.state_path(key);
        let snapshot = Self::read_json::<StateSnapshot>(&path).await?;
        match &snapshot {
            Some(s) => debug!("Loaded state '{key}' at serial {} from {}", s.serial, path.display()),
            None => debug!("State file does not exist: {}", path.display()),
        }
        Ok(snapshot)
    }

    async fn put(&self, key: &str, snapshot: &StateSnapshot, expected_serial: u64) -> Result<u64> {
        let _guard = self.guard(key).await?;

        let path = self.state_path(key);
        let current = Self::read_json::<StateSnapshot>(&path).await?;
        check_serial(key, expected_serial, current.as_ref())?;

        let next = next_snapshot(snapshot, expected_serial);
        let content = serde_json::to_string_pretty(&next)
            .map_err(|e| StateError::serialization(format!("Failed to serialize state: {e}")))?;
        Self::write_atomic(&path, &content).await?;

        debug!("Saved state '{key}' at serial {}", next.serial);
        Ok(next.serial)
    }

    async fn acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo> {
        let _guard = self.guard(key).await?;
        let path = self.lock_path(key);

        // Two rounds: the second runs after removing an expired lock. The
        // write guard keeps the expiry check and the removal together.
        for _ in 0..2 {
            let info = LockInfo::new(key, holder, lease);
            if Self::create_lock_file(&path, key, &info).await? {
                info!("Acquired state lock on '{key}': {}", info.lock_id);
                return Ok(info);
            }

            let existing = Self::read_json::<LockInfo>(&path).await?;
            check_lock_free(key, existing.as_ref())?;

            debug!("Expired lock found on '{key}', taking over");
            Self::remove_lock_file(&path).await?;
        }

        Err(LockError::AcquireFailed {
            key: key.to_string(),
            message: String::from("lock file reappeared while taking over an expired lock"),
        }
        .into())
    }

    async fn renew_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo> {
        let _guard = self.guard(key).await?;
        let path = self.lock_path(key);
        let existing = Self::read_json::<LockInfo>(&path).await?;
        let renewed = check_holder(key, holder, existing.as_ref())?
            .clone()
            .renewed(lease);

        let content = serde_json::to_string_pretty(&renewed)
            .map_err(|e| StateError::serialization(format!("Failed to serialize lock: {e}")))?;
        Self::write_atomic(&path, &content).await?;
        Ok(renewed)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let _guard = self.guard(key).await?;
        let path = self.lock_path(key);
        let existing = Self::read_json::<LockInfo>(&path).await?;
        let lock = check_holder(key, holder, existing.as_ref())?;

        Self::remove_lock_file(&path).await?;
        info!("Released state lock on '{key}': {}", lock.lock_id);
        Ok(())
    }

    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        Self::read_json(&self.lock_path(key)).await
    }

    async fn force_unlock(&self, key: &str) -> Result<Option<LockInfo>> {
        let _guard = self.guard(key).await?;
        let path = self.lock_path(key);
        let existing = Self::read_json::<LockInfo>(&path).await?;
        Self::remove_lock_file(&path).await?;
        Ok(existing)
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Address, Attributes};
    use crate::state::ResourceRecord;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let (store, _temp) = create_test_store();

        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(ResourceRecord::new(Address::new("vpc", "main"), "vpc-1", Attributes::new()));
        let serial = store.put("default", &snapshot, 0).await.expect("Failed to save state");
        assert_eq!(serial, 1);

        let loaded = store
            .get("default")
            .await
            .expect("Failed to load state")
            .expect("State should exist");

        assert_eq!(loaded.serial, 1);
        assert_eq!(loaded.lineage, snapshot.lineage);
        assert_eq!(loaded.resources, snapshot.resources);
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.get("default").await.expect("Get should not fail");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_put_rejects_stale_serial() {
        let (store, _temp) = create_test_store();
        let snapshot = StateSnapshot::new();

        store.put("default", &snapshot, 0).await.expect("first put");
        let err = store.put("default", &snapshot, 0).await.expect_err("conflict");
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_corrupted_state_is_reported() {
        let (store, temp) = create_test_store();
        std::fs::create_dir_all(temp.path().join("default")).expect("mkdir");
        std::fs::write(temp.path().join("default").join(STATE_FILE), "{ not json").expect("write");

        let err = store.get("default").await.expect_err("corrupted");
        assert!(matches!(err, ConvergeError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();
        let lease = Duration::from_secs(60);

        let lock = store
            .acquire_lock("default", "test-holder", lease)
            .await
            .expect("Failed to acquire lock");
        assert_eq!(lock.holder, "test-holder");

        let err = store.acquire_lock("default", "other", lease).await.expect_err("held");
        assert!(matches!(err, ConvergeError::Lock(LockError::Held { .. })));

        store
            .release_lock("default", "test-holder")
            .await
            .expect("Failed to release lock");
        assert!(store.get_lock_info("default").await.expect("info").is_none());

        store.acquire_lock("default", "other", lease).await.expect("free again");
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        store
            .acquire_lock("default", "crashed", Duration::from_millis(10))
            .await
            .expect("first lock");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let lock = store
            .acquire_lock("default", "next", Duration::from_secs(60))
            .await
            .expect("takeover");
        assert_eq!(lock.holder, "next");

        let err = store.release_lock("default", "crashed").await.expect_err("lost lock");
        assert!(matches!(err, ConvergeError::Lock(LockError::NotHolder { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let (store, _temp) = create_test_store();
        let store = Arc::new(store);

        let a = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.acquire_lock("default", "a", Duration::from_secs(60)).await })
        };
        let b = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.acquire_lock("default", "b", Duration::from_secs(60)).await })
        };

        let results = [a.await.expect("task a"), b.await.expect("task b")];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(ConvergeError::Lock(LockError::Held { .. })))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stores_sharing_a_directory_serialize_puts() {
        let temp = TempDir::new().expect("temp dir");
        let first = Arc::new(LocalStateStore::with_base_dir(temp.path()));
        let second = Arc::new(LocalStateStore::with_base_dir(temp.path()));

        for round in 0..10 {
            let key = format!("k{round}");
            let put = |store: Arc<LocalStateStore>, key: String| {
                tokio::spawn(async move { store.put(&key, &StateSnapshot::new(), 0).await })
            };
            let a = put(Arc::clone(&first), key.clone());
            let b = put(Arc::clone(&second), key.clone());
            let results = [a.await.expect("task a"), b.await.expect("task b")];

            assert_eq!(results.iter().filter(|r| matches!(r, Ok(1))).count(), 1);
            assert_eq!(
                results
                    .iter()
                    .filter(|r| matches!(r, Err(ConvergeError::State(StateError::Conflict { .. }))))
                    .count(),
                1
            );

            let stored = first.get(&key).await.expect("get").expect("stored");
            assert_eq!(stored.serial, 1);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stores_sharing_a_directory_take_over_expired_lock_once() {
        let temp = TempDir::new().expect("temp dir");
        let stores: Vec<Arc<LocalStateStore>> = (0..3)
            .map(|_| Arc::new(LocalStateStore::with_base_dir(temp.path())))
            .collect();

        stores[0]
            .acquire_lock("default", "crashed", Duration::from_millis(10))
            .await
            .expect("first lock");
        tokio::time::sleep(Duration::from_millis(30)).await;

        let tasks: Vec<_> = stores
            .iter()
            .enumerate()
            .map(|(i, store)| {
                let store = Arc::clone(store);
                tokio::spawn(async move {
                    store
                        .acquire_lock("default", &format!("actor-{i}"), Duration::from_secs(60))
                        .await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for task in tasks {
            match task.await.expect("task") {
                Ok(lock) => winners.push(lock.holder),
                Err(e) => assert!(matches!(e, ConvergeError::Lock(LockError::Held { .. })), "{e}"),
            }
        }
        assert_eq!(winners.len(), 1);

        let on_disk = stores[1].get_lock_info("default").await.expect("info").expect("lock");
        assert_eq!(on_disk.holder, winners[0]);
    }

    #[tokio::test]
    async fn test_writes_leave_no_temporary_files() {
        let (store, temp) = create_test_store();
        let serial = store.put("default", &StateSnapshot::new(), 0).await.expect("put");
        store.put("default", &StateSnapshot::new(), serial).await.expect("put");
        store.acquire_lock("default", "me", Duration::from_secs(60)).await.expect("lock");
        store.renew_lock("default", "me", Duration::from_secs(60)).await.expect("renew");

        let mut names: Vec<String> = std::fs::read_dir(temp.path().join("default"))
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec![LOCK_FILE, STATE_FILE]);
    }

    #[tokio::test]
    async fn test_leftover_guard_from_crashed_writer_is_broken() {
        let temp = TempDir::new().expect("temp dir");
        std::fs::create_dir_all(temp.path().join("default")).expect("mkdir");
        std::fs::write(temp.path().join("default").join(GUARD_FILE), "crashed").expect("write");

        let store = LocalStateStore::with_base_dir(temp.path()).with_guard_stale_after(Duration::ZERO);
        let serial = store.put("default", &StateSnapshot::new(), 0).await.expect("put");
        assert_eq!(serial, 1);
        assert!(!temp.path().join("default").join(GUARD_FILE).exists());
    }
}
