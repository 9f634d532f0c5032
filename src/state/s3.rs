//! S3-based state storage backend.
//!
//! Remote state for teams and CI. Compare-and-swap relies on S3
//! conditional writes: `If-Match` with the ETag read beforehand, or
//! `If-None-Match: *` when the object must not exist yet.

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::delete_object::builders::DeleteObjectFluentBuilder;
use aws_sdk_s3::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{ConvergeError, LockError, Result, StateError};

use super::lock::LockInfo;
use super::store::{check_holder, check_lock_free, check_serial, next_snapshot, StateStore};
use super::types::StateSnapshot;

/// State object name.
const STATE_OBJECT: &str = "state.json";

/// Lock object name.
const LOCK_OBJECT: &str = "lock.json";

/// Error codes S3 returns when a conditional write loses.
const PRECONDITION_CODES: [&str; 2] = ["PreconditionFailed", "ConditionalRequestConflict"];

/// Object body with the ETag it was read at.
struct Versioned {
    content: String,
    etag: Option<String>,
}

/// Outcome of a conditional write or delete.
enum PutOutcome {
    Written,
    PreconditionFailed,
}

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, empty or ending with `/`.
    prefix: String,
}

impl S3StateStore {
    /// Creates a new S3 state store from the ambient AWS configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        let prefix = prefix
            .map(|p| {
                let p = p.trim_matches('/');
                if p.is_empty() {
                    String::new()
                } else {
                    format!("{p}/")
                }
            })
            .unwrap_or_default();

        Self {
            client,
            bucket: bucket.to_string(),
            prefix,
        }
    }

    /// Gets the full S3 object key for a state-store key.
    fn object_key(&self, key: &str, object: &str) -> String {
        format!("{}{key}/{object}", self.prefix)
    }

    fn is_precondition_failure<E: ProvideErrorMetadata, R>(err: &SdkError<E, R>) -> bool {
        err.code().is_some_and(|code| PRECONDITION_CODES.contains(&code))
    }

    /// Gets an object and its ETag.
    async fn get_object(&self, object_key: &str) -> Result<Option<Versioned>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    StateError::s3(format!("Failed to read S3 object: {e}"))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    StateError::corrupted(format!("Invalid UTF-8 in S3 object: {e}"))
                })?;

                Ok(Some(Versioned { content, etag }))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StateError::s3(format!("S3 get error: {service_err}")).into())
                }
            }
        }
    }

    /// Puts an object, conditional on `etag` (or on absence when `None`).
    async fn put_object_if(
        &self,
        object_key: &str,
        content: &str,
        etag: Option<&str>,
    ) -> Result<PutOutcome> {
        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(object_key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json");

        let request = match etag {
            Some(etag) => request.if_match(etag),
            None => request.if_none_match("*"),
        };

        match request.send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e) if Self::is_precondition_failure(&e) => Ok(PutOutcome::PreconditionFailed),
            Err(e) => Err(StateError::s3(format!("S3 put error: {e}")).into()),
        }
    }

    /// Builds a delete, conditional on `etag` when given.
    fn delete_request(&self, object_key: &str, etag: Option<&str>) -> DeleteObjectFluentBuilder {
        let request = self.client.delete_object().bucket(&self.bucket).key(object_key);
        match etag {
            Some(etag) => request.if_match(etag),
            None => request,
        }
    }

    /// Deletes an object, only while it still has `etag` when given.
    async fn delete_object(&self, object_key: &str, etag: Option<&str>) -> Result<PutOutcome> {
        match self.delete_request(object_key, etag).send().await {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e) if Self::is_precondition_failure(&e) => Ok(PutOutcome::PreconditionFailed),
            Err(e) => Err(StateError::s3(format!("S3 delete error: {e}")).into()),
        }
    }

    async fn read_state(&self, key: &str) -> Result<Option<(StateSnapshot, Option<String>)>> {
        let Some(object) = self.get_object(&self.object_key(key, STATE_OBJECT)).await? else {
            return Ok(None);
        };
        let snapshot = serde_json::from_str(&object.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse state: {e}")))?;
        Ok(Some((snapshot, object.etag)))
    }

    async fn read_lock(&self, key: &str) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some(object) = self.get_object(&self.object_key(key, LOCK_OBJECT)).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_str(&object.content)
            .map_err(|e| StateError::corrupted(format!("Failed to parse lock: {e}")))?;
        Ok(Some((lock, object.etag)))
    }

    fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String> {
        serde_json::to_string_pretty(value).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize {what}: {e}"
            )))
        })
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn get(&self, key: &str) -> Result<Option<StateSnapshot>> {
        debug!("Loading state from s3://{}/{}", self.bucket, self.object_key(key, STATE_OBJECT));
        Ok(self.read_state(key).await?.map(|(snapshot, _)| snapshot))
    }

    async fn put(&self, key: &str, snapshot: &StateSnapshot, expected_serial: u64) -> Result<u64> {
        let object_key = self.object_key(key, STATE_OBJECT);
        let current = self.read_state(key).await?;
        check_serial(key, expected_serial, current.as_ref().map(|(s, _)| s))?;

        let next = next_snapshot(snapshot, expected_serial);
        let content = Self::to_json(&next, "state")?;
        let etag = current.as_ref().and_then(|(_, etag)| etag.as_deref());

        match self.put_object_if(&object_key, &content, etag).await? {
            PutOutcome::Written => {
                info!("Saved state to s3://{}/{object_key} at serial {}", self.bucket, next.serial);
                Ok(next.serial)
            }
            PutOutcome::PreconditionFailed => {
                let found = self.read_state(key).await?.map_or(0, |(s, _)| s.serial);
                Err(StateError::Conflict {
                    key: key.to_string(),
                    expected: expected_serial,
                    found,
                }
                .into())
            }
        }
    }

    async fn acquire_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo> {
        let object_key = self.object_key(key, LOCK_OBJECT);
        let existing = self.read_lock(key).await?;
        check_lock_free(key, existing.as_ref().map(|(l, _)| l))?;
        if existing.is_some() {
            debug!("Expired lock found on '{key}', taking over");
        }

        let info = LockInfo::new(key, holder, lease);
        let content = Self::to_json(&info, "lock")?;
        let etag = existing.as_ref().and_then(|(_, etag)| etag.as_deref());

        match self.put_object_if(&object_key, &content, etag).await? {
            PutOutcome::Written => {
                info!("Acquired state lock on '{key}': {}", info.lock_id);
                Ok(info)
            }
            PutOutcome::PreconditionFailed => {
                let winner = self.read_lock(key).await?.map(|(l, _)| l);
                check_lock_free(key, winner.as_ref())?;
                Err(LockError::AcquireFailed {
                    key: key.to_string(),
                    message: String::from("lock object changed during acquisition"),
                }
                .into())
            }
        }
    }

    async fn renew_lock(&self, key: &str, holder: &str, lease: Duration) -> Result<LockInfo> {
        let object_key = self.object_key(key, LOCK_OBJECT);
        let existing = self.read_lock(key).await?;
        let renewed = check_holder(key, holder, existing.as_ref().map(|(l, _)| l))?
            .clone()
            .renewed(lease);
        let content = Self::to_json(&renewed, "lock")?;
        let etag = existing.as_ref().and_then(|(_, etag)| etag.as_deref());

        match self.put_object_if(&object_key, &content, etag).await? {
            PutOutcome::Written => Ok(renewed),
            PutOutcome::PreconditionFailed => Err(LockError::NotHolder {
                key: key.to_string(),
                holder: holder.to_string(),
            }
            .into()),
        }
    }

    async fn release_lock(&self, key: &str, holder: &str) -> Result<()> {
        let existing = self.read_lock(key).await?;
        let lock = check_holder(key, holder, existing.as_ref().map(|(l, _)| l))?;
        let etag = existing.as_ref().and_then(|(_, etag)| etag.as_deref());

        match self.delete_object(&self.object_key(key, LOCK_OBJECT), etag).await? {
            PutOutcome::Written => {
                info!("Released state lock on '{key}': {}", lock.lock_id);
                Ok(())
            }
            PutOutcome::PreconditionFailed => Err(LockError::NotHolder {
                key: key.to_string(),
                holder: holder.to_string(),
            }
            .into()),
        }
    }

    async fn get_lock_info(&self, key: &str) -> Result<Option<LockInfo>> {
        Ok(self.read_lock(key).await?.map(|(lock, _)| lock))
    }

    async fn force_unlock(&self, key: &str) -> Result<Option<LockInfo>> {
        let existing = self.read_lock(key).await?.map(|(lock, _)| lock);
        if existing.is_some() {
            self.delete_object(&self.object_key(key, LOCK_OBJECT), None).await?;
        }
        Ok(existing)
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}
