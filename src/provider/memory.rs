//! In-memory provider backend.
//!
//! Objects live in a map inside the provider. Failures, latency and
//! out-of-band changes can be scripted, which makes this backend the
//! reference double for executor and drift tests as well as dry runs.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::ProviderError;
use crate::resource::{Attributes, ResourceSchema};

use super::{Created, Provider, ProviderResult};

/// Provider operation, used to target scripted failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`.
    Create,
    /// `read`.
    Read,
    /// `update`.
    Update,
    /// `delete`.
    Delete,
}

/// A scripted failure.
#[derive(Debug, Clone)]
pub struct FailureRule {
    /// Operation the rule applies to.
    pub operation: Operation,
    /// Only objects whose attribute equals this value fail.
    pub when: Option<(String, serde_json::Value)>,
    /// Number of failures left; `None` fails forever.
    pub times: Option<u32>,
    /// Whether the failure is retryable.
    pub retryable: bool,
}

/// In-memory provider for one resource type.
#[derive(Debug)]
pub struct MemoryProvider {
    schema: ResourceSchema,
    latency: Duration,
    inner: Mutex<Inner>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    objects: BTreeMap<String, Attributes>,
    next_id: u64,
    rules: Vec<FailureRule>,
    calls: HashMap<Operation, u32>,
}

impl FailureRule {
    /// Fails every call of `operation`.
    #[must_use]
    pub const fn always(operation: Operation, retryable: bool) -> Self {
        Self {
            operation,
            when: None,
            times: None,
            retryable,
        }
    }

    /// Fails `operation` for objects whose `attribute` equals `value`.
    #[must_use]
    pub fn when(
        operation: Operation,
        attribute: impl Into<String>,
        value: serde_json::Value,
        retryable: bool,
    ) -> Self {
        Self {
            operation,
            when: Some((attribute.into(), value)),
            times: None,
            retryable,
        }
    }

    /// Limits the rule to the next `times` matching calls.
    #[must_use]
    pub const fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }

    fn matches(&self, operation: Operation, attributes: Option<&Attributes>) -> bool {
        if self.operation != operation || self.times == Some(0) {
            return false;
        }
        match (&self.when, attributes) {
            (None, _) => true,
            (Some((key, value)), Some(attrs)) => attrs.get(key) == Some(value),
            (Some(_), None) => false,
        }
    }
}

impl MemoryProvider {
    /// Creates an empty provider for the given schema.
    #[must_use]
    pub fn new(schema: ResourceSchema) -> Self {
        Self {
            schema,
            latency: Duration::ZERO,
            inner: Mutex::new(Inner::default()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Adds a fixed latency to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Scripts a failure.
    pub async fn fail(&self, rule: FailureRule) {
        self.inner.lock().await.rules.push(rule);
    }

    /// Replaces an object's live attributes out of band.
    pub async fn set_live(&self, id: &str, attributes: Attributes) {
        self.inner
            .lock()
            .await
            .objects
            .insert(id.to_string(), attributes);
    }

    /// Deletes an object out of band.
    pub async fn remove_live(&self, id: &str) {
        self.inner.lock().await.objects.remove(id);
    }

    /// Returns an object's live attributes.
    pub async fn object(&self, id: &str) -> Option<Attributes> {
        self.inner.lock().await.objects.get(id).cloned()
    }

    /// Returns the number of live objects.
    pub async fn object_count(&self) -> usize {
        self.inner.lock().await.objects.len()
    }

    /// Returns how many times `operation` was called.
    pub async fn calls(&self, operation: Operation) -> u32 {
        self.inner
            .lock()
            .await
            .calls
            .get(&operation)
            .copied()
            .unwrap_or(0)
    }

    /// Highest number of calls observed in flight at once.
    #[must_use]
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Waits out the latency while tracking concurrency.
    async fn simulate_latency(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    /// Records the call and returns a scripted failure if one matches.
    fn check(
        inner: &mut Inner,
        operation: Operation,
        attributes: Option<&Attributes>,
    ) -> ProviderResult<()> {
        *inner.calls.entry(operation).or_insert(0) += 1;

        let Some(rule) = inner
            .rules
            .iter_mut()
            .find(|r| r.matches(operation, attributes))
        else {
            return Ok(());
        };

        if let Some(times) = rule.times.as_mut() {
            *times -= 1;
        }

        let name = operation.to_string();
        let message = String::from("scripted failure");
        Err(if rule.retryable {
            ProviderError::retryable(name, message)
        } else {
            ProviderError::terminal(name, message)
        })
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    async fn create(&self, attributes: &Attributes) -> ProviderResult<Created> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        Self::check(&mut inner, Operation::Create, Some(attributes))?;

        inner.next_id += 1;
        let id = format!("{}-{}", self.schema.resource_type, inner.next_id);
        inner.objects.insert(id.clone(), attributes.clone());
        debug!("memory provider created {id}");

        Ok(Created {
            id,
            attributes: attributes.clone(),
        })
    }

    async fn read(&self, id: &str) -> ProviderResult<Option<Attributes>> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        let current = inner.objects.get(id).cloned();
        Self::check(&mut inner, Operation::Read, current.as_ref())?;
        Ok(current)
    }

    async fn update(&self, id: &str, attributes: &Attributes) -> ProviderResult<Attributes> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        Self::check(&mut inner, Operation::Update, Some(attributes))?;

        let Some(object) = inner.objects.get_mut(id) else {
            return Err(ProviderError::NotFound { id: id.to_string() });
        };
        object.clone_from(attributes);
        Ok(attributes.clone())
    }

    async fn delete(&self, id: &str) -> ProviderResult<()> {
        self.simulate_latency().await;
        let mut inner = self.inner.lock().await;
        let current = inner.objects.get(id).cloned();
        Self::check(&mut inner, Operation::Delete, current.as_ref())?;

        if inner.objects.remove(id).is_none() {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }
        Ok(())
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(name: &str) -> Attributes {
        Attributes::from([(String::from("name"), json!(name))])
    }

    #[tokio::test]
    async fn test_crud_cycle() {
        let provider = MemoryProvider::new(ResourceSchema::new("bucket"));

        let created = provider.create(&attrs("a")).await.expect("create");
        assert_eq!(created.id, "bucket-1");
        assert_eq!(provider.read(&created.id).await.expect("read"), Some(attrs("a")));

        provider.update(&created.id, &attrs("b")).await.expect("update");
        assert_eq!(provider.object(&created.id).await, Some(attrs("b")));

        provider.delete(&created.id).await.expect("delete");
        assert_eq!(provider.read(&created.id).await.expect("read"), None);
        assert_eq!(
            provider.delete(&created.id).await,
            Err(ProviderError::NotFound { id: created.id.clone() })
        );
    }

    #[tokio::test]
    async fn test_targeted_failure_with_budget() {
        let provider = MemoryProvider::new(ResourceSchema::new("bucket"));
        provider
            .fail(FailureRule::when(Operation::Create, "name", json!("b"), true).times(1))
            .await;

        assert!(provider.create(&attrs("a")).await.is_ok());
        let err = provider.create(&attrs("b")).await.expect_err("scripted failure");
        assert!(err.is_retryable());
        assert!(provider.create(&attrs("b")).await.is_ok());
        assert_eq!(provider.calls(Operation::Create).await, 3);
    }
}
