//! Provider action backends.
//!
//! Each resource type is served by one [`Provider`] exposing idempotent
//! create/read/update/delete calls. Providers are registered by type in a
//! [`ProviderRegistry`] that the graph builder, diff engine, executor and
//! drift detector resolve against.

mod memory;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConvergeError, GraphError, ProviderError, Result};
use crate::resource::{Attributes, ResourceSchema};

pub use memory::{FailureRule, MemoryProvider, Operation};

/// Result type for provider calls.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// An object created by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created {
    /// Provider-assigned identifier.
    pub id: String,
    /// Attributes as reported after creation.
    pub attributes: Attributes,
}

/// Capability interface for one resource type.
///
/// Every call must be idempotent: a brief window where two lock holders
/// overlap after a lease expiry is tolerated by the engine.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Static schema of the resource type served by this provider.
    fn schema(&self) -> &ResourceSchema;

    /// Creates an object from fully-resolved attributes.
    async fn create(&self, attributes: &Attributes) -> ProviderResult<Created>;

    /// Reads the live attributes of an object, `None` if it does not exist.
    async fn read(&self, id: &str) -> ProviderResult<Option<Attributes>>;

    /// Updates an object in place, returning its new attributes.
    async fn update(&self, id: &str, attributes: &Attributes) -> ProviderResult<Attributes>;

    /// Deletes an object.
    async fn delete(&self, id: &str) -> ProviderResult<()>;
}

/// Providers keyed by resource type.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a provider under its schema's resource type.
    ///
    /// A later registration for the same type replaces the earlier one.
    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        let resource_type = provider.schema().resource_type.clone();
        self.providers.insert(resource_type, provider);
    }

    /// Builder-style [`Self::register`].
    #[must_use]
    pub fn with(mut self, provider: Arc<dyn Provider>) -> Self {
        self.register(provider);
        self
    }

    /// Resolves the provider for a resource type.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownResourceType`] if none is registered.
    pub fn get(&self, resource_type: &str) -> Result<&Arc<dyn Provider>> {
        self.providers.get(resource_type).ok_or_else(|| {
            ConvergeError::Graph(GraphError::UnknownResourceType {
                resource_type: resource_type.to_string(),
            })
        })
    }

    /// Resolves the schema for a resource type.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownResourceType`] if none is registered.
    pub fn schema(&self, resource_type: &str) -> Result<&ResourceSchema> {
        self.get(resource_type).map(|p| p.schema())
    }

    /// Returns the registered resource types, sorted.
    #[must_use]
    pub fn resource_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("resource_types", &self.resource_types())
            .finish()
    }
}
