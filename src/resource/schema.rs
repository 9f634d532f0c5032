//! Per-type resource schemas.
//!
//! A schema statically tags attributes as mutable (the default) or
//! immutable, lists provider-computed attributes, and carries the type's
//! replacement policy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Order in which the two halves of a replacement run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePolicy {
    /// Create the replacement, then destroy the old object.
    #[default]
    CreateBeforeDestroy,
    /// Destroy the old object, then create the replacement.
    DestroyBeforeCreate,
}

/// Static description of a resource type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSchema {
    /// Resource type name.
    pub resource_type: String,
    /// Schema version written into every record of this type.
    pub version: u32,
    /// Attributes whose change forces replacement.
    pub immutable: BTreeSet<String>,
    /// Attributes assigned by the provider; not diffed unless declared.
    pub computed: BTreeSet<String>,
    /// Attributes never diffed for this type.
    pub ignore_changes: BTreeSet<String>,
    /// Default replacement order.
    pub replace_policy: ReplacePolicy,
}

impl ResourceSchema {
    /// Creates a schema where every attribute is mutable.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            version: 1,
            immutable: BTreeSet::new(),
            computed: BTreeSet::new(),
            ignore_changes: BTreeSet::new(),
            replace_policy: ReplacePolicy::default(),
        }
    }

    /// Sets the schema version.
    #[must_use]
    pub const fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Tags attributes as immutable.
    #[must_use]
    pub fn with_immutable<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.immutable.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Tags attributes as provider-computed.
    #[must_use]
    pub fn with_computed<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.computed.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Excludes attributes from diffing for every resource of this type.
    #[must_use]
    pub fn with_ignored<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore_changes.extend(attributes.into_iter().map(Into::into));
        self
    }

    /// Marks the type as destroy-before-create.
    #[must_use]
    pub const fn destroy_before_create(mut self) -> Self {
        self.replace_policy = ReplacePolicy::DestroyBeforeCreate;
        self
    }

    /// Returns true if changing `attribute` forces replacement.
    #[must_use]
    pub fn is_immutable(&self, attribute: &str) -> bool {
        self.immutable.contains(attribute)
    }

    /// Returns true if `attribute` is assigned by the provider.
    #[must_use]
    pub fn is_computed(&self, attribute: &str) -> bool {
        self.computed.contains(attribute)
    }
}

impl std::fmt::Display for ReplacePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CreateBeforeDestroy => "create-before-destroy",
            Self::DestroyBeforeCreate => "destroy-before-create",
        };
        write!(f, "{s}")
    }
}
