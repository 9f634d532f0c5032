//! Resource declarations as delivered by the declaration source.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::address::Address;
use super::schema::{ReplacePolicy, ResourceSchema};
use super::value::Value;

/// One declared resource instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDeclaration {
    /// Unique address.
    pub address: Address,
    /// Declared attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Explicit dependencies, independent of attribute references.
    #[serde(default)]
    pub depends_on: Vec<Address>,
    /// Per-resource lifecycle controls.
    #[serde(default)]
    pub lifecycle: Lifecycle,
}

/// Per-resource lifecycle controls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle {
    /// Overrides the type's replacement order when set.
    #[serde(default)]
    pub create_before_destroy: Option<bool>,
    /// Refuse any plan that would destroy this resource.
    #[serde(default)]
    pub prevent_destroy: bool,
    /// Attributes excluded from diffing for this resource.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
}

impl ResourceDeclaration {
    /// Creates a declaration with no attributes.
    #[must_use]
    pub fn new(address: Address) -> Self {
        Self {
            address,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
            lifecycle: Lifecycle::default(),
        }
    }

    /// Adds an attribute.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn depends_on(mut self, address: Address) -> Self {
        self.depends_on.push(address);
        self
    }

    /// Replaces the lifecycle block.
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: Lifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }
}

impl Lifecycle {
    /// Resolves the effective replacement order against the type default.
    #[must_use]
    pub fn replace_policy(&self, schema: &ResourceSchema) -> ReplacePolicy {
        match self.create_before_destroy {
            Some(true) => ReplacePolicy::CreateBeforeDestroy,
            Some(false) => ReplacePolicy::DestroyBeforeCreate,
            None => schema.replace_policy,
        }
    }

    /// Merges this resource's ignore set with the type's.
    #[must_use]
    pub fn effective_ignores(&self, schema: &ResourceSchema) -> BTreeSet<String> {
        self.ignore_changes
            .union(&schema.ignore_changes)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_overrides_type_policy() {
        let schema = ResourceSchema::new("db").destroy_before_create();
        assert_eq!(
            Lifecycle::default().replace_policy(&schema),
            ReplacePolicy::DestroyBeforeCreate
        );

        let lifecycle = Lifecycle {
            create_before_destroy: Some(true),
            ..Lifecycle::default()
        };
        assert_eq!(
            lifecycle.replace_policy(&schema),
            ReplacePolicy::CreateBeforeDestroy
        );
    }

    #[test]
    fn test_effective_ignores_union() {
        let schema = ResourceSchema::new("db").with_ignored(["tags"]);
        let lifecycle = Lifecycle {
            ignore_changes: BTreeSet::from([String::from("size")]),
            ..Lifecycle::default()
        };
        let ignores = lifecycle.effective_ignores(&schema);
        assert!(ignores.contains("tags"));
        assert!(ignores.contains("size"));
    }

    #[test]
    fn test_deserialize_declaration() {
        let json = serde_json::json!({
            "address": "aws_subnet.app[0]",
            "attributes": {
                "cidr": {"literal": "10.0.1.0/24"},
                "vpc_id": {"reference": "aws_vpc.main.id"}
            },
            "depends_on": ["aws_iam_role.net"],
            "lifecycle": {"ignore_changes": ["tags"]}
        });
        let decl: ResourceDeclaration = serde_json::from_value(json).expect("valid declaration");
        assert_eq!(decl.address, Address::new("aws_subnet", "app").with_index(0));
        assert_eq!(decl.attributes.len(), 2);
        assert_eq!(decl.depends_on, vec![Address::new("aws_iam_role", "net")]);
        assert!(decl.lifecycle.ignore_changes.contains("tags"));
    }
}
