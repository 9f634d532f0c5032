//! Resource dependency graph.
//!
//! This module turns a flat set of declarations into a validated DAG:
//! - implicit dependencies extracted from attribute references
//! - explicit dependencies merged in
//! - unresolved references and cycles rejected before planning

mod builder;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::resource::{Address, Lifecycle, ReplacePolicy, ResourceSchema, Value};

pub use builder::GraphBuilder;

/// One declared resource inside the graph.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    /// Unique address.
    pub address: Address,
    /// Declared attributes, possibly containing references.
    pub attributes: BTreeMap<String, Value>,
    /// Dependencies declared explicitly.
    pub explicit_dependencies: BTreeSet<Address>,
    /// Dependencies derived from attribute references.
    pub implicit_dependencies: BTreeSet<Address>,
    /// Lifecycle controls.
    pub lifecycle: Lifecycle,
    /// Schema of the node's type, resolved once at build time.
    pub schema: Arc<ResourceSchema>,
}

/// A validated, acyclic resource graph.
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: BTreeMap<Address, ResourceNode>,
    order: Vec<Address>,
}

impl ResourceNode {
    /// Union of explicit and implicit dependencies.
    #[must_use]
    pub fn dependencies(&self) -> BTreeSet<Address> {
        self.explicit_dependencies
            .union(&self.implicit_dependencies)
            .cloned()
            .collect()
    }

    /// Effective replacement order.
    #[must_use]
    pub fn replace_policy(&self) -> ReplacePolicy {
        self.lifecycle.replace_policy(&self.schema)
    }

    /// Attributes excluded from diffing.
    #[must_use]
    pub fn ignored_attributes(&self) -> BTreeSet<String> {
        self.lifecycle.effective_ignores(&self.schema)
    }
}

impl ResourceGraph {
    /// Gets a node by address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&ResourceNode> {
        self.nodes.get(address)
    }

    /// Returns true if the address is declared.
    #[must_use]
    pub fn contains(&self, address: &Address) -> bool {
        self.nodes.contains_key(address)
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterates nodes in address order.
    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Addresses in dependency order: every node follows its dependencies.
    #[must_use]
    pub fn topological_order(&self) -> &[Address] {
        &self.order
    }

    /// Addresses of nodes that depend directly on `address`.
    #[must_use]
    pub fn dependents(&self, address: &Address) -> Vec<&Address> {
        self.nodes
            .values()
            .filter(|n| {
                n.explicit_dependencies.contains(address)
                    || n.implicit_dependencies.contains(address)
            })
            .map(|n| &n.address)
            .collect()
    }
}
