//! Graph construction from declarations.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::{ConvergeError, GraphError, Result};
use crate::provider::ProviderRegistry;
use crate::resource::{Address, ResourceDeclaration, ResourceSchema};

use super::{ResourceGraph, ResourceNode};

/// Builds [`ResourceGraph`]s, resolving each type's schema once.
#[derive(Debug)]
pub struct GraphBuilder<'a> {
    registry: &'a ProviderRegistry,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

impl<'a> GraphBuilder<'a> {
    /// Creates a builder resolving types against `registry`.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Builds and validates the graph.
    ///
    /// Pure transformation: no provider or state calls are made.
    ///
    /// # Errors
    ///
    /// Returns a [`GraphError`] for malformed addresses, duplicate
    /// addresses, unknown resource types, unresolved references and
    /// dependency cycles.
    pub fn build(
        &self,
        declarations: impl IntoIterator<Item = ResourceDeclaration>,
    ) -> Result<ResourceGraph> {
        let mut schemas: HashMap<String, Arc<ResourceSchema>> = HashMap::new();
        let mut nodes: BTreeMap<Address, ResourceNode> = BTreeMap::new();

        for decl in declarations {
            decl.address.validate()?;
            for reference in decl.attributes.values().flat_map(|v| v.references()) {
                reference.validate()?;
            }

            let schema = match schemas.get(&decl.address.resource_type) {
                Some(schema) => Arc::clone(schema),
                None => {
                    let schema = Arc::new(self.registry.schema(&decl.address.resource_type)?.clone());
                    schemas.insert(decl.address.resource_type.clone(), Arc::clone(&schema));
                    schema
                }
            };

            let implicit_dependencies = decl
                .attributes
                .values()
                .flat_map(|v| v.references())
                .map(|r| r.address.clone())
                .collect();

            let node = ResourceNode {
                address: decl.address.clone(),
                attributes: decl.attributes,
                explicit_dependencies: decl.depends_on.into_iter().collect(),
                implicit_dependencies,
                lifecycle: decl.lifecycle,
                schema,
            };

            if nodes.insert(decl.address.clone(), node).is_some() {
                return Err(GraphError::DuplicateAddress {
                    address: decl.address.to_string(),
                }
                .into());
            }
        }

        Self::check_references(&nodes)?;
        let order = Self::topological_order(&nodes)?;

        debug!("Built resource graph with {} nodes", nodes.len());
        Ok(ResourceGraph { nodes, order })
    }

    /// Rejects references and explicit dependencies to undeclared addresses.
    fn check_references(nodes: &BTreeMap<Address, ResourceNode>) -> Result<()> {
        for node in nodes.values() {
            for reference in node.attributes.values().flat_map(|v| v.references()) {
                if !nodes.contains_key(&reference.address) {
                    return Err(GraphError::UnresolvedReference {
                        from: node.address.to_string(),
                        target: reference.to_string(),
                    }
                    .into());
                }
            }

            if let Some(missing) = node
                .explicit_dependencies
                .iter()
                .find(|dep| !nodes.contains_key(*dep))
            {
                return Err(GraphError::UnresolvedReference {
                    from: node.address.to_string(),
                    target: missing.to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Depth-first traversal with a recursion stack; emits dependencies
    /// before dependents and fails on the first back edge.
    fn topological_order(nodes: &BTreeMap<Address, ResourceNode>) -> Result<Vec<Address>> {
        let mut marks: HashMap<&Address, Mark> = HashMap::new();
        let mut stack: Vec<&Address> = Vec::new();
        let mut order = Vec::with_capacity(nodes.len());

        for address in nodes.keys() {
            Self::visit(address, nodes, &mut marks, &mut stack, &mut order)?;
        }

        Ok(order)
    }

    fn visit<'n>(
        address: &'n Address,
        nodes: &'n BTreeMap<Address, ResourceNode>,
        marks: &mut HashMap<&'n Address, Mark>,
        stack: &mut Vec<&'n Address>,
        order: &mut Vec<Address>,
    ) -> Result<()> {
        match marks.get(address) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|a| *a == address).unwrap_or(0);
                let mut chain: Vec<String> = stack[start..].iter().map(ToString::to_string).collect();
                chain.push(address.to_string());
                return Err(ConvergeError::Graph(GraphError::Cycle { chain }));
            }
            None => {}
        }

        let Some(node) = nodes.get(address) else {
            return Ok(());
        };

        marks.insert(address, Mark::Visiting);
        stack.push(address);

        for dep in node
            .explicit_dependencies
            .iter()
            .chain(node.implicit_dependencies.iter())
        {
            if let Some((dep_address, _)) = nodes.get_key_value(dep) {
                Self::visit(dep_address, nodes, marks, stack, order)?;
            }
        }

        stack.pop();
        marks.insert(address, Mark::Done);
        order.push(address.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use crate::resource::Value;
    use proptest::prelude::*;
    use serde_json::json;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new("vpc"))))
            .with(Arc::new(MemoryProvider::new(ResourceSchema::new("subnet"))))
    }

    fn addr(s: &str) -> Address {
        s.parse().expect("valid address")
    }

    #[test]
    fn test_implicit_dependency_from_reference() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("subnet.app"))
                    .attribute("vpc_id", addr("vpc.main").attr("id"))
                    .attribute("cidr", Value::literal("10.0.1.0/24")),
                ResourceDeclaration::new(addr("vpc.main")).attribute("cidr", Value::literal("10.0.0.0/16")),
            ])
            .expect("valid graph");

        let subnet = graph.get(&addr("subnet.app")).expect("declared");
        assert!(subnet.implicit_dependencies.contains(&addr("vpc.main")));
        assert!(subnet.explicit_dependencies.is_empty());
        assert_eq!(graph.topological_order(), &[addr("vpc.main"), addr("subnet.app")]);
        assert_eq!(graph.dependents(&addr("vpc.main")), vec![&addr("subnet.app")]);
    }

    #[test]
    fn test_explicit_dependencies_are_merged() {
        let registry = registry();
        let graph = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("vpc.a")),
                ResourceDeclaration::new(addr("vpc.b")).depends_on(addr("vpc.a")),
                ResourceDeclaration::new(addr("subnet.s"))
                    .attribute("vpc_id", addr("vpc.b").attr("id"))
                    .depends_on(addr("vpc.a")),
            ])
            .expect("valid graph");

        let subnet = graph.get(&addr("subnet.s")).expect("declared");
        let deps: Vec<Address> = subnet.dependencies().into_iter().collect();
        assert_eq!(deps, vec![addr("vpc.a"), addr("vpc.b")]);
    }

    #[test]
    fn test_cycle_lists_chain() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("vpc.a")).attribute("x", addr("vpc.b").attr("id")),
                ResourceDeclaration::new(addr("vpc.b")).attribute("x", addr("vpc.c").attr("id")),
                ResourceDeclaration::new(addr("vpc.c")).depends_on(addr("vpc.a")),
            ])
            .expect_err("cycle");

        match err {
            ConvergeError::Graph(GraphError::Cycle { chain }) => {
                assert_eq!(chain, vec!["vpc.a", "vpc.b", "vpc.c", "vpc.a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("vpc.a")).attribute("x", addr("vpc.a").attr("name")),
            ])
            .expect_err("cycle");
        assert!(matches!(err, ConvergeError::Graph(GraphError::Cycle { .. })));
    }

    #[test]
    fn test_unresolved_reference() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("subnet.app")).attribute("vpc_id", addr("vpc.gone").attr("id")),
            ])
            .expect_err("unresolved");

        match err {
            ConvergeError::Graph(GraphError::UnresolvedReference { from, target }) => {
                assert_eq!(from, "subnet.app");
                assert_eq!(target, "vpc.gone.id");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_unresolved_explicit_dependency() {
        let registry = registry();
        let err = GraphBuilder::new(&registry)
            .build(vec![ResourceDeclaration::new(addr("subnet.app")).depends_on(addr("vpc.gone"))])
            .expect_err("unresolved");
        assert!(err.is_configuration_error());
    }

    #[test]
    fn test_duplicate_and_unknown_type() {
        let registry = registry();
        let dup = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("vpc.a")),
                ResourceDeclaration::new(addr("vpc.a")).attribute("x", Value::literal(json!(1))),
            ])
            .expect_err("duplicate");
        assert!(matches!(dup, ConvergeError::Graph(GraphError::DuplicateAddress { .. })));

        let unknown = GraphBuilder::new(&registry)
            .build(vec![ResourceDeclaration::new(addr("dns.zone"))])
            .expect_err("unknown type");
        assert!(matches!(unknown, ConvergeError::Graph(GraphError::UnknownResourceType { .. })));
    }

    #[test]
    fn test_malformed_addresses_rejected_before_use() {
        let registry = registry();
        let dotted = GraphBuilder::new(&registry)
            .build(vec![ResourceDeclaration::new(Address::new("vpc", "a.b"))])
            .expect_err("dotted name");
        assert!(matches!(dotted, ConvergeError::Graph(GraphError::InvalidAddress { .. })));
        assert!(dotted.is_configuration_error());

        let bad_path = GraphBuilder::new(&registry)
            .build(vec![
                ResourceDeclaration::new(addr("vpc.a")),
                ResourceDeclaration::new(addr("subnet.s"))
                    .attribute("vpc_id", addr("vpc.a").attr("tags..x")),
            ])
            .expect_err("bad attribute path");
        assert!(matches!(bad_path, ConvergeError::Graph(GraphError::InvalidAddress { .. })));

        GraphBuilder::new(&registry)
            .build(vec![ResourceDeclaration::new(Address::new("vpc", "main").with_key("eu\"west"))])
            .expect("quoted keys may hold any text");
    }

    proptest! {
        /// Edges only point from higher to lower indices, so every generated
        /// graph is acyclic and must produce a valid topological order.
        #[test]
        fn prop_acyclic_declarations_always_build(
            edges in proptest::collection::vec((0usize..12, 0usize..12), 0..40)
        ) {
            let registry = registry();
            let mut decls: Vec<ResourceDeclaration> = (0..12)
                .map(|i| ResourceDeclaration::new(Address::new("vpc", format!("n{i}"))))
                .collect();
            for (a, b) in edges {
                let (from, to) = if a > b { (a, b) } else if b > a { (b, a) } else { continue };
                let target = Address::new("vpc", format!("n{to}"));
                decls[from] = decls[from].clone().attribute(format!("ref_{to}"), target.attr("id"));
            }

            let graph = GraphBuilder::new(&registry).build(decls).expect("acyclic graph builds");
            let order = graph.topological_order();
            prop_assert_eq!(order.len(), 12);
            for (pos, address) in order.iter().enumerate() {
                let node = graph.get(address).expect("node in graph");
                for dep in node.dependencies() {
                    let dep_pos = order.iter().position(|a| *a == dep).expect("dep in order");
                    prop_assert!(dep_pos < pos);
                }
            }
        }
    }
}
