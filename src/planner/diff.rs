//! Diff engine for comparing desired attributes against stored records.
//!
//! Nodes are classified in dependency order so that a reference to a
//! resource that is about to be created or replaced is known to be
//! "known after apply" when its dependents are compared.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info, warn};

use crate::config::ReadThrough;
use crate::error::{GraphError, PlanError, Result};
use crate::graph::{ResourceGraph, ResourceNode};
use crate::provider::ProviderRegistry;
use crate::resource::{Address, Attributes, Reference, ReplacePolicy, ResourceSchema, Value};
use crate::state::{ResourceRecord, StateSnapshot};

/// Engine for computing diffs between declarations and state.
#[derive(Debug, Clone, Copy)]
pub struct DiffEngine<'a> {
    /// Whether stored records are checked against providers.
    read_through: ReadThrough,
    /// Providers used for read-through.
    registry: Option<&'a ProviderRegistry>,
}

/// Action required for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// No record exists.
    Create,
    /// Attributes are equal but the record's bookkeeping is outdated.
    Update,
    /// Only mutable attributes changed.
    UpdateInPlace,
    /// An immutable attribute changed.
    Replace,
    /// The record has no declaration.
    Delete,
    /// Nothing to do.
    NoOp,
}

/// One attribute that differs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// Attribute name.
    pub attribute: String,
    /// Stored value.
    pub old: Option<serde_json::Value>,
    /// Desired value, possibly known only after apply.
    pub new: Option<Value>,
    /// Whether this change alone forces replacement.
    pub forces_replacement: bool,
}

/// Classified change for one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Resource address.
    pub address: Address,
    /// Required action.
    pub kind: ActionKind,
    /// Record the change starts from.
    pub prior: Option<ResourceRecord>,
    /// Desired attributes, with references resolved where already known.
    pub desired: BTreeMap<String, Value>,
    /// Dependencies to record after apply.
    pub dependencies: BTreeSet<Address>,
    /// Attributes that differ.
    pub changes: Vec<AttributeChange>,
    /// Replacement order, meaningful for `Replace`.
    pub replace_policy: ReplacePolicy,
    /// Schema version to record after apply.
    pub schema_version: u32,
    /// Per-resource ignore set to record after apply.
    pub ignore_changes: BTreeSet<String>,
    /// True if `prior` is a deposed object rather than the current record.
    pub deposed: bool,
}

/// A stored identifier no longer resolves at the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleRecordWarning {
    /// Resource address.
    pub address: Address,
    /// Identifier that no longer resolves.
    pub id: String,
}

/// Complete diff result.
#[derive(Debug, Clone, Default)]
pub struct DiffResult {
    /// Every classified change: declared resources in dependency order,
    /// then removals and deposed objects.
    pub changes: Vec<ResourceChange>,
    /// Recoverable warnings raised during read-through.
    pub warnings: Vec<StaleRecordWarning>,
}

/// What a reference to an already-classified node resolves to.
enum Resolution {
    Known { id: String, attributes: Attributes },
    Unknown,
}

impl Default for DiffEngine<'_> {
    fn default() -> Self {
        Self {
            read_through: ReadThrough::Disabled,
            registry: None,
        }
    }
}

impl DiffEngine<'static> {
    /// Creates a diff engine that trusts stored records.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            read_through: ReadThrough::Disabled,
            registry: None,
        }
    }
}

impl<'a> DiffEngine<'a> {
    /// Enables read-through against the given providers.
    #[must_use]
    pub const fn with_read_through<'b>(
        self,
        mode: ReadThrough,
        registry: &'b ProviderRegistry,
    ) -> DiffEngine<'b> {
        DiffEngine {
            read_through: mode,
            registry: Some(registry),
        }
    }

    /// Computes the diff between the graph and the stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if a protected resource would be destroyed, a
    /// removed resource still has dependents that are not being changed,
    /// or a read-through call fails.
    pub async fn compute_diff(
        &self,
        graph: &ResourceGraph,
        snapshot: Option<&StateSnapshot>,
    ) -> Result<DiffResult> {
        let mut result = DiffResult::default();
        let mut resolved: HashMap<Address, Resolution> = HashMap::new();

        for address in graph.topological_order() {
            let Some(node) = graph.get(address) else {
                continue;
            };
            let record = snapshot.and_then(|s| s.get(address));
            let change = self
                .diff_node(node, record, &resolved, &mut result.warnings)
                .await?;
            debug!("{}: {}", change.address, change.kind);

            resolved.insert(address.clone(), resolution_of(&change));
            result.changes.push(change);
        }

        if let Some(snapshot) = snapshot {
            for record in snapshot.records().filter(|r| !graph.contains(&r.address)) {
                debug!("{}: delete (no longer declared)", record.address);
                result.changes.push(removal(record, false));
            }
            for record in &snapshot.deposed {
                debug!("{}: delete deposed object {}", record.address, record.id);
                result.changes.push(removal(record, true));
            }
            check_dependents(&result.changes, snapshot)?;
        }

        info!(
            "Diff: {} to create, {} to update, {} to replace, {} to delete, {} unchanged",
            result.count(ActionKind::Create),
            result.count(ActionKind::Update) + result.count(ActionKind::UpdateInPlace),
            result.count(ActionKind::Replace),
            result.count(ActionKind::Delete),
            result.count(ActionKind::NoOp)
        );
        Ok(result)
    }

    /// Classifies one declared node.
    async fn diff_node(
        &self,
        node: &ResourceNode,
        record: Option<&ResourceRecord>,
        resolved: &HashMap<Address, Resolution>,
        warnings: &mut Vec<StaleRecordWarning>,
    ) -> Result<ResourceChange> {
        let lookup = |reference: &Reference| match resolved.get(&reference.address)? {
            Resolution::Known { id, attributes } => reference.lookup(id, attributes),
            Resolution::Unknown => None,
        };
        let mut desired: BTreeMap<String, Value> = node
            .attributes
            .iter()
            .map(|(name, value)| (name.clone(), value.resolve(&lookup)))
            .collect();

        let mut change = ResourceChange {
            address: node.address.clone(),
            kind: ActionKind::Create,
            prior: None,
            desired: BTreeMap::new(),
            dependencies: node.dependencies(),
            changes: Vec::new(),
            replace_policy: node.replace_policy(),
            schema_version: node.schema.version,
            ignore_changes: node.lifecycle.ignore_changes.clone(),
            deposed: false,
        };

        let prior = match record {
            Some(record) => self.read_through(record, warnings).await?,
            None => None,
        };

        let Some((prior, refreshed)) = prior else {
            change.changes = desired
                .iter()
                .map(|(name, value)| AttributeChange {
                    attribute: name.clone(),
                    old: None,
                    new: Some(value.clone()),
                    forces_replacement: false,
                })
                .collect();
            change.desired = desired;
            return Ok(change);
        };

        let ignored = node.ignored_attributes();
        change.changes = compare(&node.schema, &desired, &prior.attributes, &ignored);

        change.kind = if change.changes.iter().any(|c| c.forces_replacement) {
            ActionKind::Replace
        } else if !change.changes.is_empty() {
            ActionKind::UpdateInPlace
        } else if refreshed || bookkeeping_outdated(&prior, &change) {
            ActionKind::Update
        } else {
            ActionKind::NoOp
        };

        if change.kind == ActionKind::Replace && node.lifecycle.prevent_destroy {
            return Err(PlanError::DestroyPrevented {
                address: node.address.to_string(),
            }
            .into());
        }

        if change.kind == ActionKind::UpdateInPlace {
            for name in &ignored {
                if let Some(stored) = prior.attributes.get(name) {
                    desired.insert(name.clone(), Value::Literal(stored.clone()));
                }
            }
        }

        change.desired = desired;
        change.prior = Some(prior);
        Ok(change)
    }

    /// Applies the read-through mode to a stored record.
    ///
    /// Returns `None` if the object is gone, otherwise the record to diff
    /// against and whether its attributes were refreshed from the provider.
    async fn read_through(
        &self,
        record: &ResourceRecord,
        warnings: &mut Vec<StaleRecordWarning>,
    ) -> Result<Option<(ResourceRecord, bool)>> {
        let registry = match (self.read_through, self.registry) {
            (ReadThrough::Disabled, _) | (_, None) => return Ok(Some((record.clone(), false))),
            (_, Some(registry)) => registry,
        };

        let provider = registry.get(&record.address.resource_type)?;
        let Some(live) = provider.read(&record.id).await? else {
            warn!(
                "{} ({}) no longer exists at the provider, planning a create",
                record.address, record.id
            );
            warnings.push(StaleRecordWarning {
                address: record.address.clone(),
                id: record.id.clone(),
            });
            return Ok(None);
        };

        if self.read_through == ReadThrough::Refresh && live != record.attributes {
            debug!("{}: refreshed attributes from provider", record.address);
            let mut refreshed = record.clone();
            refreshed.attributes = live;
            return Ok(Some((refreshed, true)));
        }

        Ok(Some((record.clone(), false)))
    }
}

/// Compares desired attributes against stored ones.
///
/// Compared keys are the declared ones plus stored non-computed ones;
/// ignored attributes are dropped before mutability is considered.
fn compare(
    schema: &ResourceSchema,
    desired: &BTreeMap<String, Value>,
    stored: &Attributes,
    ignored: &BTreeSet<String>,
) -> Vec<AttributeChange> {
    let keys: BTreeSet<&String> = desired
        .keys()
        .chain(stored.keys().filter(|k| !schema.is_computed(k.as_str())))
        .filter(|k| !ignored.contains(*k))
        .collect();

    keys.into_iter()
        .filter_map(|name| {
            let old = stored.get(name);
            let new = desired.get(name);
            let changed = match new {
                Some(value) => value.known().map_or(true, |known| Some(&known) != old),
                None => old.is_some(),
            };
            changed.then(|| AttributeChange {
                attribute: name.clone(),
                old: old.cloned(),
                new: new.cloned(),
                forces_replacement: schema.is_immutable(name),
            })
        })
        .collect()
}

/// True if the stored record would be rewritten even with equal attributes.
fn bookkeeping_outdated(prior: &ResourceRecord, change: &ResourceChange) -> bool {
    prior.schema_version < change.schema_version
        || !prior.dependencies.iter().eq(change.dependencies.iter())
        || prior.ignore_changes != change.ignore_changes
}

/// What dependents of this change will see when they are compared.
fn resolution_of(change: &ResourceChange) -> Resolution {
    let Some(prior) = &change.prior else {
        return Resolution::Unknown;
    };

    match change.kind {
        ActionKind::NoOp | ActionKind::Update => Resolution::Known {
            id: prior.id.clone(),
            attributes: prior.attributes.clone(),
        },
        ActionKind::UpdateInPlace => {
            let mut attributes = prior.attributes.clone();
            for (name, value) in &change.desired {
                match value.known() {
                    Some(known) => attributes.insert(name.clone(), known),
                    None => attributes.remove(name),
                };
            }
            Resolution::Known {
                id: prior.id.clone(),
                attributes,
            }
        }
        ActionKind::Create | ActionKind::Replace | ActionKind::Delete => Resolution::Unknown,
    }
}

/// A delete for a stored or deposed record.
fn removal(record: &ResourceRecord, deposed: bool) -> ResourceChange {
    ResourceChange {
        address: record.address.clone(),
        kind: ActionKind::Delete,
        prior: Some(record.clone()),
        desired: BTreeMap::new(),
        dependencies: BTreeSet::new(),
        changes: Vec::new(),
        replace_policy: ReplacePolicy::default(),
        schema_version: record.schema_version,
        ignore_changes: record.ignore_changes.clone(),
        deposed,
    }
}

/// Rejects removals whose recorded dependents keep their live object as is.
///
/// A dependent that is replaced, deleted or updated in place is ordered
/// before the removal by the plan builder; one whose provider object is
/// left untouched would still point at the deleted resource.
fn check_dependents(changes: &[ResourceChange], snapshot: &StateSnapshot) -> Result<()> {
    let kinds: HashMap<&Address, ActionKind> = changes
        .iter()
        .filter(|c| !c.deposed)
        .map(|c| (&c.address, c.kind))
        .collect();

    for removed in changes
        .iter()
        .filter(|c| c.kind == ActionKind::Delete && !c.deposed)
    {
        let blocking: Vec<String> = snapshot
            .records()
            .filter(|r| r.address != removed.address && r.dependencies.contains(&removed.address))
            .filter(|r| {
                matches!(
                    kinds.get(&r.address),
                    Some(ActionKind::NoOp | ActionKind::Update)
                )
            })
            .map(|r| r.address.to_string())
            .collect();

        if !blocking.is_empty() {
            return Err(GraphError::DependentsRemain {
                address: removed.address.to_string(),
                dependents: blocking,
            }
            .into());
        }
    }

    Ok(())
}

impl ActionKind {
    /// Returns true unless this is `NoOp`.
    #[must_use]
    pub const fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }

    /// Returns true if the action calls a provider.
    #[must_use]
    pub const fn calls_provider(self) -> bool {
        !matches!(self, Self::NoOp | Self::Update)
    }
}

impl DiffResult {
    /// Change for a declared or stored address, ignoring deposed objects.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&ResourceChange> {
        self.changes
            .iter()
            .find(|c| &c.address == address && !c.deposed)
    }

    /// Number of changes of the given kind.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.changes.iter().filter(|c| c.kind == kind).count()
    }

    /// Returns true if anything is not `NoOp`.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.changes.iter().any(|c| c.kind.is_change())
    }

    /// Addresses classified `NoOp`.
    #[must_use]
    pub fn unchanged(&self) -> Vec<Address> {
        self.changes
            .iter()
            .filter(|c| c.kind == ActionKind::NoOp)
            .map(|c| c.address.clone())
            .collect()
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::UpdateInPlace => "update in place",
            Self::Replace => "replace",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for AttributeChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let old = self
            .old
            .as_ref()
            .map_or_else(|| String::from("(none)"), ToString::to_string);
        let new = self
            .new
            .as_ref()
            .map_or_else(|| String::from("(none)"), ToString::to_string);
        write!(f, "{}: {old} -> {new}", self.attribute)?;
        if self.forces_replacement {
            write!(f, " (forces replacement)")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for StaleRecordWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) no longer exists and will be created again",
            self.address, self.id
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConvergeError;
    use crate::graph::GraphBuilder;
    use crate::provider::{MemoryProvider, Provider};
    use crate::resource::{Lifecycle, ResourceDeclaration};
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::Arc;

    fn registry() -> ProviderRegistry {
        ProviderRegistry::new()
            .with(Arc::new(MemoryProvider::new(
                ResourceSchema::new("vpc")
                    .with_immutable(["cidr"])
                    .with_computed(["arn"]),
            )))
            .with(Arc::new(MemoryProvider::new(
                ResourceSchema::new("subnet").with_immutable(["vpc_id"]),
            )))
    }

    fn vpc() -> Address {
        Address::new("vpc", "main")
    }

    fn subnet() -> Address {
        Address::new("subnet", "app")
    }

    fn attrs(pairs: &[(&str, serde_json::Value)]) -> Attributes {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn vpc_decl(cidr: &str) -> ResourceDeclaration {
        ResourceDeclaration::new(vpc())
            .attribute("cidr", cidr)
            .attribute("name", "main")
    }

    fn vpc_record(cidr: &str) -> ResourceRecord {
        ResourceRecord::new(
            vpc(),
            "vpc-1",
            attrs(&[
                ("cidr", json!(cidr)),
                ("name", json!("main")),
                ("arn", json!("arn:vpc-1")),
            ]),
        )
    }

    fn snapshot_with(records: Vec<ResourceRecord>) -> StateSnapshot {
        let mut snapshot = StateSnapshot::new();
        for record in records {
            snapshot.upsert(record);
        }
        snapshot
    }

    async fn diff(
        declarations: Vec<ResourceDeclaration>,
        snapshot: Option<&StateSnapshot>,
    ) -> Result<DiffResult> {
        let registry = registry();
        let graph = GraphBuilder::new(&registry).build(declarations)?;
        DiffEngine::new().compute_diff(&graph, snapshot).await
    }

    #[tokio::test]
    async fn test_create_without_state() {
        let result = diff(vec![vpc_decl("10.0.0.0/16")], None).await.expect("diff");
        let change = result.get(&vpc()).expect("vpc change");
        assert_eq!(change.kind, ActionKind::Create);
        assert_eq!(change.changes.len(), 2);
        assert!(result.has_changes());
    }

    #[tokio::test]
    async fn test_equal_attributes_are_noop() {
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);
        let result = diff(vec![vpc_decl("10.0.0.0/16")], Some(&snapshot))
            .await
            .expect("diff");
        assert_eq!(result.get(&vpc()).map(|c| c.kind), Some(ActionKind::NoOp));
        assert!(!result.has_changes());
        assert_eq!(result.unchanged(), vec![vpc()]);
    }

    #[tokio::test]
    async fn test_mutable_change_updates_in_place() {
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);
        let decl = ResourceDeclaration::new(vpc())
            .attribute("cidr", "10.0.0.0/16")
            .attribute("name", "renamed");
        let result = diff(vec![decl], Some(&snapshot)).await.expect("diff");

        let change = result.get(&vpc()).expect("vpc change");
        assert_eq!(change.kind, ActionKind::UpdateInPlace);
        assert_eq!(change.changes.len(), 1);
        assert_eq!(change.changes[0].attribute, "name");
        assert_eq!(change.prior.as_ref().map(|p| p.id.as_str()), Some("vpc-1"));
    }

    #[tokio::test]
    async fn test_immutable_change_replaces() {
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);
        let result = diff(vec![vpc_decl("10.1.0.0/16")], Some(&snapshot))
            .await
            .expect("diff");

        let change = result.get(&vpc()).expect("vpc change");
        assert_eq!(change.kind, ActionKind::Replace);
        assert!(change.changes[0].forces_replacement);
        assert_eq!(change.replace_policy, ReplacePolicy::CreateBeforeDestroy);
        assert_eq!(
            change.changes[0].to_string(),
            "cidr: \"10.0.0.0/16\" -> \"10.1.0.0/16\" (forces replacement)"
        );
    }

    #[tokio::test]
    async fn test_ignored_immutable_attribute_is_not_diffed() {
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);
        let decl = vpc_decl("10.9.0.0/16").lifecycle(Lifecycle {
            ignore_changes: BTreeSet::from([String::from("cidr")]),
            ..Lifecycle::default()
        });
        let mut record = vpc_record("10.0.0.0/16");
        record.ignore_changes = BTreeSet::from([String::from("cidr")]);
        let snapshot_ignoring = snapshot_with(vec![record]);

        let result = diff(vec![decl.clone()], Some(&snapshot_ignoring))
            .await
            .expect("diff");
        assert_eq!(result.get(&vpc()).map(|c| c.kind), Some(ActionKind::NoOp));

        // Same attributes, but the ignore set is new: the record is rewritten.
        let result = diff(vec![decl], Some(&snapshot)).await.expect("diff");
        assert_eq!(result.get(&vpc()).map(|c| c.kind), Some(ActionKind::Update));
    }

    #[tokio::test]
    async fn test_ignored_value_carried_into_update() {
        let mut record = vpc_record("10.0.0.0/16");
        record.attributes.insert(String::from("tags"), json!({"owner": "ops"}));
        record.ignore_changes = BTreeSet::from([String::from("tags")]);
        let snapshot = snapshot_with(vec![record]);

        let decl = ResourceDeclaration::new(vpc())
            .attribute("cidr", "10.0.0.0/16")
            .attribute("name", "renamed")
            .attribute("tags", Value::literal(json!({"owner": "dev"})))
            .lifecycle(Lifecycle {
                ignore_changes: BTreeSet::from([String::from("tags")]),
                ..Lifecycle::default()
            });
        let result = diff(vec![decl], Some(&snapshot)).await.expect("diff");

        let change = result.get(&vpc()).expect("vpc change");
        assert_eq!(change.kind, ActionKind::UpdateInPlace);
        assert_eq!(
            change.desired.get("tags"),
            Some(&Value::Literal(json!({"owner": "ops"})))
        );
    }

    #[tokio::test]
    async fn test_reference_to_replaced_resource_is_unknown() {
        let snapshot = snapshot_with(vec![
            vpc_record("10.0.0.0/16"),
            ResourceRecord::new(subnet(), "subnet-1", attrs(&[("vpc_id", json!("vpc-1"))]))
                .with_dependencies([vpc()]),
        ]);
        let decls = vec![
            vpc_decl("10.1.0.0/16"),
            ResourceDeclaration::new(subnet()).attribute("vpc_id", vpc().attr("id")),
        ];
        let result = diff(decls, Some(&snapshot)).await.expect("diff");

        let change = result.get(&subnet()).expect("subnet change");
        assert_eq!(change.kind, ActionKind::Replace);
        assert_eq!(change.changes[0].new, Some(Value::from(vpc().attr("id"))));
        assert_eq!(
            change.changes[0].to_string(),
            "vpc_id: \"vpc-1\" -> (known after apply) (forces replacement)"
        );
    }

    #[tokio::test]
    async fn test_reference_to_unchanged_resource_resolves_from_record() {
        let snapshot = snapshot_with(vec![
            vpc_record("10.0.0.0/16"),
            ResourceRecord::new(subnet(), "subnet-1", attrs(&[("vpc_id", json!("vpc-1"))]))
                .with_dependencies([vpc()]),
        ]);
        let decls = vec![
            vpc_decl("10.0.0.0/16"),
            ResourceDeclaration::new(subnet()).attribute("vpc_id", vpc().attr("id")),
        ];
        let result = diff(decls, Some(&snapshot)).await.expect("diff");
        assert!(!result.has_changes());
    }

    #[tokio::test]
    async fn test_removed_and_deposed_records_are_deleted() {
        let mut snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);
        snapshot.deposed.push(ResourceRecord::new(
            subnet(),
            "subnet-0",
            Attributes::new(),
        ));

        let result = diff(Vec::new(), Some(&snapshot)).await.expect("diff");
        assert_eq!(result.count(ActionKind::Delete), 2);
        assert!(result.changes.iter().any(|c| c.deposed && c.address == subnet()));
        assert_eq!(result.get(&vpc()).map(|c| c.kind), Some(ActionKind::Delete));
    }

    #[tokio::test]
    async fn test_removed_resource_with_untouched_dependent() {
        let snapshot = snapshot_with(vec![
            vpc_record("10.0.0.0/16"),
            ResourceRecord::new(subnet(), "subnet-1", attrs(&[("vpc_id", json!("vpc-1"))]))
                .with_dependencies([vpc()]),
        ]);
        // The subnet keeps pointing at the old vpc through a literal.
        let decls = vec![ResourceDeclaration::new(subnet()).attribute("vpc_id", "vpc-1")];

        let err = diff(decls, Some(&snapshot)).await.expect_err("dependents remain");
        match err {
            ConvergeError::Graph(GraphError::DependentsRemain { address, dependents }) => {
                assert_eq!(address, "vpc.main");
                assert_eq!(dependents, vec![String::from("subnet.app")]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_removed_resource_with_deleted_dependent() {
        let snapshot = snapshot_with(vec![
            vpc_record("10.0.0.0/16"),
            ResourceRecord::new(subnet(), "subnet-1", attrs(&[("vpc_id", json!("vpc-1"))]))
                .with_dependencies([vpc()]),
        ]);
        let result = diff(Vec::new(), Some(&snapshot)).await.expect("diff");
        assert_eq!(result.count(ActionKind::Delete), 2);
    }

    #[tokio::test]
    async fn test_prevent_destroy_blocks_replace() {
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);
        let decl = vpc_decl("10.1.0.0/16").lifecycle(Lifecycle {
            prevent_destroy: true,
            ..Lifecycle::default()
        });
        let err = diff(vec![decl], Some(&snapshot)).await.expect_err("protected");
        assert!(matches!(
            err,
            ConvergeError::Plan(PlanError::DestroyPrevented { .. })
        ));
        assert!(err.is_configuration_error());
    }

    #[tokio::test]
    async fn test_older_schema_version_is_record_only_update() {
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16").with_schema_version(0)]);
        let result = diff(vec![vpc_decl("10.0.0.0/16")], Some(&snapshot))
            .await
            .expect("diff");
        let change = result.get(&vpc()).expect("vpc change");
        assert_eq!(change.kind, ActionKind::Update);
        assert!(!change.kind.calls_provider());
    }

    #[tokio::test]
    async fn test_verify_missing_object_plans_create() {
        let provider = Arc::new(MemoryProvider::new(ResourceSchema::new("vpc")));
        let registry = ProviderRegistry::new().with(provider.clone());
        let graph = GraphBuilder::new(&registry)
            .build(vec![vpc_decl("10.0.0.0/16")])
            .expect("graph");
        let snapshot = snapshot_with(vec![vpc_record("10.0.0.0/16")]);

        let result = DiffEngine::new()
            .with_read_through(ReadThrough::Verify, &registry)
            .compute_diff(&graph, Some(&snapshot))
            .await
            .expect("diff");

        assert_eq!(result.get(&vpc()).map(|c| c.kind), Some(ActionKind::Create));
        assert_eq!(
            result.warnings,
            vec![StaleRecordWarning {
                address: vpc(),
                id: String::from("vpc-1"),
            }]
        );
    }

    #[tokio::test]
    async fn test_refresh_compares_live_attributes() {
        let provider = Arc::new(MemoryProvider::new(ResourceSchema::new("vpc")));
        let registry = ProviderRegistry::new().with(provider.clone());
        let created = provider
            .create(&attrs(&[("cidr", json!("10.0.0.0/16")), ("name", json!("main"))]))
            .await
            .expect("create");
        let record = ResourceRecord::new(
            vpc(),
            created.id.clone(),
            attrs(&[("cidr", json!("10.0.0.0/16")), ("name", json!("main"))]),
        );
        let snapshot = snapshot_with(vec![record]);
        provider
            .set_live(
                &created.id,
                attrs(&[("cidr", json!("10.0.0.0/16")), ("name", json!("edited"))]),
            )
            .await;

        let graph = GraphBuilder::new(&registry)
            .build(vec![vpc_decl("10.0.0.0/16")])
            .expect("graph");
        let verify = DiffEngine::new()
            .with_read_through(ReadThrough::Verify, &registry)
            .compute_diff(&graph, Some(&snapshot))
            .await
            .expect("diff");
        assert!(!verify.has_changes());

        let refresh = DiffEngine::new()
            .with_read_through(ReadThrough::Refresh, &registry)
            .compute_diff(&graph, Some(&snapshot))
            .await
            .expect("diff");
        let change = refresh.get(&vpc()).expect("vpc change");
        assert_eq!(change.kind, ActionKind::UpdateInPlace);
        assert_eq!(change.changes[0].old, Some(json!("edited")));
    }

    proptest! {
        #[test]
        fn prop_applied_attributes_diff_to_noop(
            values in proptest::collection::btree_map("[a-z]{1,6}", 0i64..1000, 0..6),
            names in proptest::collection::btree_set("[a-z]{1,4}", 1..5),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            let registry = ProviderRegistry::new().with(Arc::new(MemoryProvider::new(
                ResourceSchema::new("vpc").with_immutable(["a", "b"]),
            )));

            let mut declarations = Vec::new();
            let mut snapshot = StateSnapshot::new();
            for name in &names {
                let address = Address::new("vpc", name.as_str());
                let mut decl = ResourceDeclaration::new(address.clone());
                let mut stored = Attributes::new();
                for (key, value) in &values {
                    decl = decl.attribute(key.as_str(), Value::literal(*value));
                    stored.insert(key.clone(), json!(value));
                }
                declarations.push(decl);
                snapshot.upsert(ResourceRecord::new(address, format!("vpc-{name}"), stored));
            }

            let graph = GraphBuilder::new(&registry).build(declarations).expect("graph");
            let result = runtime
                .block_on(DiffEngine::new().compute_diff(&graph, Some(&snapshot)))
                .expect("diff");
            prop_assert!(result.changes.iter().all(|c| c.kind == ActionKind::NoOp));
        }
    }
}
