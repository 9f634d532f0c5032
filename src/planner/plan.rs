//! Execution plan generation.
//!
//! This module expands classified changes into plan actions, orders them
//! into batches of mutually independent actions, and serializes the result
//! for review before apply.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info};

use crate::error::{PlanError, Result};
use crate::resource::{Address, ReplacePolicy, Value};
use crate::state::{ResourceRecord, StateSnapshot};

use super::diff::{ActionKind, AttributeChange, DiffResult, ResourceChange, StaleRecordWarning};
use super::fingerprint::PlanHasher;

/// Builder for execution plans.
#[derive(Debug, Default)]
pub struct PlanBuilder;

/// Half of an expanded `Replace`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplacePhase {
    /// Create the replacement object.
    Create,
    /// Destroy the old object.
    Destroy,
}

/// A single action in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanAction {
    /// Unique action identifier within the plan.
    pub id: String,
    /// Resource address.
    pub address: Address,
    /// Action kind; both halves of a replacement keep `Replace`.
    pub kind: ActionKind,
    /// Which half of a replacement this is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ReplacePhase>,
    /// Record the action starts from.
    pub prior: Option<ResourceRecord>,
    /// Desired attributes; references are resolved at apply time.
    #[serde(default)]
    pub desired: BTreeMap<String, Value>,
    /// Dependencies written into the record.
    #[serde(default)]
    pub dependencies: Vec<Address>,
    /// Per-resource ignore set written into the record.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
    /// Schema version written into the record.
    pub schema_version: u32,
    /// Attribute differences, for review.
    #[serde(default)]
    pub changes: Vec<AttributeChange>,
    /// Actions that must succeed first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// True if this deletes a deposed object.
    #[serde(default)]
    pub deposed: bool,
}

/// A complete, reviewable execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Serial of the snapshot the plan was computed from.
    pub state_serial: u64,
    /// Lineage of that snapshot, `None` if there was no state.
    pub lineage: Option<String>,
    /// Batches of independent actions, in execution order.
    pub batches: Vec<Vec<PlanAction>>,
    /// Addresses that need no action.
    #[serde(default)]
    pub unchanged: Vec<Address>,
    /// Warnings raised while diffing.
    #[serde(default)]
    pub warnings: Vec<StaleRecordWarning>,
    /// SHA-256 over the plan contents.
    pub fingerprint: String,
}

/// Action ids that stand for an address during edge construction.
#[derive(Default)]
struct Anchors {
    /// Action producing the current object (create, update, replace create half).
    producer: HashMap<Address, String>,
    /// Action removing the current object (delete, replace destroy half).
    remover: HashMap<Address, String>,
    /// Planned deletes of deposed objects.
    deposed: HashSet<String>,
}

/// Id of the action deleting a deposed object.
fn deposed_action_id(address: &Address, id: &str) -> String {
    format!("{address}:deposed:{id}")
}

impl PlanBuilder {
    /// Creates a new plan builder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Builds an execution plan from a diff.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::Infeasible`] if the expanded action graph has a
    /// cycle.
    pub fn build(&self, diff: &DiffResult, snapshot: Option<&StateSnapshot>) -> Result<ExecutionPlan> {
        let mut anchors = Anchors::default();
        let mut actions = Vec::new();

        for change in diff.changes.iter().filter(|c| c.kind.is_change()) {
            expand(change, &mut anchors, &mut actions);
        }

        let kinds: HashMap<&Address, ActionKind> = diff
            .changes
            .iter()
            .filter(|c| !c.deposed)
            .map(|c| (&c.address, c.kind))
            .collect();

        for action in &mut actions {
            link(action, &anchors, &kinds, snapshot);
        }

        let batches = into_batches(actions)?;

        let mut plan = ExecutionPlan::empty(
            snapshot.map_or(0, |s| s.serial),
            snapshot.map(|s| s.lineage.clone()),
        );
        plan.batches = batches;
        plan.unchanged = diff.unchanged();
        plan.warnings.clone_from(&diff.warnings);
        plan.fingerprint = PlanHasher::new().hash_plan(&plan)?;

        info!(
            "Plan: {} action(s) in {} batch(es), {} unchanged",
            plan.action_count(),
            plan.batches.len(),
            plan.unchanged.len()
        );
        Ok(plan)
    }
}

/// Turns one change into one or two actions and registers their anchors.
fn expand(change: &ResourceChange, anchors: &mut Anchors, actions: &mut Vec<PlanAction>) {
    let address = &change.address;
    let base = PlanAction {
        id: address.to_string(),
        address: address.clone(),
        kind: change.kind,
        phase: None,
        prior: change.prior.clone(),
        desired: change.desired.clone(),
        dependencies: change.dependencies.iter().cloned().collect(),
        ignore_changes: change.ignore_changes.clone(),
        schema_version: change.schema_version,
        changes: change.changes.clone(),
        depends_on: Vec::new(),
        deposed: change.deposed,
    };

    match change.kind {
        ActionKind::NoOp => {}
        ActionKind::Create | ActionKind::Update | ActionKind::UpdateInPlace => {
            anchors.producer.insert(address.clone(), base.id.clone());
            actions.push(base);
        }
        ActionKind::Delete if change.deposed => {
            let id = deposed_action_id(address, change.prior.as_ref().map_or("", |p| p.id.as_str()));
            anchors.deposed.insert(id.clone());
            actions.push(PlanAction { id, ..base });
        }
        ActionKind::Delete => {
            anchors.remover.insert(address.clone(), base.id.clone());
            actions.push(base);
        }
        ActionKind::Replace => {
            let create_id = format!("{address}:create");
            let destroy_id = format!("{address}:destroy");

            let (create_deps, destroy_deps) = match change.replace_policy {
                ReplacePolicy::CreateBeforeDestroy => (Vec::new(), vec![create_id.clone()]),
                ReplacePolicy::DestroyBeforeCreate => (vec![destroy_id.clone()], Vec::new()),
            };
            debug!("{address}: replace expanded ({})", change.replace_policy);

            anchors.producer.insert(address.clone(), create_id.clone());
            anchors.remover.insert(address.clone(), destroy_id.clone());

            actions.push(PlanAction {
                id: create_id,
                phase: Some(ReplacePhase::Create),
                depends_on: create_deps,
                ..base.clone()
            });
            actions.push(PlanAction {
                id: destroy_id,
                phase: Some(ReplacePhase::Destroy),
                desired: BTreeMap::new(),
                depends_on: destroy_deps,
                ..base
            });
        }
    }
}

/// Adds dependency edges to an action.
///
/// Producers wait on the producers of their new dependencies. Removers,
/// including deletes of deposed objects, wait on whatever rewrites or
/// removes the objects that recorded a dependency on them, which follows
/// the old graph in reverse.
fn link(
    action: &mut PlanAction,
    anchors: &Anchors,
    kinds: &HashMap<&Address, ActionKind>,
    snapshot: Option<&StateSnapshot>,
) {
    let is_remover =
        action.deposed || anchors.remover.get(&action.address) == Some(&action.id);
    let is_producer = anchors.producer.get(&action.address) == Some(&action.id);

    if is_producer {
        for dependency in &action.dependencies {
            if let Some(id) = anchors.producer.get(dependency) {
                action.depends_on.push(id.clone());
            }
        }
    }

    if let (true, Some(snapshot)) = (is_remover, snapshot) {
        let dependents = snapshot
            .records()
            .filter(|r| r.address != action.address && r.dependencies.contains(&action.address));

        for dependent in dependents {
            let anchor = match kinds.get(&dependent.address) {
                Some(ActionKind::Replace | ActionKind::Delete) => anchors.remover.get(&dependent.address),
                Some(ActionKind::Update | ActionKind::UpdateInPlace) => {
                    anchors.producer.get(&dependent.address)
                }
                _ => None,
            };
            if let Some(id) = anchor {
                action.depends_on.push(id.clone());
            }
        }

        let deposed_dependents: Vec<String> = snapshot
            .deposed
            .iter()
            .filter(|r| r.address != action.address && r.dependencies.contains(&action.address))
            .map(|r| deposed_action_id(&r.address, &r.id))
            .filter(|id| anchors.deposed.contains(id))
            .collect();
        action.depends_on.extend(deposed_dependents);
    }

    action.depends_on.sort();
    action.depends_on.dedup();
}

/// Kahn batching with a stable address order inside each batch.
fn into_batches(mut actions: Vec<PlanAction>) -> Result<Vec<Vec<PlanAction>>> {
    actions.sort_by(|a, b| {
        (&a.address, a.phase, &a.id).cmp(&(&b.address, b.phase, &b.id))
    });

    let mut placed: HashSet<String> = HashSet::new();
    let mut pending = actions;
    let mut batches = Vec::new();

    while !pending.is_empty() {
        let (ready, blocked): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|a| a.depends_on.iter().all(|d| placed.contains(d)));

        if ready.is_empty() {
            return Err(PlanError::Infeasible {
                cycle: find_cycle(&blocked),
            }
            .into());
        }

        placed.extend(ready.iter().map(|a| a.id.clone()));
        batches.push(ready);
        pending = blocked;
    }

    Ok(batches)
}

/// Follows unplaced dependencies until an action repeats.
///
/// Every blocked action waits on at least one other blocked action, so
/// the walk always closes a cycle.
fn find_cycle(blocked: &[PlanAction]) -> Vec<String> {
    let by_id: HashMap<&str, &PlanAction> = blocked.iter().map(|a| (a.id.as_str(), a)).collect();
    let mut path: Vec<&str> = Vec::new();
    let mut current = blocked.first().map(|a| a.id.as_str());

    while let Some(id) = current {
        if let Some(start) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<String> = path[start..].iter().map(ToString::to_string).collect();
            cycle.push(id.to_string());
            return cycle;
        }
        path.push(id);
        current = by_id.get(id).and_then(|action| {
            action
                .depends_on
                .iter()
                .map(String::as_str)
                .find(|d| by_id.contains_key(d))
        });
    }

    path.into_iter().map(ToString::to_string).collect()
}

impl ExecutionPlan {
    /// Creates an empty plan against the given state.
    #[must_use]
    pub fn empty(state_serial: u64, lineage: Option<String>) -> Self {
        Self {
            created_at: Utc::now(),
            state_serial,
            lineage,
            batches: Vec::new(),
            unchanged: Vec::new(),
            warnings: Vec::new(),
            fingerprint: String::new(),
        }
    }

    /// Returns true if the plan has no actions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(Vec::is_empty)
    }

    /// Total number of actions.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    /// Iterates actions in execution order.
    pub fn actions(&self) -> impl Iterator<Item = &PlanAction> {
        self.batches.iter().flatten()
    }

    /// Gets an action by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&PlanAction> {
        self.actions().find(|a| a.id == id)
    }

    /// Index of the batch holding the action with this id.
    #[must_use]
    pub fn batch_of(&self, id: &str) -> Option<usize> {
        self.batches
            .iter()
            .position(|batch| batch.iter().any(|a| a.id == id))
    }

    /// Number of actions of the given kind; a replacement counts once.
    #[must_use]
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions()
            .filter(|a| a.kind == kind && a.phase != Some(ReplacePhase::Destroy))
            .count()
    }

    /// The fingerprint carried by the plan.
    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Checks the carried fingerprint against the contents.
    ///
    /// # Errors
    ///
    /// Returns [`PlanError::FingerprintMismatch`] if they differ.
    pub fn verify_fingerprint(&self) -> Result<()> {
        let computed = PlanHasher::new().hash_plan(self)?;
        if computed != self.fingerprint {
            return Err(PlanError::FingerprintMismatch {
                expected: self.fingerprint.clone(),
                computed,
            }
            .into());
        }
        Ok(())
    }

    /// Serializes the plan to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            PlanError::SerializationError {
                message: e.to_string(),
            }
            .into()
        })
    }

    /// Parses a plan and verifies its fingerprint.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is not a plan or was altered.
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: Self = serde_json::from_str(json).map_err(|e| PlanError::SerializationError {
            message: e.to_string(),
        })?;
        plan.verify_fingerprint()?;
        Ok(plan)
    }
}

impl PlanAction {
    /// Returns a human-readable description of the action.
    #[must_use]
    pub fn description(&self) -> String {
        match (self.kind, self.phase) {
            (ActionKind::Replace, Some(ReplacePhase::Create)) => {
                format!("Create replacement for {}", self.address)
            }
            (ActionKind::Replace, _) => format!("Destroy replaced {}", self.address),
            (ActionKind::Delete, _) if self.deposed => {
                format!("Delete deposed object of {}", self.address)
            }
            (ActionKind::Create, _) => format!("Create {}", self.address),
            (ActionKind::Update, _) => format!("Rewrite record of {}", self.address),
            (ActionKind::UpdateInPlace, _) => format!("Update {} in place", self.address),
            (ActionKind::Delete, _) => format!("Delete {}", self.address),
            (ActionKind::NoOp, _) => format!("No change for {}", self.address),
        }
    }
}

impl std::fmt::Display for ReplacePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Destroy => "destroy",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for PlanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())?;
        if !self.depends_on.is_empty() {
            write!(f, " (after {})", self.depends_on.join(", "))?;
        }
        Ok(())
    }
}

impl std::fmt::Display for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "No changes required");
        }

        writeln!(
            f,
            "Execution Plan ({} actions, {} batches):",
            self.action_count(),
            self.batches.len()
        )?;
        for (i, batch) in self.batches.iter().enumerate() {
            writeln!(f, "  Batch {i}:")?;
            for action in batch {
                writeln!(f, "    - {action}")?;
                if action.phase != Some(ReplacePhase::Destroy) {
                    for change in &action.changes {
                        writeln!(f, "        {change}")?;
                    }
                }
            }
        }

        if !self.warnings.is_empty() {
            writeln!(f, "\nWarnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }

        Ok(())
    }
}
