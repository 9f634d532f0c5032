//! Persisted state types.
//!
//! A [`StateSnapshot`] is the durable record of what the engine believes
//! exists: one [`ResourceRecord`] per managed address, plus a serial number
//! for optimistic concurrency and a lineage identifier for telling
//! unrelated snapshots apart.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::resource::{Address, Attributes};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of apply summaries kept in a snapshot.
pub const MAX_HISTORY: usize = 100;

/// Last successfully applied state of one resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource address.
    pub address: Address,
    /// Provider-assigned identifier.
    pub id: String,
    /// Resolved attributes after the last successful apply.
    pub attributes: Attributes,
    /// Schema version of the provider that wrote the record.
    pub schema_version: u32,
    /// Addresses this resource depended on at apply time.
    #[serde(default)]
    pub dependencies: Vec<Address>,
    /// Per-resource ignore set at apply time.
    #[serde(default)]
    pub ignore_changes: BTreeSet<String>,
    /// When the record was written.
    pub updated_at: DateTime<Utc>,
}

/// Versioned collection of resource records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Serial under which this snapshot was stored. Zero if never stored.
    pub serial: u64,
    /// Random identifier shared by every serial of one state history.
    pub lineage: String,
    /// Records, sorted by address.
    #[serde(deserialize_with = "sorted_records")]
    pub resources: Vec<ResourceRecord>,
    /// Objects replaced under create-before-destroy whose old half has not
    /// been destroyed yet.
    #[serde(default)]
    pub deposed: Vec<ResourceRecord>,
    /// Recent apply summaries, oldest first.
    #[serde(default)]
    pub history: Vec<ApplyHistoryEntry>,
    /// When the snapshot was last modified.
    pub last_updated: DateTime<Utc>,
}

/// Summary of one apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyHistoryEntry {
    /// When the apply finished.
    pub timestamp: DateTime<Utc>,
    /// Fingerprint of the applied plan.
    pub plan_fingerprint: String,
    /// Addresses whose actions succeeded.
    pub resources: Vec<String>,
    /// Whether every action succeeded.
    pub success: bool,
    /// Why the apply did not fully succeed.
    #[serde(default)]
    pub error: Option<String>,
}

impl ResourceRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(address: Address, id: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            address,
            id: id.into(),
            attributes,
            schema_version: 1,
            dependencies: Vec::new(),
            ignore_changes: BTreeSet::new(),
            updated_at: Utc::now(),
        }
    }

    /// Sets the schema version.
    #[must_use]
    pub const fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    /// Sets the recorded dependencies, sorted.
    #[must_use]
    pub fn with_dependencies(mut self, dependencies: impl IntoIterator<Item = Address>) -> Self {
        self.dependencies = dependencies.into_iter().collect();
        self.dependencies.sort();
        self.dependencies.dedup();
        self
    }

    /// Sets the recorded ignore set.
    #[must_use]
    pub fn with_ignore_changes(mut self, ignore: BTreeSet<String>) -> Self {
        self.ignore_changes = ignore;
        self
    }
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StateSnapshot {
    /// Creates an empty snapshot with a fresh lineage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            serial: 0,
            lineage: Uuid::new_v4().to_string(),
            resources: Vec::new(),
            deposed: Vec::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Gets a record by address.
    #[must_use]
    pub fn get(&self, address: &Address) -> Option<&ResourceRecord> {
        self.resources
            .binary_search_by(|r| r.address.cmp(address))
            .ok()
            .map(|idx| &self.resources[idx])
    }

    /// Adds or replaces a record, keeping address order.
    pub fn upsert(&mut self, record: ResourceRecord) {
        match self
            .resources
            .binary_search_by(|r| r.address.cmp(&record.address))
        {
            Ok(idx) => self.resources[idx] = record,
            Err(idx) => self.resources.insert(idx, record),
        }
        self.last_updated = Utc::now();
    }

    /// Removes a record by address.
    pub fn remove(&mut self, address: &Address) -> Option<ResourceRecord> {
        let idx = self
            .resources
            .binary_search_by(|r| r.address.cmp(address))
            .ok()?;
        self.last_updated = Utc::now();
        Some(self.resources.remove(idx))
    }

    /// Moves the current record for `address` to the deposed list.
    ///
    /// Returns false if no record exists.
    pub fn depose(&mut self, address: &Address) -> bool {
        match self.remove(address) {
            Some(record) => {
                self.deposed.push(record);
                true
            }
            None => false,
        }
    }

    /// Removes a deposed object by address and provider id.
    pub fn remove_deposed(&mut self, address: &Address, id: &str) -> Option<ResourceRecord> {
        let idx = self
            .deposed
            .iter()
            .position(|r| &r.address == address && r.id == id)?;
        self.last_updated = Utc::now();
        Some(self.deposed.remove(idx))
    }

    /// Iterates records in address order.
    pub fn records(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.resources.iter()
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    /// Returns true if no resource is recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty() && self.deposed.is_empty()
    }

    /// Adds a history entry, dropping the oldest past [`MAX_HISTORY`].
    pub fn add_history(&mut self, entry: ApplyHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
    }
}

/// Restores address order on load so lookups can binary search.
fn sorted_records<'de, D>(deserializer: D) -> Result<Vec<ResourceRecord>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let mut records = Vec::<ResourceRecord>::deserialize(deserializer)?;
    records.sort_by(|a, b| a.address.cmp(&b.address));
    if let Some(pair) = records.windows(2).find(|w| w[0].address == w[1].address) {
        return Err(serde::de::Error::custom(format!(
            "duplicate record for {}",
            pair[0].address
        )));
    }
    Ok(records)
}

impl ApplyHistoryEntry {
    /// Creates a successful history entry.
    #[must_use]
    pub fn new(plan_fingerprint: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            plan_fingerprint: plan_fingerprint.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(plan_fingerprint: &str, resources: Vec<String>, error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(plan_fingerprint, resources)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> ResourceRecord {
        ResourceRecord::new(
            Address::new("vpc", name),
            format!("vpc-{name}"),
            Attributes::from([(String::from("cidr"), json!("10.0.0.0/16"))]),
        )
    }

    #[test]
    fn test_upsert_keeps_address_order() {
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(record("c"));
        snapshot.upsert(record("a"));
        snapshot.upsert(record("b"));
        snapshot.upsert(record("a"));

        let names: Vec<&str> = snapshot.records().map(|r| r.address.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(snapshot.get(&Address::new("vpc", "b")).is_some());
        assert!(snapshot.get(&Address::new("vpc", "z")).is_none());
    }

    #[test]
    fn test_depose_and_remove() {
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(record("a"));

        assert!(snapshot.depose(&Address::new("vpc", "a")));
        assert_eq!(snapshot.len(), 0);
        assert!(!snapshot.is_empty());

        let removed = snapshot.remove_deposed(&Address::new("vpc", "a"), "vpc-a");
        assert!(removed.is_some());
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut snapshot = StateSnapshot::new();
        for i in 0..(MAX_HISTORY + 5) {
            snapshot.add_history(ApplyHistoryEntry::new(&format!("fp-{i}"), Vec::new()));
        }

        assert_eq!(snapshot.history.len(), MAX_HISTORY);
        assert_eq!(snapshot.history[0].plan_fingerprint, "fp-5");
    }

    #[test]
    fn test_out_of_order_records_are_sorted_on_load() {
        let mut snapshot = StateSnapshot::new();
        snapshot.upsert(record("a"));
        snapshot.upsert(record("b"));
        snapshot.upsert(record("c"));

        let mut value = serde_json::to_value(&snapshot).expect("serialize");
        let resources = value["resources"].as_array_mut().expect("array");
        resources.reverse();

        let loaded: StateSnapshot = serde_json::from_value(value.clone()).expect("deserialize");
        assert_eq!(loaded.resources, snapshot.resources);
        assert!(loaded.get(&Address::new("vpc", "a")).is_some());
        assert!(loaded.get(&Address::new("vpc", "c")).is_some());

        let resources = value["resources"].as_array_mut().expect("array");
        let dup = resources[0].clone();
        resources.push(dup);
        assert!(serde_json::from_value::<StateSnapshot>(value).is_err());
    }

    #[test]
    fn test_new_snapshots_have_distinct_lineages() {
        assert_ne!(StateSnapshot::new().lineage, StateSnapshot::new().lineage);
    }

    #[test]
    fn test_record_dependencies_sorted() {
        let record = record("a").with_dependencies([
            Address::new("vpc", "z"),
            Address::new("iam", "role"),
            Address::new("vpc", "z"),
        ]);
        assert_eq!(
            record.dependencies,
            vec![Address::new("iam", "role"), Address::new("vpc", "z")]
        );
    }
}
