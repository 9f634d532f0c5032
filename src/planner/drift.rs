//! Drift detection.
//!
//! Compares live provider attributes against stored records. Declarations
//! are never consulted, nothing is written and no lock is taken.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::provider::ProviderRegistry;
use crate::resource::{Address, Attributes};
use crate::state::{ResourceRecord, StateSnapshot};

/// Read-only drift detector.
#[derive(Debug, Clone, Copy)]
pub struct DriftDetector<'a> {
    registry: &'a ProviderRegistry,
}

/// One attribute whose live value differs from the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDrift {
    /// Attribute name.
    pub attribute: String,
    /// Value in the record.
    pub stored: Option<serde_json::Value>,
    /// Value reported by the provider.
    pub live: Option<serde_json::Value>,
}

/// Drift of one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDrift {
    /// Resource address.
    pub address: Address,
    /// Provider identifier.
    pub id: String,
    /// Attributes that differ.
    pub attributes: Vec<AttributeDrift>,
}

/// A record that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReadError {
    /// Resource address.
    pub address: Address,
    /// Why the read failed.
    pub message: String,
}

/// Result of a drift check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    /// Number of records checked.
    pub checked: usize,
    /// Resources whose live attributes differ.
    pub drifted: Vec<ResourceDrift>,
    /// Resources whose object no longer exists.
    pub missing: Vec<Address>,
    /// Resources that could not be read.
    pub errors: Vec<DriftReadError>,
}

impl<'a> DriftDetector<'a> {
    /// Creates a detector over the given providers.
    #[must_use]
    pub const fn new(registry: &'a ProviderRegistry) -> Self {
        Self { registry }
    }

    /// Reads every record's object and reports differences.
    ///
    /// Read failures are reported per address and do not abort the check.
    ///
    /// # Errors
    ///
    /// Currently infallible; the signature leaves room for backends that
    /// must be opened before reading.
    pub async fn detect(&self, snapshot: &StateSnapshot) -> Result<DriftReport> {
        let mut report = DriftReport::default();

        for record in snapshot.records() {
            report.checked += 1;

            let provider = match self.registry.get(&record.address.resource_type) {
                Ok(provider) => provider,
                Err(e) => {
                    report.errors.push(DriftReadError {
                        address: record.address.clone(),
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            match provider.read(&record.id).await {
                Ok(Some(live)) => {
                    let ignored: BTreeSet<String> = provider
                        .schema()
                        .ignore_changes
                        .union(&record.ignore_changes)
                        .cloned()
                        .collect();
                    let attributes = compare(record, &live, &ignored, |name| {
                        provider.schema().is_computed(name)
                    });
                    if attributes.is_empty() {
                        debug!("{}: in sync", record.address);
                    } else {
                        warn!("{}: {} attribute(s) drifted", record.address, attributes.len());
                        report.drifted.push(ResourceDrift {
                            address: record.address.clone(),
                            id: record.id.clone(),
                            attributes,
                        });
                    }
                }
                Ok(None) => {
                    warn!("{} ({}) no longer exists", record.address, record.id);
                    report.missing.push(record.address.clone());
                }
                Err(e) => {
                    warn!("Failed to read {}: {e}", record.address);
                    report.errors.push(DriftReadError {
                        address: record.address.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Drift check: {} checked, {} drifted, {} missing, {} unreadable",
            report.checked,
            report.drifted.len(),
            report.missing.len(),
            report.errors.len()
        );
        Ok(report)
    }
}

/// Lists attributes that differ, skipping ignored ones and computed ones
/// the record never held.
fn compare<F>(
    record: &ResourceRecord,
    live: &Attributes,
    ignored: &BTreeSet<String>,
    is_computed: F,
) -> Vec<AttributeDrift>
where
    F: Fn(&str) -> bool,
{
    let stored = &record.attributes;
    let keys: BTreeSet<&String> = stored
        .keys()
        .chain(live.keys().filter(|k| stored.contains_key(*k) || !is_computed(k.as_str())))
        .filter(|k| !ignored.contains(*k))
        .collect();

    keys.into_iter()
        .filter(|name| stored.get(*name) != live.get(*name))
        .map(|name| AttributeDrift {
            attribute: name.clone(),
            stored: stored.get(name).cloned(),
            live: live.get(name).cloned(),
        })
        .collect()
}

impl DriftReport {
    /// Returns true if anything drifted or disappeared.
    #[must_use]
    pub fn has_drift(&self) -> bool {
        !self.drifted.is_empty() || !self.missing.is_empty()
    }
}

impl std::fmt::Display for DriftReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_drift() && self.errors.is_empty() {
            return write!(f, "No drift detected ({} resources checked)", self.checked);
        }

        writeln!(f, "Drift report ({} resources checked):", self.checked)?;
        for resource in &self.drifted {
            writeln!(f, "  ~ {} ({})", resource.address, resource.id)?;
            for drift in &resource.attributes {
                let show = |v: &Option<serde_json::Value>| {
                    v.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string)
                };
                writeln!(
                    f,
                    "      {}: {} -> {}",
                    drift.attribute,
                    show(&drift.stored),
                    show(&drift.live)
                )?;
            }
        }
        for address in &self.missing {
            writeln!(f, "  - {address} (missing)")?;
        }
        for error in &self.errors {
            writeln!(f, "  ! {}: {}", error.address, error.message)?;
        }
        Ok(())
    }
}
