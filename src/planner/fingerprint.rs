//! Plan fingerprinting.
//!
//! A fingerprint is a SHA-256 digest over everything a plan would do and
//! the state it was computed from. Saved plans carry it so tampering or
//! truncation is caught before apply.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{PlanError, Result};

use super::plan::ExecutionPlan;

/// Hasher for computing plan fingerprints.
#[derive(Debug, Default)]
pub struct PlanHasher;

impl PlanHasher {
    /// Creates a new plan hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a plan.
    ///
    /// Covers the source serial and lineage, every batch in order, and the
    /// unchanged list. Creation time and warnings are not covered.
    ///
    /// # Errors
    ///
    /// Returns an error if an action cannot be serialized.
    pub fn hash_plan(&self, plan: &ExecutionPlan) -> Result<String> {
        let mut hasher = Sha256::new();

        hasher.update(plan.state_serial.to_be_bytes());
        if let Some(lineage) = &plan.lineage {
            hasher.update(lineage.as_bytes());
        }

        for (index, batch) in plan.batches.iter().enumerate() {
            hasher.update((index as u64).to_be_bytes());
            for action in batch {
                hasher.update(canonical_bytes(action)?);
            }
        }

        for address in &plan.unchanged {
            hasher.update(address.to_string().as_bytes());
            hasher.update([0]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Serializes a value to JSON for hashing.
///
/// Maps serialize in key order, so the bytes are stable across runs.
fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        PlanError::SerializationError {
            message: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_plan_fingerprint_depends_on_serial() {
        let hasher = PlanHasher::new();
        let mut plan = ExecutionPlan::empty(3, Some(String::from("lineage-a")));
        let first = hasher.hash_plan(&plan).expect("hash");
        assert_eq!(first.len(), 64);
        assert!(first.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(first, hasher.hash_plan(&plan).expect("hash"));

        plan.state_serial = 4;
        assert_ne!(first, hasher.hash_plan(&plan).expect("hash"));
    }
}
