//! Declared attribute values.
//!
//! A declared value is either a literal or a reference to another
//! resource's attribute, possibly nested inside lists and maps. Values that
//! still contain references are "known after apply".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::address::Reference;

/// A declared attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    /// A literal JSON value.
    Literal(serde_json::Value),
    /// A reference to another resource's attribute.
    Reference(Reference),
    /// A list whose elements may contain references.
    List(Vec<Value>),
    /// A map whose values may contain references.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Creates a literal value.
    #[must_use]
    pub fn literal(value: impl Into<serde_json::Value>) -> Self {
        Self::Literal(value.into())
    }

    /// Collects every reference contained in this value.
    #[must_use]
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => out.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
        }
    }

    /// Replaces every reference `lookup` can answer with its literal value.
    ///
    /// Lists and maps whose members all become literal collapse into a
    /// single literal.
    #[must_use]
    pub fn resolve<F>(&self, lookup: &F) -> Self
    where
        F: Fn(&Reference) -> Option<serde_json::Value>,
    {
        let resolved = match self {
            Self::Literal(_) => return self.clone(),
            Self::Reference(r) => return lookup(r).map_or_else(|| self.clone(), Self::Literal),
            Self::List(items) => Self::List(items.iter().map(|v| v.resolve(lookup)).collect()),
            Self::Map(entries) => Self::Map(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve(lookup)))
                    .collect(),
            ),
        };

        resolved.known().map_or(resolved, Self::Literal)
    }

    /// Returns the fully-known JSON value, or `None` if a reference remains.
    #[must_use]
    pub fn known(&self) -> Option<serde_json::Value> {
        match self {
            Self::Literal(v) => Some(v.clone()),
            Self::Reference(_) => None,
            Self::List(items) => items
                .iter()
                .map(Self::known)
                .collect::<Option<Vec<_>>>()
                .map(serde_json::Value::Array),
            Self::Map(entries) => entries
                .iter()
                .map(|(k, v)| v.known().map(|v| (k.clone(), v)))
                .collect::<Option<serde_json::Map<_, _>>>()
                .map(serde_json::Value::Object),
        }
    }

    /// Returns true if the value contains no references.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.references().is_empty()
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<Reference> for Value {
    fn from(reference: Reference) -> Self {
        Self::Reference(reference)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Literal(serde_json::Value::String(value.to_string()))
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.known() {
            Some(v) => write!(f, "{v}"),
            None => write!(f, "(known after apply)"),
        }
    }
}
