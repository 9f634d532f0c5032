//! Resource model shared by every stage of the engine.
//!
//! This module defines addresses, references, declared values, declarations
//! and per-type schemas. Declarations arrive already parsed; nothing here
//! reads configuration syntax.

mod address;
mod declaration;
mod schema;
mod value;

use std::collections::BTreeMap;

pub use address::{is_valid_identifier, Address, InstanceKey, Reference};
pub use declaration::{Lifecycle, ResourceDeclaration};
pub use schema::{ReplacePolicy, ResourceSchema};
pub use value::Value;

/// Resolved attribute values, as recorded in state and returned by providers.
pub type Attributes = BTreeMap<String, serde_json::Value>;
