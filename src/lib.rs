// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![warn(dead_code)]                   // Unused code warning
#![warn(unused_imports)]              // Unused imports warning
#![warn(unused_variables)]            // Unused variables warning
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Converge
//!
//! A declarative infrastructure reconciliation engine.
//!
//! ## Overview
//!
//! Resources are declared as typed, addressed attribute maps that may
//! reference each other. The engine:
//!
//! - Builds a dependency graph and rejects cycles before planning
//! - Diffs declarations against the last applied state record
//! - Orders the differences into parallel batches
//! - Executes them against providers under a leased state lock
//! - Reports out-of-band drift without changing anything
//!
//! ## Architecture
//!
//! Control flow follows **desired state reconciliation**:
//!
//! 1. **Graph**: declarations become a DAG of resource nodes
//! 2. **Diff**: each node is classified as create, update, replace, delete or no-op
//! 3. **Plan**: actions are grouped into batches respecting dependencies
//! 4. **Apply**: batches run under the lock; the record is written after every action
//!
//! ## Modules
//!
//! - [`config`]: Engine settings parsing and validation
//! - [`resource`]: Addresses, values, declarations and schemas
//! - [`provider`]: Provider capability trait and registry
//! - [`graph`]: Dependency graph construction
//! - [`state`]: State storage backends (local, S3, memory) and locking
//! - [`planner`]: Diff, plan, execution and drift detection
//! - [`reconciler`]: End-to-end control flow
//!
//! ## Example
//!
//! ```yaml
//! state:
//!   backend: s3
//!   key: prod
//!   bucket: my-state-bucket
//! execution:
//!   parallelism: 8
//! diff:
//!   read_through: verify
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod config;
pub mod error;
pub mod graph;
pub mod logging;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{ConfigParser, ConfigValidator, EngineConfig};
pub use error::{ConvergeError, Result};
pub use graph::{GraphBuilder, ResourceGraph, ResourceNode};
pub use planner::{
    ActionKind, ApplyResult, ApplyStatus, DiffEngine, DiffResult, DriftDetector, DriftReport,
    ExecutionPlan, PlanBuilder, PlanExecutor,
};
pub use provider::{MemoryProvider, Provider, ProviderRegistry};
pub use reconciler::Reconciler;
pub use resource::{Address, Lifecycle, Reference, ResourceDeclaration, ResourceSchema, Value};
pub use state::{
    LocalStateStore, LockManager, MemoryStateStore, ResourceRecord, S3StateStore, StateSnapshot,
    StateStore,
};
