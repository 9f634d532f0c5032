//! Planning and execution.
//!
//! This module compares declarations with recorded state, turns the
//! differences into an ordered batch plan, and executes that plan against
//! providers while persisting progress after every successful action.

mod diff;
mod drift;
mod executor;
mod fingerprint;
mod plan;
mod retry;

pub use diff::{ActionKind, AttributeChange, DiffEngine, DiffResult, ResourceChange, StaleRecordWarning};
pub use drift::{AttributeDrift, DriftDetector, DriftReadError, DriftReport, ResourceDrift};
pub use executor::{
    ActionOutcome, ActionState, ApplyResult, ApplyStatus, CancellationSignal, HaltReason, PlanExecutor,
};
pub use fingerprint::PlanHasher;
pub use plan::{ExecutionPlan, PlanAction, PlanBuilder, ReplacePhase};
pub use retry::RetryPolicy;
