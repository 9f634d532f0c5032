//! Plan executor for applying execution plans.
//!
//! Batches run strictly in order. Inside a batch, actions run concurrently
//! on a worker pool bounded by a semaphore, and the executor waits for the
//! whole batch before starting the next. Every successful action is
//! persisted to the state store before the next result is handled.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionConfig;
use crate::error::{ProviderError, Result, StateError};
use crate::provider::{Provider, ProviderRegistry};
use crate::resource::{Address, Attributes, Reference, Value};
use crate::state::{ApplyHistoryEntry, ResourceRecord, StateSnapshot, StateStore};

use super::diff::ActionKind;
use super::plan::{ExecutionPlan, PlanAction, ReplacePhase};
use super::retry::RetryPolicy;

/// Cooperative cancellation flag shared between the caller, the lock
/// heartbeat and the executor.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancellationSignal {
    /// Creates a signal that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns true once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Executor for execution plans.
pub struct PlanExecutor {
    /// Providers by resource type.
    registry: Arc<ProviderRegistry>,
    /// Durable state.
    store: Arc<dyn StateStore>,
    /// State-store key.
    key: String,
    /// Maximum concurrent provider calls.
    parallelism: usize,
    /// Retry policy for provider calls.
    retry: RetryPolicy,
    /// Apply-level deadline.
    deadline: Option<Duration>,
    /// Cancellation signal checked between actions.
    cancel: CancellationSignal,
}

/// Lifecycle state of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    /// Not started.
    Pending,
    /// Provider call in flight.
    Running,
    /// Completed and recorded.
    Succeeded,
    /// Failed.
    Failed,
    /// Not attempted.
    Skipped,
}

/// Result of executing a single action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOutcome {
    /// Action identifier.
    pub id: String,
    /// Resource address.
    pub address: Address,
    /// Action kind.
    pub kind: ActionKind,
    /// Replacement half, if any.
    pub phase: Option<ReplacePhase>,
    /// Batch the action belongs to.
    pub batch: usize,
    /// Final state.
    pub state: ActionState,
    /// Provider attempts made.
    pub attempts: u32,
    /// Failure or skip reason.
    pub error: Option<String>,
}

/// Overall status of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    /// Every action succeeded.
    Succeeded,
    /// Some actions failed or were skipped.
    PartialFailure,
}

/// Why the executor stopped starting new actions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HaltReason {
    /// The cancellation signal fired.
    Cancelled,
    /// The apply deadline passed.
    DeadlineExceeded,
    /// A successful action could not be recorded.
    StatePersistFailed {
        /// Store error.
        message: String,
    },
}

/// Result of executing a plan.
#[derive(Debug, Clone)]
pub struct ApplyResult {
    /// Overall status.
    pub status: ApplyStatus,
    /// One outcome per action, in plan order.
    pub outcomes: Vec<ActionOutcome>,
    /// Number of successful actions.
    pub succeeded: usize,
    /// Number of failed actions.
    pub failed: usize,
    /// Number of skipped actions.
    pub skipped: usize,
    /// Set if execution stopped early.
    pub halted: Option<HaltReason>,
    /// State after the apply, as last written.
    pub snapshot: StateSnapshot,
}

/// Provider call an action makes.
enum Call {
    Create(Attributes),
    Update { id: String, attributes: Attributes },
    Delete { id: String },
    RecordOnly,
}

/// An action with references resolved and its provider looked up.
struct PreparedAction {
    address: Address,
    provider: Arc<dyn Provider>,
    call: Call,
    prior: Option<ResourceRecord>,
    replaces: bool,
    schema_version: u32,
    dependencies: Vec<Address>,
    ignore_changes: BTreeSet<String>,
}

/// State change produced by a successful action.
enum Effect {
    /// Write a record, deposing the current object first if its id matches.
    Record {
        record: ResourceRecord,
        depose: Option<String>,
    },
    /// Remove the current or deposed object with this id.
    Remove { address: Address, id: String },
}

/// What a worker task reports back.
enum TaskResult {
    Cancelled,
    Done {
        result: std::result::Result<Effect, ProviderError>,
        attempts: u32,
    },
}

impl PlanExecutor {
    /// Creates an executor with default tuning.
    #[must_use]
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn StateStore>,
        key: impl Into<String>,
    ) -> Self {
        Self::from_config(registry, store, key, &ExecutionConfig::default())
    }

    /// Creates an executor from settings.
    #[must_use]
    pub fn from_config(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn StateStore>,
        key: impl Into<String>,
        config: &ExecutionConfig,
    ) -> Self {
        Self {
            registry,
            store,
            key: key.into(),
            parallelism: config.parallelism.max(1),
            retry: RetryPolicy::from_config(config),
            deadline: config.apply_deadline(),
            cancel: CancellationSignal::new(),
        }
    }

    /// Sets the worker pool size.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub const fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the apply deadline.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Uses an externally owned cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// The executor's cancellation signal.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationSignal {
        &self.cancel
    }

    /// Executes a plan against the snapshot it was computed from.
    ///
    /// Provider failures are contained to the failing action and its
    /// dependents and reported in the result.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::StalePlan`] if the snapshot does not match the
    /// plan's serial and lineage. Nothing is executed in that case.
    pub async fn execute(&self, plan: &ExecutionPlan, snapshot: StateSnapshot) -> Result<ApplyResult> {
        check_fresh(plan, &snapshot)?;

        info!(
            "Executing plan with {} actions in {} batches",
            plan.action_count(),
            plan.batches.len()
        );

        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let mut snapshot = snapshot;

        let mut outcomes: Vec<ActionOutcome> = plan
            .batches
            .iter()
            .enumerate()
            .flat_map(|(batch, actions)| actions.iter().map(move |a| ActionOutcome::pending(a, batch)))
            .collect();
        let index: HashMap<String, usize> = outcomes
            .iter()
            .enumerate()
            .map(|(i, o)| (o.id.clone(), i))
            .collect();

        let mut blocked: HashSet<String> = HashSet::new();
        let mut unrecorded: Vec<usize> = Vec::new();
        let mut halted: Option<HaltReason> = None;

        for (batch_index, batch) in plan.batches.iter().enumerate() {
            if halted.is_none() {
                if self.cancel.is_cancelled() {
                    warn!("Apply cancelled before batch {batch_index}");
                    halted = Some(HaltReason::Cancelled);
                } else if self.deadline.is_some_and(|d| started.elapsed() >= d) {
                    warn!("Apply deadline exceeded before batch {batch_index}");
                    halted = Some(HaltReason::DeadlineExceeded);
                }
            }

            if let Some(reason) = &halted {
                for action in batch {
                    outcomes[index[&action.id]].skip(reason.to_string());
                }
                continue;
            }

            debug!("Starting batch {batch_index} ({} actions)", batch.len());
            let mut tasks = JoinSet::new();
            let mut running: HashSet<String> = HashSet::new();

            for action in batch {
                let slot = &mut outcomes[index[&action.id]];

                if let Some(dependency) = action.depends_on.iter().find(|d| blocked.contains(*d)) {
                    warn!("Skipping {}: {dependency} did not succeed", action.id);
                    slot.skip(format!("dependency {dependency} did not succeed"));
                    blocked.insert(action.id.clone());
                    continue;
                }

                let prepared = match self.prepare(action, &snapshot) {
                    Ok(prepared) => prepared,
                    Err(message) => {
                        error!("Cannot start {}: {message}", action.id);
                        slot.fail(message, 0);
                        blocked.insert(action.id.clone());
                        continue;
                    }
                };

                slot.state = ActionState::Running;
                running.insert(action.id.clone());

                let id = action.id.clone();
                let semaphore = Arc::clone(&semaphore);
                let cancel = self.cancel.clone();
                let retry = self.retry;
                tasks.spawn(async move {
                    let Ok(_permit) = semaphore.acquire_owned().await else {
                        return (id, TaskResult::Cancelled);
                    };
                    if cancel.is_cancelled() {
                        return (id, TaskResult::Cancelled);
                    }
                    let (result, attempts) = prepared.run(&retry).await;
                    (id, TaskResult::Done { result, attempts })
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let (id, task) = match joined {
                    Ok(done) => done,
                    Err(e) => {
                        error!("Action task aborted: {e}");
                        continue;
                    }
                };
                running.remove(&id);
                let position = index[&id];

                match task {
                    TaskResult::Cancelled => {
                        outcomes[position].skip(String::from("cancelled before start"));
                        blocked.insert(id);
                        if halted.is_none() {
                            halted = Some(HaltReason::Cancelled);
                        }
                    }
                    TaskResult::Done {
                        result: Err(e),
                        attempts,
                    } => {
                        error!("{id} failed after {attempts} attempt(s): {e}");
                        outcomes[position].fail(e.to_string(), attempts);
                        blocked.insert(id);
                    }
                    TaskResult::Done {
                        result: Ok(effect),
                        attempts,
                    } => {
                        outcomes[position].attempts = attempts;
                        effect.apply(&mut snapshot);
                        unrecorded.push(position);

                        match self.store.put(&self.key, &snapshot, snapshot.serial).await {
                            Ok(serial) => {
                                snapshot.serial = serial;
                                for recorded in unrecorded.drain(..) {
                                    outcomes[recorded].state = ActionState::Succeeded;
                                    info!("{} succeeded (serial {serial})", outcomes[recorded].id);
                                }
                            }
                            Err(e) => {
                                error!("Failed to record {id}: {e}");
                                blocked.insert(id);
                                halted = Some(HaltReason::StatePersistFailed {
                                    message: e.to_string(),
                                });
                            }
                        }
                    }
                }
            }

            for id in running {
                outcomes[index[&id]].fail(String::from("action task aborted"), 0);
                blocked.insert(id);
            }
        }

        for position in unrecorded {
            outcomes[position].fail(String::from("applied but not recorded in state"), 0);
        }

        let result = self.finish(plan, outcomes, halted, snapshot).await;
        info!(
            "Apply finished: {} succeeded, {} failed, {} skipped",
            result.succeeded, result.failed, result.skipped
        );
        Ok(result)
    }

    /// Resolves an action against the current snapshot.
    fn prepare(
        &self,
        action: &PlanAction,
        snapshot: &StateSnapshot,
    ) -> std::result::Result<PreparedAction, String> {
        let provider = Arc::clone(
            self.registry
                .get(&action.address.resource_type)
                .map_err(|e| e.to_string())?,
        );
        let prior_id = || {
            action
                .prior
                .as_ref()
                .map(|p| p.id.clone())
                .ok_or_else(|| format!("{} has no prior record", action.id))
        };

        let call = match (action.kind, action.phase) {
            (ActionKind::Create, _) | (ActionKind::Replace, Some(ReplacePhase::Create)) => {
                Call::Create(resolve_attributes(&action.desired, snapshot)?)
            }
            (ActionKind::UpdateInPlace, _) => Call::Update {
                id: prior_id()?,
                attributes: resolve_attributes(&action.desired, snapshot)?,
            },
            (ActionKind::Delete | ActionKind::Replace, _) => Call::Delete { id: prior_id()? },
            (ActionKind::Update | ActionKind::NoOp, _) => {
                prior_id()?;
                Call::RecordOnly
            }
        };

        Ok(PreparedAction {
            address: action.address.clone(),
            provider,
            call,
            prior: action.prior.clone(),
            replaces: action.phase == Some(ReplacePhase::Create),
            schema_version: action.schema_version,
            dependencies: action.dependencies.clone(),
            ignore_changes: action.ignore_changes.clone(),
        })
    }

    /// Builds the result and appends the apply to the state history.
    async fn finish(
        &self,
        plan: &ExecutionPlan,
        outcomes: Vec<ActionOutcome>,
        halted: Option<HaltReason>,
        mut snapshot: StateSnapshot,
    ) -> ApplyResult {
        let count = |state: ActionState| outcomes.iter().filter(|o| o.state == state).count();
        let succeeded = count(ActionState::Succeeded);
        let failed = count(ActionState::Failed);
        let skipped = count(ActionState::Skipped);

        let status = if failed == 0 && skipped == 0 && halted.is_none() {
            ApplyStatus::Succeeded
        } else {
            ApplyStatus::PartialFailure
        };

        let persisted = !matches!(halted, Some(HaltReason::StatePersistFailed { .. }));
        if !plan.is_empty() && persisted {
            let resources = outcomes
                .iter()
                .filter(|o| o.state == ActionState::Succeeded)
                .map(|o| o.id.clone())
                .collect();
            let entry = match status {
                ApplyStatus::Succeeded => ApplyHistoryEntry::new(plan.fingerprint(), resources),
                ApplyStatus::PartialFailure => ApplyHistoryEntry::failed(
                    plan.fingerprint(),
                    resources,
                    &format!("{failed} failed, {skipped} skipped"),
                ),
            };
            snapshot.add_history(entry);

            match self.store.put(&self.key, &snapshot, snapshot.serial).await {
                Ok(serial) => snapshot.serial = serial,
                Err(e) => warn!("Failed to record apply history: {e}"),
            }
        }

        ApplyResult {
            status,
            outcomes,
            succeeded,
            failed,
            skipped,
            halted,
            snapshot,
        }
    }
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("backend", &self.store.backend_type())
            .field("key", &self.key)
            .field("parallelism", &self.parallelism)
            .field("retry", &self.retry)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

/// Rejects plans computed against a different snapshot.
fn check_fresh(plan: &ExecutionPlan, snapshot: &StateSnapshot) -> Result<()> {
    let lineage_matches = plan
        .lineage
        .as_ref()
        .map_or(snapshot.serial == 0, |l| *l == snapshot.lineage);

    if plan.state_serial == snapshot.serial && lineage_matches {
        return Ok(());
    }

    Err(StateError::StalePlan {
        plan_serial: plan.state_serial,
        plan_lineage: plan.lineage.clone().unwrap_or_default(),
        state_serial: snapshot.serial,
        state_lineage: snapshot.lineage.clone(),
    }
    .into())
}

/// Resolves every reference from records written so far.
fn resolve_attributes(
    desired: &BTreeMap<String, Value>,
    snapshot: &StateSnapshot,
) -> std::result::Result<Attributes, String> {
    let lookup = |reference: &Reference| {
        let record = snapshot.get(&reference.address)?;
        reference.lookup(&record.id, &record.attributes)
    };

    desired
        .iter()
        .map(|(name, value)| {
            value
                .resolve(&lookup)
                .known()
                .map(|known| (name.clone(), known))
                .ok_or_else(|| format!("attribute '{name}' references a value that is not available"))
        })
        .collect()
}

impl PreparedAction {
    /// Makes the provider call with retries and returns the state change.
    async fn run(self, retry: &RetryPolicy) -> (std::result::Result<Effect, ProviderError>, u32) {
        let provider = Arc::clone(&self.provider);

        match &self.call {
            Call::Create(attributes) => {
                let (result, attempts) = retry
                    .run("create", || {
                        let provider = Arc::clone(&provider);
                        let attributes = attributes.clone();
                        async move { provider.create(&attributes).await }
                    })
                    .await;
                let effect = result.map(|created| Effect::Record {
                    depose: self
                        .prior
                        .as_ref()
                        .filter(|_| self.replaces)
                        .map(|p| p.id.clone()),
                    record: self.record(created.id, created.attributes),
                });
                (effect, attempts)
            }
            Call::Update { id, attributes } => {
                let (result, attempts) = retry
                    .run("update", || {
                        let provider = Arc::clone(&provider);
                        let id = id.clone();
                        let attributes = attributes.clone();
                        async move { provider.update(&id, &attributes).await }
                    })
                    .await;
                let effect = result.map(|attributes| Effect::Record {
                    record: self.record(id.clone(), attributes),
                    depose: None,
                });
                (effect, attempts)
            }
            Call::Delete { id } => {
                let (result, attempts) = retry
                    .run("delete", || {
                        let provider = Arc::clone(&provider);
                        let id = id.clone();
                        async move { provider.delete(&id).await }
                    })
                    .await;
                let result = match result {
                    Err(ProviderError::NotFound { .. }) => {
                        debug!("{} ({id}) already gone", self.address);
                        Ok(())
                    }
                    other => other,
                };
                let effect = result.map(|()| Effect::Remove {
                    address: self.address.clone(),
                    id: id.clone(),
                });
                (effect, attempts)
            }
            Call::RecordOnly => {
                let effect = match &self.prior {
                    Some(prior) => Ok(Effect::Record {
                        record: self.record(prior.id.clone(), prior.attributes.clone()),
                        depose: None,
                    }),
                    None => Err(ProviderError::terminal("update", "no prior record")),
                };
                (effect, 0)
            }
        }
    }

    fn record(&self, id: String, attributes: Attributes) -> ResourceRecord {
        ResourceRecord::new(self.address.clone(), id, attributes)
            .with_schema_version(self.schema_version)
            .with_dependencies(self.dependencies.iter().cloned())
            .with_ignore_changes(self.ignore_changes.clone())
    }
}

impl Effect {
    fn apply(self, snapshot: &mut StateSnapshot) {
        match self {
            Self::Record { record, depose } => {
                if let Some(old) = depose {
                    if snapshot.get(&record.address).is_some_and(|r| r.id == old) {
                        snapshot.depose(&record.address);
                    }
                }
                snapshot.upsert(record);
            }
            Self::Remove { address, id } => {
                if snapshot.get(&address).is_some_and(|r| r.id == id) {
                    snapshot.remove(&address);
                } else {
                    snapshot.remove_deposed(&address, &id);
                }
            }
        }
    }
}

impl ActionOutcome {
    fn pending(action: &PlanAction, batch: usize) -> Self {
        Self {
            id: action.id.clone(),
            address: action.address.clone(),
            kind: action.kind,
            phase: action.phase,
            batch,
            state: ActionState::Pending,
            attempts: 0,
            error: None,
        }
    }

    fn fail(&mut self, message: String, attempts: u32) {
        self.state = ActionState::Failed;
        self.attempts = self.attempts.max(attempts);
        self.error = Some(message);
    }

    fn skip(&mut self, reason: String) {
        self.state = ActionState::Skipped;
        self.error = Some(reason);
    }
}

impl ApplyResult {
    /// Returns true if every action succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == ApplyStatus::Succeeded
    }

    /// Outcome of an action by id.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<&ActionOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Serial of the last successful state write.
    #[must_use]
    pub const fn serial(&self) -> u64 {
        self.snapshot.serial
    }
}

impl std::fmt::Display for ActionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "apply cancelled"),
            Self::DeadlineExceeded => write!(f, "apply deadline exceeded"),
            Self::StatePersistFailed { message } => write!(f, "state could not be recorded: {message}"),
        }
    }
}

impl std::fmt::Display for ApplyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = match self.status {
            ApplyStatus::Succeeded => "Apply succeeded",
            ApplyStatus::PartialFailure => "Apply partially failed",
        };
        writeln!(
            f,
            "{status}: {} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )?;
        if let Some(reason) = &self.halted {
            writeln!(f, "Stopped early: {reason}")?;
        }
        for outcome in &self.outcomes {
            write!(f, "  {} {}", outcome.state, outcome.id)?;
            if let Some(error) = &outcome.error {
                write!(f, ": {error}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
