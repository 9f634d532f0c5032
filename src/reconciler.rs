//! Reconciler driving declarations to convergence.
//!
//! This module wires the engine together: it builds the graph, diffs it
//! against the stored snapshot, builds a plan and executes it under the
//! state lock, keeping the lease alive for as long as the apply runs.

use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConvergeError, LockError, Result};
use crate::graph::GraphBuilder;
use crate::planner::{
    ApplyResult, DiffEngine, DriftDetector, DriftReport, ExecutionPlan, PlanBuilder, PlanExecutor,
};
use crate::provider::ProviderRegistry;
use crate::resource::ResourceDeclaration;
use crate::state::{open_store, LockManager, StateSnapshot, StateStore};

/// End-to-end reconciler for one state-store key.
pub struct Reconciler {
    /// Providers by resource type.
    registry: Arc<ProviderRegistry>,
    /// State store.
    store: Arc<dyn StateStore>,
    /// Engine settings.
    config: EngineConfig,
}

impl Reconciler {
    /// Creates a reconciler over an existing store.
    #[must_use]
    pub fn new(registry: Arc<ProviderRegistry>, store: Arc<dyn StateStore>, config: EngineConfig) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Creates a reconciler, opening the backend named in `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the state backend cannot be opened.
    pub async fn open(registry: Arc<ProviderRegistry>, config: EngineConfig) -> Result<Self> {
        let store = open_store(&config.state).await?;
        Ok(Self::new(registry, store, config))
    }

    /// The state-store key this reconciler works on.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.config.state.key
    }

    /// Loads the stored snapshot, `None` if nothing was ever applied.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the record is corrupt.
    pub async fn load_snapshot(&self) -> Result<Option<StateSnapshot>> {
        self.store.get(self.key()).await
    }

    /// Computes the plan that would converge `declarations`.
    ///
    /// Read-only: no lock is taken and nothing is written.
    ///
    /// # Errors
    ///
    /// Returns configuration errors from the graph and diff, state read
    /// errors, and [`crate::error::PlanError::Infeasible`].
    pub async fn plan(&self, declarations: Vec<ResourceDeclaration>) -> Result<ExecutionPlan> {
        let snapshot = self.load_snapshot().await?;
        self.plan_against(declarations, snapshot.as_ref()).await
    }

    async fn plan_against(
        &self,
        declarations: Vec<ResourceDeclaration>,
        snapshot: Option<&StateSnapshot>,
    ) -> Result<ExecutionPlan> {
        let graph = GraphBuilder::new(&self.registry).build(declarations)?;
        debug!("Built graph with {} resources", graph.len());

        let diff = DiffEngine::new()
            .with_read_through(self.config.diff.read_through, &self.registry)
            .compute_diff(&graph, snapshot)
            .await?;

        let plan = PlanBuilder::new().build(&diff, snapshot)?;
        info!(
            "Plan for '{}': {} actions in {} batches, {} unchanged",
            self.key(),
            plan.action_count(),
            plan.batches.len(),
            plan.unchanged.len()
        );
        Ok(plan)
    }

    /// Plans and applies `declarations` under the state lock.
    ///
    /// Provider failures do not make this return an error; they are
    /// reported as a partial failure in the result.
    ///
    /// # Errors
    ///
    /// Returns lock errors, planning errors, and state errors raised before
    /// or between actions.
    pub async fn apply(&self, declarations: Vec<ResourceDeclaration>) -> Result<ApplyResult> {
        self.with_lock(|executor| async move {
            let snapshot = self.load_snapshot().await?;
            let plan = self.plan_against(declarations, snapshot.as_ref()).await?;
            executor.execute(&plan, snapshot.unwrap_or_default()).await
        })
        .await
    }

    /// Applies a previously computed plan under the state lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::PlanError::FingerprintMismatch`] if the plan
    /// was altered and [`crate::error::StateError::StalePlan`] if the state
    /// moved since it was computed.
    pub async fn apply_plan(&self, plan: &ExecutionPlan) -> Result<ApplyResult> {
        plan.verify_fingerprint()?;

        self.with_lock(|executor| async move {
            let snapshot = self.load_snapshot().await?.unwrap_or_default();
            executor.execute(plan, snapshot).await
        })
        .await
    }

    /// Reports out-of-band changes to recorded resources.
    ///
    /// Never takes the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored snapshot cannot be read.
    pub async fn check_drift(&self) -> Result<DriftReport> {
        info!("Checking for drift in '{}'", self.key());
        let Some(snapshot) = self.load_snapshot().await? else {
            return Ok(DriftReport::default());
        };
        DriftDetector::new(&self.registry).detect(&snapshot).await
    }

    /// Runs `work` while holding the lock and renewing its lease.
    async fn with_lock<F, Fut>(&self, work: F) -> Result<ApplyResult>
    where
        F: FnOnce(PlanExecutor) -> Fut,
        Fut: std::future::Future<Output = Result<ApplyResult>>,
    {
        let lock = LockManager::from_config(Arc::clone(&self.store), self.key(), &self.config.lock);
        lock.acquire().await?;

        let executor = PlanExecutor::from_config(
            Arc::clone(&self.registry),
            Arc::clone(&self.store),
            self.key(),
            &self.config.execution,
        );
        let heartbeat = lock.spawn_heartbeat(executor.cancellation().clone());

        let outcome = work(executor).await;

        let lost = heartbeat.is_lost();
        heartbeat.stop().await;

        match lock.release().await {
            Ok(()) => {}
            Err(ConvergeError::Lock(LockError::NotHolder { .. })) if lost => {
                warn!("Lock on '{}' was lost during apply", self.key());
            }
            Err(e) if outcome.is_ok() => return Err(e),
            Err(e) => error!("Failed to release lock on '{}': {e}", self.key()),
        }

        let result = outcome?;
        info!("{result}");
        Ok(result)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("key", &self.config.state.key)
            .field("backend", &self.store.backend_type())
            .field("resource_types", &self.registry.resource_types())
            .finish_non_exhaustive()
    }
}
