//! Run orchestration.
//!
//! A [`Reconciler`] drives one apply or destroy run end to end: it takes the
//! state lock, loads the snapshot, runs the [`PlanExecutor`], resolves the
//! declared outputs, records history, saves, and releases the lock.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{ConfigError, Result};
use crate::planner::{DependencyGraph, DiffEngine, DiffResult, ExecutionResult, OutputResolver, Plan, PlanExecutor};
use crate::provider::Provider;
use crate::state::{
    LOCK_REFRESH_INTERVAL, LockInfo, RunHistoryEntry, RunOperation, StateSnapshot, StateStore, generate_holder_id,
};

/// Orchestrates runs of one plan against one state store.
pub struct Reconciler<'a> {
    /// The plan being realized.
    plan: &'a Plan,
    /// State store.
    store: &'a dyn StateStore,
    /// Provider the engine talks to.
    provider: Arc<dyn Provider>,
    /// Engine tuning.
    engine: EngineConfig,
    /// Cancels the run.
    cancel: CancellationToken,
    /// Lock holder identifier.
    holder: String,
    /// Diff engine.
    diff_engine: DiffEngine,
}

/// Result of a run.
#[derive(Debug)]
pub struct RunReport {
    /// Per-resource outcomes and counts.
    pub execution: ExecutionResult,
    /// Outputs that resolved after the run.
    pub outputs: BTreeMap<String, JsonValue>,
    /// Outputs that could not be resolved, with the reason.
    pub output_errors: Vec<String>,
    /// State serial after the final save.
    pub serial: u64,
}

impl RunReport {
    /// Returns true if every resource succeeded and nothing was cancelled.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.execution.success()
    }
}

impl<'a> Reconciler<'a> {
    /// Creates a new reconciler.
    #[must_use]
    pub fn new(plan: &'a Plan, store: &'a dyn StateStore, provider: Arc<dyn Provider>) -> Self {
        Self {
            plan,
            store,
            provider,
            engine: EngineConfig::default(),
            cancel: CancellationToken::new(),
            holder: generate_holder_id(),
            diff_engine: DiffEngine::new(),
        }
    }

    /// Sets the engine tuning.
    #[must_use]
    pub fn with_engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Uses `cancel` to stop runs.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the lock holder identifier.
    #[must_use]
    pub fn with_holder(mut self, holder: impl Into<String>) -> Self {
        self.holder = holder.into();
        self
    }

    /// Loads the recorded state, if any, checking it belongs to this plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded or was recorded for a
    /// different project or environment.
    pub async fn load_state(&self) -> Result<Option<StateSnapshot>> {
        let state = self.store.load().await?;
        if let Some(state) = &state {
            self.check_ownership(state)?;
        }
        Ok(state)
    }

    /// Computes what an apply (or a destroy) would do, without a provider call.
    ///
    /// # Errors
    ///
    /// Returns an error if the state cannot be loaded.
    pub async fn preview(&self, destroy: bool) -> Result<DiffResult> {
        let state = self.load_state().await?;
        let diff = if destroy {
            self.diff_engine.compute_destroy(state.as_ref())
        } else {
            self.diff_engine.compute_diff(self.plan, state.as_ref())
        };
        debug!(%diff, destroy, "Computed preview");
        Ok(diff)
    }

    /// Applies the plan, restricted to `targets` when not empty.
    ///
    /// # Errors
    ///
    /// Returns an error for a cyclic plan, a held lock, an unknown target, or
    /// a state store failure. Resource failures are reported in the result.
    pub async fn apply(&self, targets: &[String]) -> Result<RunReport> {
        let graph = DependencyGraph::from_plan(self.plan)?;
        info!(
            project = self.plan.project(),
            environment = self.plan.environment(),
            resources = self.plan.len(),
            "Applying plan"
        );
        self.run(RunOperation::Apply, Some(&graph), targets).await
    }

    /// Destroys recorded resources, restricted to `targets` when not empty.
    ///
    /// # Errors
    ///
    /// Returns an error for a held lock, an unknown target, cyclic recorded
    /// dependencies, or a state store failure.
    pub async fn destroy(&self, targets: &[String]) -> Result<RunReport> {
        info!(
            project = self.plan.project(),
            environment = self.plan.environment(),
            "Destroying recorded resources"
        );
        self.run(RunOperation::Destroy, None, targets).await
    }

    async fn run(
        &self,
        operation: RunOperation,
        graph: Option<&DependencyGraph>,
        targets: &[String],
    ) -> Result<RunReport> {
        let mut lock = self.store.acquire_lock(&self.holder, &operation.to_string()).await?;
        debug!(lock_id = %lock.lock_id, holder = %lock.holder, "Acquired state lock");

        let outcome = self.run_locked(operation, graph, targets, &mut lock).await;

        if let Err(e) = self.store.release_lock(&lock.lock_id).await {
            warn!(lock_id = %lock.lock_id, error = %e, "Failed to release state lock");
        }
        outcome
    }

    async fn run_locked(
        &self,
        operation: RunOperation,
        graph: Option<&DependencyGraph>,
        targets: &[String],
        lock: &mut LockInfo,
    ) -> Result<RunReport> {
        let mut state = self
            .load_state()
            .await?
            .unwrap_or_else(|| StateSnapshot::new(self.plan.project(), self.plan.environment()));

        let executor = PlanExecutor::new(Arc::clone(&self.provider))
            .with_engine(&self.engine)
            .with_cancellation(self.cancel.clone());

        let execution = {
            let state = &mut state;
            let executor = &executor;
            let run = async move {
                match graph {
                    Some(graph) => executor.apply(self.plan, graph, state, self.store, targets).await,
                    None => executor.destroy(Some(self.plan), state, self.store, targets).await,
                }
            };
            self.with_heartbeat(lock, run).await?
        };

        let resolved = OutputResolver::new(self.plan).resolve_available(&state);
        let output_errors: Vec<String> = resolved.errors.iter().map(ToString::to_string).collect();
        state.outputs.clone_from(&resolved.values);

        let mut entry = RunHistoryEntry::new(
            operation,
            self.plan.hash(),
            execution.succeeded,
            execution.failed,
            execution.skipped,
        );
        if let Some(reason) = failure_summary(&execution) {
            entry = entry.with_error(reason);
        }
        state.add_history(entry);
        state.touch();
        self.store.save(&state).await?;

        info!(
            %execution,
            outputs = resolved.values.len(),
            serial = state.serial,
            "Run recorded"
        );

        Ok(RunReport {
            execution,
            outputs: resolved.values,
            output_errors,
            serial: state.serial,
        })
    }

    /// Awaits `run`, refreshing the state lock while it is in progress.
    async fn with_heartbeat<T>(&self, lock: &mut LockInfo, run: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::pin!(run);
        let mut heartbeat = interval_at(Instant::now() + LOCK_REFRESH_INTERVAL, LOCK_REFRESH_INTERVAL);

        loop {
            tokio::select! {
                result = &mut run => return result,
                _ = heartbeat.tick() => match self.store.refresh_lock(lock).await {
                    Ok(refreshed) => {
                        debug!(lock_id = %refreshed.lock_id, expires_at = %refreshed.expires_at, "Refreshed state lock");
                        *lock = refreshed;
                    }
                    Err(e) => warn!(lock_id = %lock.lock_id, error = %e, "Failed to refresh state lock"),
                },
            }
        }
    }

    fn check_ownership(&self, state: &StateSnapshot) -> Result<()> {
        if state.project != self.plan.project() || state.environment != self.plan.environment() {
            return Err(ConfigError::validation(
                format!(
                    "State belongs to {}/{}, but the plan is {}/{}",
                    state.project,
                    state.environment,
                    self.plan.project(),
                    self.plan.environment()
                ),
                "project",
            )
            .into());
        }
        Ok(())
    }
}

/// Condenses the failures of a run into one history line.
fn failure_summary(execution: &ExecutionResult) -> Option<String> {
    let failed: Vec<&str> = execution.failures().map(|o| o.id.as_str()).collect();
    if !failed.is_empty() {
        return Some(format!("failed: {}", failed.join(", ")));
    }
    if execution.cancelled {
        return Some(String::from("cancelled"));
    }
    None
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", self.execution)?;
        for failure in self.execution.failures() {
            writeln!(
                f,
                "  - {}: {}",
                failure.id,
                failure.error.as_deref().unwrap_or("unknown error")
            )?;
        }
        for error in &self.output_errors {
            writeln!(f, "  ! {error}")?;
        }
        Ok(())
    }
}
