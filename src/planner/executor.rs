//! Apply engine.
//!
//! Walks the dependency graph and realizes or deletes resources through a
//! [`Provider`]. Each resource's provider calls and readiness wait run as a
//! task in a [`JoinSet`]; the engine loop is the only writer of the
//! [`StateSnapshot`] and persists it after every transition.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, PollConfig, Reference, ResourceKind};
use crate::error::{ApplyError, ConfigError, ProviderError, Result, TierformError};
use crate::provider::{CreateRequest, Provider, ProviderResource, ProviderStatus, WaitConfig, wait_until};
use crate::state::{ResourceState, ResourceStatus, RunOperation, StateSnapshot, StateStore};

use super::graph::DependencyGraph;
use super::outputs::lookup_reference;
use super::plan::{Plan, ResourceDeclaration};

/// Default number of resources in flight.
pub const DEFAULT_PARALLELISM: usize = 10;

/// Readiness bound for kinds without one of their own.
const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(300);

/// Executes apply and destroy runs.
pub struct PlanExecutor {
    provider: Arc<dyn Provider>,
    parallelism: usize,
    poll: PollConfig,
    readiness_timeout: Option<Duration>,
    cancel: CancellationToken,
}

/// What the engine did to a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// Issued a create call.
    Create,
    /// Waited on a create issued by an earlier run.
    Resume,
    /// Found a resource from an earlier run already available.
    Adopt,
    /// Issued a delete call.
    Delete,
    /// Nothing to do.
    Noop,
}

/// How a resource ended the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    /// Reached `Ready` (apply) or `Deleted` (destroy).
    Succeeded,
    /// Already `Ready`; no provider call.
    Unchanged,
    /// Failed.
    Failed,
    /// Not attempted because something it needs failed.
    Skipped,
    /// Not finished because the run was cancelled.
    Cancelled,
}

/// Result for a single resource.
#[derive(Debug, Clone)]
pub struct ResourceOutcome {
    /// Declaration identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// What was done.
    pub action: ActionType,
    /// How it ended.
    pub status: OutcomeStatus,
    /// Provider handle, if known.
    pub handle: Option<String>,
    /// Failure or skip reason.
    pub error: Option<String>,
}

/// Result of a run.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Apply or destroy.
    pub operation: RunOperation,
    /// One outcome per resource in scope, in execution order.
    pub outcomes: Vec<ResourceOutcome>,
    /// Resources that succeeded.
    pub succeeded: usize,
    /// Resources that were already in the desired state.
    pub unchanged: usize,
    /// Resources that failed.
    pub failed: usize,
    /// Resources that were skipped or cancelled.
    pub skipped: usize,
    /// Whether the run was cancelled.
    pub cancelled: bool,
}

/// Sent by a task as soon as the provider assigned a handle.
#[derive(Debug)]
struct HandleAssigned {
    id: String,
    handle: String,
}

/// Final report of a task.
#[derive(Debug)]
struct TaskOutcome<T> {
    id: String,
    action: ActionType,
    handle: Option<String>,
    result: Result<T>,
}

/// Per-run bookkeeping shared by apply and destroy.
struct Run {
    order: Vec<String>,
    positions: HashMap<String, usize>,
    outstanding: Vec<usize>,
    ready: BTreeSet<usize>,
    outcomes: HashMap<String, ResourceOutcome>,
}

impl std::fmt::Debug for PlanExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanExecutor")
            .field("provider", &self.provider.name())
            .field("parallelism", &self.parallelism)
            .field("poll", &self.poll)
            .field("readiness_timeout", &self.readiness_timeout)
            .finish_non_exhaustive()
    }
}

impl PlanExecutor {
    /// Creates an executor with default engine settings.
    #[must_use]
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            parallelism: DEFAULT_PARALLELISM,
            poll: PollConfig::default(),
            readiness_timeout: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Applies the plan's engine section.
    #[must_use]
    pub fn with_engine(self, engine: &EngineConfig) -> Self {
        let timeout = engine.poll.timeout_secs.map(Duration::from_secs);
        let mut executor = self.with_parallelism(engine.parallelism).with_poll(engine.poll.clone());
        executor.readiness_timeout = timeout;
        executor
    }

    /// Sets the maximum number of resources in flight.
    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Sets the readiness polling backoff.
    #[must_use]
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Overrides every per-kind readiness bound.
    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = Some(timeout);
        self
    }

    /// Uses `cancel` to stop the run.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the cancellation token of this executor.
    #[must_use]
    pub const fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn wait_config(&self, kind: ResourceKind) -> WaitConfig {
        let timeout = self
            .readiness_timeout
            .or_else(|| kind.readiness_timeout())
            .unwrap_or(DEFAULT_READINESS_TIMEOUT);
        WaitConfig::from_poll(&self.poll, timeout)
    }

    /// Realizes every `Pending` declaration in scope.
    ///
    /// `targets` restricts the run to the named resources and everything
    /// they depend on; empty means the whole plan.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown target, an invalid state transition,
    /// or a state store failure. Resource failures are reported in the
    /// result, not as errors.
    pub async fn apply(
        &self,
        plan: &Plan,
        graph: &DependencyGraph,
        state: &mut StateSnapshot,
        store: &dyn StateStore,
        targets: &[String],
    ) -> Result<ExecutionResult> {
        let scope = apply_scope(plan, graph, targets)?;
        info!(
            resources = scope.len(),
            parallelism = self.parallelism,
            provider = self.provider.name(),
            "Starting apply"
        );

        state.begin_apply_cycle();
        for id in &scope {
            let decl = declaration(plan, id)?;
            state.ensure_declared(id, decl.kind, &decl.hash, &decl.dependencies);
        }
        plan.hash().clone_into(&mut state.plan_hash);
        persist(store, state).await?;

        let mut run = Run::new(scope);
        for i in 0..run.order.len() {
            let id = run.order[i].clone();
            let record = find_record(state, &id)?;
            if record.is_ready() {
                let outcome = ResourceOutcome::new(record, ActionType::Noop, OutcomeStatus::Unchanged);
                run.record(outcome);
                continue;
            }
            let blocking = graph
                .dependencies(&id)
                .iter()
                .filter(|dep| !state.get(dep).is_some_and(ResourceState::is_ready))
                .count();
            run.set_outstanding(i, blocking);
        }

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();

        loop {
            while tasks.len() < self.parallelism && !self.cancel.is_cancelled() {
                let Some(id) = run.next_ready() else {
                    break;
                };
                let decl = declaration(plan, &id)?;

                let existing = find_record(state, &id)?.handle.clone();
                state.transition(&id, ResourceStatus::Creating)?;

                let attributes = match resolve_attributes(plan, decl, state) {
                    Ok(attributes) => attributes,
                    Err(e) => {
                        fail_apply(&mut run, graph, state, &id, ActionType::Create, &e)?;
                        persist(store, state).await?;
                        continue;
                    }
                };
                persist(store, state).await?;

                debug!(resource = %id, resume = existing.is_some(), "Dispatching");
                let request = CreateRequest::new(&id, decl.kind, attributes)
                    .with_region(plan.region())
                    .with_project(plan.project(), plan.environment());
                tasks.spawn(realize(
                    Arc::clone(&self.provider),
                    request,
                    existing,
                    self.wait_config(decl.kind),
                    self.cancel.clone(),
                    events_tx.clone(),
                ));
            }

            if tasks.is_empty() {
                break;
            }

            let joined = tokio::select! {
                Some(assigned) = events_rx.recv() => {
                    assign_handle(state, assigned)?;
                    persist(store, state).await?;
                    continue;
                }
                Some(joined) = tasks.join_next() => joined,
            };

            let outcome = joined.map_err(|e| TierformError::internal(format!("Apply task failed: {e}")))?;
            while let Ok(assigned) = events_rx.try_recv() {
                assign_handle(state, assigned)?;
            }

            let id = outcome.id;
            if let Some(handle) = outcome.handle {
                find_record_mut(state, &id)?.handle = Some(handle);
            }

            match outcome.result {
                Ok(resource) => {
                    let record = find_record_mut(state, &id)?;
                    record.handle = Some(resource.handle.clone());
                    record.attributes = resource.attributes;
                    record.transition(ResourceStatus::Ready)?;
                    info!(resource = %id, handle = %resource.handle, action = %outcome.action, "Resource ready");

                    let outcome = ResourceOutcome::new(record, outcome.action, OutcomeStatus::Succeeded);
                    run.record(outcome);
                    for dependent in graph.dependents(&id) {
                        run.release(&dependent);
                    }
                }
                Err(TierformError::Apply(ApplyError::Cancelled { .. })) => {
                    let record = find_record(state, &id)?;
                    warn!(resource = %id, handle = ?record.handle, "Cancelled while {}", record.status);
                    let outcome = ResourceOutcome::new(record, outcome.action, OutcomeStatus::Cancelled);
                    run.record(outcome);
                }
                Err(e) => fail_apply(&mut run, graph, state, &id, outcome.action, &e)?,
            }
            persist(store, state).await?;
        }

        let result = run.finish(RunOperation::Apply, state, self.cancel.is_cancelled());
        info!(
            succeeded = result.succeeded,
            unchanged = result.unchanged,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "Apply finished"
        );
        Ok(result)
    }

    /// Deletes every recorded resource in scope, dependents first.
    ///
    /// The graph is rebuilt from the dependencies recorded in state, so
    /// resources no longer in the plan are deleted too. `plan`, when given,
    /// only fixes the tie-break order. `targets` restricts the run to the
    /// named resources and everything that depends on them.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown target, a cycle in the recorded
    /// dependencies, an invalid state transition, or a state store failure.
    pub async fn destroy(
        &self,
        plan: Option<&Plan>,
        state: &mut StateSnapshot,
        store: &dyn StateStore,
        targets: &[String],
    ) -> Result<ExecutionResult> {
        state.begin_destroy_cycle();
        persist(store, state).await?;

        let graph = state_graph(plan, state)?;
        let scope = destroy_scope(&graph, state, targets)?;
        info!(
            resources = scope.len(),
            parallelism = self.parallelism,
            provider = self.provider.name(),
            "Starting destroy"
        );

        let mut run = Run::new(scope);
        for i in 0..run.order.len() {
            let blocking = graph
                .dependents(&run.order[i])
                .iter()
                .filter(|d| run.positions.contains_key(*d))
                .count();
            run.set_outstanding(i, blocking);
        }

        let mut tasks = JoinSet::new();

        loop {
            while tasks.len() < self.parallelism && !self.cancel.is_cancelled() {
                let Some(id) = run.next_ready() else {
                    break;
                };
                let record = find_record(state, &id)?;
                let kind = record.kind;

                let Some(handle) = record.handle.clone() else {
                    state.transition(&id, ResourceStatus::Deleting)?;
                    state.transition(&id, ResourceStatus::Deleted)?;
                    let outcome = ResourceOutcome::new(find_record(state, &id)?, ActionType::Noop, OutcomeStatus::Succeeded);
                    run.record(outcome);
                    for dependency in graph.dependencies(&id) {
                        run.release(&dependency);
                    }
                    continue;
                };

                state.transition(&id, ResourceStatus::Deleting)?;
                persist(store, state).await?;

                debug!(resource = %id, %handle, "Dispatching delete");
                tasks.spawn(remove(
                    Arc::clone(&self.provider),
                    kind,
                    id,
                    handle,
                    self.wait_config(kind),
                    self.cancel.clone(),
                ));
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let outcome = joined.map_err(|e| TierformError::internal(format!("Destroy task failed: {e}")))?;
            let id = outcome.id;

            match outcome.result {
                Ok(()) => {
                    state.transition(&id, ResourceStatus::Deleted)?;
                    info!(resource = %id, handle = ?outcome.handle, "Resource deleted");
                    let outcome = ResourceOutcome::new(find_record(state, &id)?, outcome.action, OutcomeStatus::Succeeded);
                    run.record(outcome);
                    for dependency in graph.dependencies(&id) {
                        run.release(&dependency);
                    }
                }
                Err(TierformError::Apply(ApplyError::Cancelled { .. })) => {
                    warn!(resource = %id, "Cancelled while deleting");
                    let outcome = ResourceOutcome::new(find_record(state, &id)?, outcome.action, OutcomeStatus::Cancelled);
                    run.record(outcome);
                }
                Err(e) => {
                    error!(resource = %id, error = %e, "Delete failed");
                    let record = find_record_mut(state, &id)?;
                    record.fail(e.to_string())?;
                    let mut failed = ResourceOutcome::new(record, outcome.action, OutcomeStatus::Failed);
                    failed.error = Some(e.to_string());
                    run.record(failed);

                    for dependency in graph.transitive_dependencies(&id) {
                        if run.positions.contains_key(&dependency) && !run.outcomes.contains_key(&dependency) {
                            let mut skipped =
                                ResourceOutcome::new(find_record(state, &dependency)?, ActionType::Noop, OutcomeStatus::Skipped);
                            skipped.error = Some(format!("still required by {id}, whose delete failed"));
                            run.record(skipped);
                        }
                    }
                }
            }
            persist(store, state).await?;
        }

        let result = run.finish(RunOperation::Destroy, state, self.cancel.is_cancelled());
        let pruned = state.prune_deleted();
        persist(store, state).await?;

        info!(
            deleted = result.succeeded,
            pruned,
            failed = result.failed,
            skipped = result.skipped,
            cancelled = result.cancelled,
            "Destroy finished"
        );
        Ok(result)
    }
}

impl Run {
    fn new(order: Vec<String>) -> Self {
        let positions = order.iter().enumerate().map(|(i, id)| (id.clone(), i)).collect();
        Self {
            outstanding: vec![0; order.len()],
            order,
            positions,
            ready: BTreeSet::new(),
            outcomes: HashMap::new(),
        }
    }

    fn set_outstanding(&mut self, position: usize, blocking: usize) {
        self.outstanding[position] = blocking;
        if blocking == 0 {
            self.ready.insert(position);
        }
    }

    /// Pops the earliest resource whose blockers are all done.
    fn next_ready(&mut self) -> Option<String> {
        self.ready.pop_first().map(|i| self.order[i].clone())
    }

    /// Marks one blocker of `id` as done.
    fn release(&mut self, id: &str) {
        let Some(&i) = self.positions.get(id) else {
            return;
        };
        if self.outcomes.contains_key(id) || self.outstanding[i] == 0 {
            return;
        }
        self.outstanding[i] -= 1;
        if self.outstanding[i] == 0 {
            self.ready.insert(i);
        }
    }

    fn record(&mut self, outcome: ResourceOutcome) {
        if let Some(&i) = self.positions.get(&outcome.id) {
            self.ready.remove(&i);
        }
        self.outcomes.insert(outcome.id.clone(), outcome);
    }

    fn finish(mut self, operation: RunOperation, state: &StateSnapshot, cancelled: bool) -> ExecutionResult {
        let mut outcomes = Vec::with_capacity(self.order.len());
        for id in &self.order {
            if let Some(outcome) = self.outcomes.remove(id) {
                outcomes.push(outcome);
                continue;
            }
            let Some(record) = state.get(id) else {
                continue;
            };
            let (status, reason) = if cancelled {
                (OutcomeStatus::Cancelled, "run cancelled before it started")
            } else {
                (OutcomeStatus::Skipped, "not reached")
            };
            let mut outcome = ResourceOutcome::new(record, ActionType::Noop, status);
            outcome.error = Some(reason.to_string());
            outcomes.push(outcome);
        }
        ExecutionResult::new(operation, outcomes, cancelled)
    }
}

fn apply_scope(plan: &Plan, graph: &DependencyGraph, targets: &[String]) -> Result<Vec<String>> {
    let order = graph.apply_order();
    if targets.is_empty() {
        return Ok(order);
    }

    let mut resolved = Vec::new();
    for target in targets {
        let ids = plan.resolve_target(target);
        if ids.is_empty() {
            return Err(ConfigError::validation(format!("Unknown target '{target}'"), "target").into());
        }
        resolved.extend(ids);
    }

    let closure = graph.apply_closure(&resolved);
    Ok(order.into_iter().filter(|id| closure.contains(id)).collect())
}

/// Builds the graph of recorded resources, in plan order first.
fn state_graph(plan: Option<&Plan>, state: &StateSnapshot) -> Result<DependencyGraph> {
    let mut records: Vec<&ResourceState> = state.resources.values().collect();
    records.sort_by_key(|r| plan.and_then(|p| p.get(&r.id)).map_or(usize::MAX, |d| d.index));
    DependencyGraph::from_nodes(records.into_iter().map(|r| (r.id.clone(), r.dependencies.clone())))
}

fn destroy_scope(graph: &DependencyGraph, state: &StateSnapshot, targets: &[String]) -> Result<Vec<String>> {
    let order = graph.destroy_order();
    if targets.is_empty() {
        return Ok(order);
    }

    let mut resolved = Vec::new();
    for target in targets {
        let prefix = format!("{target}[");
        let ids: Vec<String> = state
            .resources
            .keys()
            .filter(|id| *id == target || id.starts_with(&prefix))
            .cloned()
            .collect();
        if ids.is_empty() {
            return Err(ConfigError::validation(format!("Unknown target '{target}'"), "target").into());
        }
        resolved.extend(ids);
    }

    let closure: HashSet<String> = graph.destroy_closure(&resolved);
    Ok(order.into_iter().filter(|id| closure.contains(id)).collect())
}

fn resolve_attributes(
    plan: &Plan,
    decl: &ResourceDeclaration,
    state: &StateSnapshot,
) -> Result<BTreeMap<String, JsonValue>> {
    let lookup = |reference: &Reference| {
        lookup_reference(plan, state, reference).map_err(|f| f.into_apply_error(&decl.id, reference))
    };
    decl.attributes
        .iter()
        .map(|(name, value)| value.resolve(&lookup).map(|v| (name.clone(), v)))
        .collect()
}

/// Marks `id` failed and every pending resource that depends on it blocked.
fn fail_apply(
    run: &mut Run,
    graph: &DependencyGraph,
    state: &mut StateSnapshot,
    id: &str,
    action: ActionType,
    cause: &TierformError,
) -> Result<()> {
    error!(resource = %id, error = %cause, "Resource failed");
    let record = find_record_mut(state, id)?;
    record.fail(cause.to_string())?;
    let mut failed = ResourceOutcome::new(record, action, OutcomeStatus::Failed);
    failed.error = Some(cause.to_string());
    run.record(failed);

    for dependent in graph.transitive_dependents(id) {
        let pending = state.get(&dependent).is_some_and(|r| r.status == ResourceStatus::Pending);
        if !pending || !run.positions.contains_key(&dependent) {
            continue;
        }
        let reason = ApplyError::DependencyFailed {
            resource: dependent.clone(),
            dependency: id.to_string(),
        }
        .to_string();
        warn!(resource = %dependent, dependency = %id, "Blocked by failed dependency");

        let record = find_record_mut(state, &dependent)?;
        record.fail(reason.clone())?;
        let mut skipped = ResourceOutcome::new(record, ActionType::Noop, OutcomeStatus::Skipped);
        skipped.error = Some(reason);
        run.record(skipped);
    }
    Ok(())
}

fn assign_handle(state: &mut StateSnapshot, assigned: HandleAssigned) -> Result<()> {
    debug!(resource = %assigned.id, handle = %assigned.handle, "Handle assigned");
    find_record_mut(state, &assigned.id)?.handle = Some(assigned.handle);
    Ok(())
}

async fn persist(store: &dyn StateStore, state: &mut StateSnapshot) -> Result<()> {
    state.touch();
    store.save(state).await
}

fn declaration<'p>(plan: &'p Plan, id: &str) -> Result<&'p ResourceDeclaration> {
    plan.get(id)
        .ok_or_else(|| TierformError::internal(format!("{id} is not declared in the plan")))
}

fn find_record<'s>(state: &'s StateSnapshot, id: &str) -> Result<&'s ResourceState> {
    state
        .get(id)
        .ok_or_else(|| TierformError::internal(format!("{id} has no state record")))
}

fn find_record_mut<'s>(state: &'s mut StateSnapshot, id: &str) -> Result<&'s mut ResourceState> {
    state
        .get_mut(id)
        .ok_or_else(|| TierformError::internal(format!("{id} has no state record")))
}

fn cancelled(resource: &str) -> TierformError {
    ApplyError::Cancelled {
        resource: resource.to_string(),
    }
    .into()
}

/// Creates (or resumes) one resource and waits until it is available.
async fn realize(
    provider: Arc<dyn Provider>,
    request: CreateRequest,
    existing: Option<String>,
    wait: WaitConfig,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<HandleAssigned>,
) -> TaskOutcome<ProviderResource> {
    let id = request.resource_id.clone();
    let kind = request.kind;
    let mut action = ActionType::Create;
    let mut handle = existing;

    let result = async {
        if cancel.is_cancelled() {
            return Err(cancelled(&id));
        }

        if let Some(previous) = handle.clone() {
            let observed = provider.describe(kind, &previous).await?;
            match observed.status {
                ProviderStatus::Available => {
                    action = ActionType::Adopt;
                    return Ok(observed);
                }
                ProviderStatus::InProgress => {
                    action = ActionType::Resume;
                    return await_ready(&*provider, kind, &previous, &id, &wait, &cancel).await;
                }
                ProviderStatus::Failed(reason) => {
                    warn!(resource = %id, handle = %previous, %reason, "Previous create failed, creating anew");
                }
                ProviderStatus::NotFound => {
                    debug!(resource = %id, handle = %previous, "Previous handle gone, creating anew");
                }
            }
            handle = None;
        }

        let created = provider.create(&request).await?;
        handle = Some(created.handle.clone());
        let _ = events.send(HandleAssigned {
            id: id.clone(),
            handle: created.handle.clone(),
        });

        match created.status {
            ProviderStatus::Available => Ok(created),
            ProviderStatus::InProgress => await_ready(&*provider, kind, &created.handle, &id, &wait, &cancel).await,
            ProviderStatus::Failed(reason) => Err(ProviderError::OperationFailed {
                resource: id.clone(),
                reason,
            }
            .into()),
            ProviderStatus::NotFound => Err(ProviderError::InvalidResponse {
                message: format!("Create of {id} returned a handle that does not exist"),
            }
            .into()),
        }
    }
    .await;

    TaskOutcome {
        id,
        action,
        handle,
        result,
    }
}

async fn await_ready(
    provider: &dyn Provider,
    kind: ResourceKind,
    handle: &str,
    id: &str,
    wait: &WaitConfig,
    cancel: &CancellationToken,
) -> Result<ProviderResource> {
    wait_until(wait, cancel, id, "ready", || async move {
        let observed = provider.describe(kind, handle).await?;
        match observed.status {
            ProviderStatus::Available => Ok(Some(observed)),
            ProviderStatus::InProgress => Ok(None),
            ProviderStatus::Failed(reason) => Err(ProviderError::OperationFailed {
                resource: id.to_string(),
                reason,
            }
            .into()),
            ProviderStatus::NotFound => Err(ProviderError::OperationFailed {
                resource: id.to_string(),
                reason: format!("{handle} disappeared while creating"),
            }
            .into()),
        }
    })
    .await
}

/// Deletes one resource and waits until the provider no longer knows it.
async fn remove(
    provider: Arc<dyn Provider>,
    kind: ResourceKind,
    id: String,
    handle: String,
    wait: WaitConfig,
    cancel: CancellationToken,
) -> TaskOutcome<()> {
    let result = async {
        if cancel.is_cancelled() {
            return Err(cancelled(&id));
        }

        match provider.delete(kind, &handle).await {
            Ok(ProviderStatus::NotFound | ProviderStatus::Available) => Ok(()),
            Ok(ProviderStatus::InProgress) => {
                let provider = &*provider;
                let (handle, id) = (handle.as_str(), id.as_str());
                wait_until(&wait, &cancel, id, "deleted", || async move {
                    let observed = provider.describe(kind, handle).await?;
                    match observed.status {
                        ProviderStatus::NotFound => Ok(Some(())),
                        ProviderStatus::Available | ProviderStatus::InProgress => Ok(None),
                        ProviderStatus::Failed(reason) => Err(ProviderError::OperationFailed {
                            resource: id.to_string(),
                            reason,
                        }
                        .into()),
                    }
                })
                .await
            }
            Ok(ProviderStatus::Failed(reason)) => Err(ProviderError::OperationFailed {
                resource: id.clone(),
                reason,
            }
            .into()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }
    .await;

    TaskOutcome {
        id,
        action: ActionType::Delete,
        handle: Some(handle),
        result,
    }
}

impl ResourceOutcome {
    fn new(record: &ResourceState, action: ActionType, status: OutcomeStatus) -> Self {
        Self {
            id: record.id.clone(),
            kind: record.kind,
            action,
            status,
            handle: record.handle.clone(),
            error: record.error.clone(),
        }
    }
}

impl ExecutionResult {
    fn new(operation: RunOperation, outcomes: Vec<ResourceOutcome>, cancelled: bool) -> Self {
        let count = |s: OutcomeStatus| outcomes.iter().filter(|o| o.status == s).count();
        Self {
            operation,
            succeeded: count(OutcomeStatus::Succeeded),
            unchanged: count(OutcomeStatus::Unchanged),
            failed: count(OutcomeStatus::Failed),
            skipped: count(OutcomeStatus::Skipped) + count(OutcomeStatus::Cancelled),
            cancelled,
            outcomes,
        }
    }

    /// Returns true if nothing failed and the run was not cancelled.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.failed == 0 && self.skipped == 0 && !self.cancelled
    }

    /// Returns the outcomes that failed.
    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed)
    }

    /// Looks up the outcome of one resource.
    #[must_use]
    pub fn outcome(&self, id: &str) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Resume => "resume",
            Self::Adopt => "adopt",
            Self::Delete => "delete",
            Self::Noop => "none",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::Unchanged => "unchanged",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} resources: {} succeeded, {} unchanged, {} failed, {} skipped",
            self.operation,
            self.outcomes.len(),
            self.succeeded,
            self.unchanged,
            self.failed,
            self.skipped
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::provider::{Fault, MockProvider, SimulatedProvider};
    use crate::state::LocalStateStore;
    use serde_json::json;
    use tempfile::TempDir;

    const EXAMPLE: &str = r"
project:
  name: web-stack
  region: us-east-1
resources:
  - id: v1
    type: vpc
    attributes:
      cidr_block: 10.0.0.0/16
  - id: s1
    type: subnet
    attributes:
      vpc_id: ${v1.id}
      cidr_block: 10.0.1.0/24
  - id: lb1
    type: load_balancer
    attributes:
      subnets: ['${s1.id}']
  - id: tg1
    type: target_group
    attributes:
      vpc_id: ${v1.id}
      port: 80
      protocol: HTTP
  - id: asg1
    type: auto_scaling_group
    attributes:
      launch_template_id: lt-0123
      min_size: 1
      max_size: 2
      subnet_ids: ['${s1.id}']
      target_group_arns: ['${tg1.arn}']
";

    struct Harness {
        plan: Plan,
        graph: DependencyGraph,
        provider: Arc<SimulatedProvider>,
        store: LocalStateStore,
        state: StateSnapshot,
        _temp: TempDir,
    }

    impl Harness {
        fn new(provider: SimulatedProvider) -> Self {
            let config = ConfigParser::new().parse_yaml(EXAMPLE, None).unwrap();
            let plan = Plan::from_config(&config).unwrap();
            let graph = DependencyGraph::from_plan(&plan).unwrap();
            let temp = TempDir::new().unwrap();
            Self {
                state: StateSnapshot::new(plan.project(), plan.environment()),
                plan,
                graph,
                provider: Arc::new(provider),
                store: LocalStateStore::with_base_dir(temp.path()),
                _temp: temp,
            }
        }

        fn executor(&self) -> PlanExecutor {
            let provider: Arc<dyn Provider> = self.provider.clone();
            PlanExecutor::new(provider).with_poll(PollConfig {
                initial_delay_ms: 5,
                max_delay_ms: 20,
                jitter: 0.0,
                timeout_secs: None,
            })
        }

        async fn apply_with(&mut self, executor: &PlanExecutor, targets: &[&str]) -> ExecutionResult {
            let targets: Vec<String> = targets.iter().map(|t| (*t).to_string()).collect();
            executor
                .apply(&self.plan, &self.graph, &mut self.state, &self.store, &targets)
                .await
                .unwrap()
        }

        async fn apply(&mut self) -> ExecutionResult {
            let executor = self.executor();
            self.apply_with(&executor, &[]).await
        }

        async fn destroy_with(&mut self, executor: &PlanExecutor, targets: &[&str]) -> ExecutionResult {
            let targets: Vec<String> = targets.iter().map(|t| (*t).to_string()).collect();
            executor
                .destroy(Some(&self.plan), &mut self.state, &self.store, &targets)
                .await
                .unwrap()
        }

        fn status(&self, id: &str) -> ResourceStatus {
            self.state.get(id).unwrap().status
        }
    }

    fn position(log: &[String], id: &str) -> usize {
        log.iter().position(|x| x == id).unwrap()
    }

    #[tokio::test]
    async fn test_apply_realizes_everything_in_dependency_order() {
        let mut h = Harness::new(SimulatedProvider::new().with_latency(Duration::from_millis(5)));
        let result = h.apply().await;

        assert!(result.success());
        assert_eq!(result.succeeded, 5);
        assert!(h.state.is_fully_ready());

        let log = h.provider.create_log();
        for (dependent, dependency) in [("s1", "v1"), ("lb1", "s1"), ("tg1", "v1"), ("asg1", "s1"), ("asg1", "tg1")] {
            assert!(position(&log, dependency) < position(&log, dependent));
        }

        let stored = h.store.load().await.unwrap().unwrap();
        assert!(stored.is_fully_ready());
        assert_eq!(stored.serial, h.state.serial);
    }

    #[tokio::test]
    async fn test_single_lane_follows_apply_order() {
        let mut h = Harness::new(SimulatedProvider::new());
        let executor = h.executor().with_parallelism(1);
        h.apply_with(&executor, &[]).await;

        assert_eq!(h.provider.create_log(), vec!["v1", "s1", "lb1", "tg1", "asg1"]);
    }

    #[tokio::test]
    async fn test_references_resolved_from_dependencies() {
        let mut h = Harness::new(SimulatedProvider::new());
        h.apply().await;

        let vpc_id = h.state.get("v1").unwrap().attributes["id"].clone();
        assert!(vpc_id.as_str().unwrap().starts_with("vpc-"));
        assert_eq!(h.state.get("s1").unwrap().dependencies, vec![String::from("v1")]);
    }

    #[tokio::test]
    async fn test_reapply_issues_no_calls() {
        let mut h = Harness::new(SimulatedProvider::new());
        h.apply().await;
        let before = h.provider.calls();

        let result = h.apply().await;
        assert_eq!(result.unchanged, 5);
        assert_eq!(result.succeeded, 0);
        assert_eq!(h.provider.calls(), before);
    }

    #[tokio::test]
    async fn test_failure_blocks_dependents_only() {
        let mut h = Harness::new(SimulatedProvider::new().with_fault("s1", Fault::RejectCreate(String::from("quota"))));
        let result = h.apply().await;

        assert!(!result.success());
        assert_eq!(result.failed, 1);
        assert_eq!(result.skipped, 2);
        assert_eq!(h.status("s1"), ResourceStatus::Failed);
        assert_eq!(h.status("lb1"), ResourceStatus::Failed);
        assert_eq!(h.status("asg1"), ResourceStatus::Failed);
        assert_eq!(h.status("v1"), ResourceStatus::Ready);
        assert_eq!(h.status("tg1"), ResourceStatus::Ready);

        let log = h.provider.create_log();
        assert!(!log.contains(&String::from("lb1")));
        assert!(!log.contains(&String::from("asg1")));
        assert!(h.state.get("lb1").unwrap().error.as_deref().unwrap().contains("blocked by failed dependency s1"));
        assert_eq!(result.failures().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["s1"]);
    }

    #[tokio::test]
    async fn test_failed_run_is_retried_on_next_apply() {
        let mut h = Harness::new(SimulatedProvider::new().with_fault("s1", Fault::RejectCreate(String::from("quota"))));
        h.apply().await;

        h.provider = Arc::new(SimulatedProvider::new());
        let result = h.apply().await;
        assert!(result.success());
        assert_eq!(result.unchanged, 2);
        assert_eq!(result.succeeded, 3);
    }

    #[tokio::test]
    async fn test_readiness_failure_propagates() {
        let mut h = Harness::new(
            SimulatedProvider::new()
                .with_polls(1)
                .with_fault("tg1", Fault::FailReadiness(String::from("health check misconfigured"))),
        );
        let result = h.apply().await;

        assert_eq!(h.status("tg1"), ResourceStatus::Failed);
        assert_eq!(h.status("asg1"), ResourceStatus::Failed);
        assert_eq!(h.status("lb1"), ResourceStatus::Ready);
        assert!(h.state.get("tg1").unwrap().handle.is_some());
        assert_eq!(result.outcome("asg1").unwrap().status, OutcomeStatus::Skipped);
    }

    #[tokio::test]
    async fn test_readiness_timeout() {
        let mut h = Harness::new(SimulatedProvider::new().with_fault("v1", Fault::NeverReady));
        let executor = h.executor().with_readiness_timeout(Duration::from_millis(50));
        let result = h.apply_with(&executor, &[]).await;

        assert_eq!(h.status("v1"), ResourceStatus::Failed);
        let error = result.outcome("v1").unwrap().error.clone().unwrap();
        assert!(error.contains("Timeout waiting for v1"));
        assert_eq!(result.skipped, 4);
        assert_eq!(h.provider.calls().creates, 1);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let mut h = Harness::new(SimulatedProvider::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = h.executor().with_cancellation(cancel);
        let result = h.apply_with(&executor, &[]).await;

        assert!(result.cancelled);
        assert_eq!(h.provider.calls().creates, 0);
        assert_eq!(h.state.with_status(ResourceStatus::Pending).len(), 5);
    }

    #[tokio::test]
    async fn test_cancel_while_waiting_keeps_handle() {
        let mut h = Harness::new(SimulatedProvider::new().with_kind_polls(ResourceKind::Vpc, u32::MAX));
        let cancel = CancellationToken::new();
        let executor = h.executor().with_cancellation(cancel.clone());
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let result = h.apply_with(&executor, &[]).await;
        assert!(result.cancelled);

        let stored = h.store.load().await.unwrap().unwrap();
        let vpc = stored.get("v1").unwrap();
        assert_eq!(vpc.status, ResourceStatus::Creating);
        assert!(vpc.handle.is_some());
        assert_eq!(stored.get("s1").unwrap().status, ResourceStatus::Pending);
        assert_eq!(h.provider.calls().creates, 1);
    }

    #[tokio::test]
    async fn test_resume_adopts_existing_handle() {
        let mut h = Harness::new(SimulatedProvider::new().with_kind_polls(ResourceKind::Vpc, 1));
        let created = h
            .provider
            .create(&CreateRequest::new("v1", ResourceKind::Vpc, BTreeMap::new()))
            .await
            .unwrap();

        let decl = h.plan.get("v1").unwrap();
        let mut record = ResourceState::new("v1", ResourceKind::Vpc, &decl.hash, Vec::new());
        record.status = ResourceStatus::Creating;
        record.handle = Some(created.handle.clone());
        h.state.upsert(record);

        let result = h.apply().await;
        assert!(result.success());
        assert_eq!(result.outcome("v1").unwrap().action, ActionType::Adopt);
        assert_eq!(h.state.get("v1").unwrap().handle.as_deref(), Some(created.handle.as_str()));
        assert_eq!(h.provider.calls().creates, 5);
    }

    #[tokio::test]
    async fn test_resume_recreates_vanished_handle() {
        let mut h = Harness::new(SimulatedProvider::new());
        let mut record = ResourceState::new("v1", ResourceKind::Vpc, "h", Vec::new());
        record.status = ResourceStatus::Failed;
        record.handle = Some(String::from("arn:aws:ec2:us-east-1:123456789012:vpc/vpc-gone"));
        h.state.upsert(record);

        let result = h.apply().await;
        assert!(result.success());
        assert_eq!(result.outcome("v1").unwrap().action, ActionType::Create);
        assert_ne!(
            h.state.get("v1").unwrap().handle.as_deref(),
            Some("arn:aws:ec2:us-east-1:123456789012:vpc/vpc-gone")
        );
    }

    #[tokio::test]
    async fn test_targeted_apply() {
        let mut h = Harness::new(SimulatedProvider::new());
        let executor = h.executor();
        let result = h.apply_with(&executor, &["lb1"]).await;

        assert_eq!(result.outcomes.len(), 3);
        assert_eq!(h.provider.create_log(), vec!["v1", "s1", "lb1"]);
        assert!(h.state.get("asg1").is_none());
    }

    #[tokio::test]
    async fn test_unknown_target_rejected() {
        let mut h = Harness::new(SimulatedProvider::new());
        let executor = h.executor();
        let err = executor
            .apply(&h.plan, &h.graph, &mut h.state, &h.store, &[String::from("nope")])
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    async fn test_destroy_is_reverse_of_apply() {
        let mut h = Harness::new(SimulatedProvider::new());
        let executor = h.executor().with_parallelism(1);
        h.apply_with(&executor, &[]).await;

        let result = h.destroy_with(&executor, &[]).await;
        assert!(result.success());

        let mut expected = h.provider.create_log();
        expected.reverse();
        assert_eq!(h.provider.delete_log(), expected);
        assert_eq!(h.provider.live_count(), 0);
        assert!(h.state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_destroy_deletes_dependents_first() {
        let mut h = Harness::new(SimulatedProvider::new().with_polls(1));
        h.apply().await;
        let executor = h.executor();
        h.destroy_with(&executor, &[]).await;

        let log = h.provider.delete_log();
        for (dependent, dependency) in [("s1", "v1"), ("lb1", "s1"), ("tg1", "v1"), ("asg1", "s1"), ("asg1", "tg1")] {
            assert!(position(&log, dependent) < position(&log, dependency));
        }
    }

    #[tokio::test]
    async fn test_destroy_failure_keeps_dependencies() {
        let mut h = Harness::new(SimulatedProvider::new().with_fault("s1", Fault::FailDelete(String::from("in use"))));
        h.apply().await;
        let executor = h.executor();
        let result = h.destroy_with(&executor, &[]).await;

        assert_eq!(result.failed, 1);
        assert_eq!(h.status("s1"), ResourceStatus::Failed);
        assert_eq!(h.status("v1"), ResourceStatus::Ready);
        assert_eq!(result.outcome("v1").unwrap().status, OutcomeStatus::Skipped);
        assert!(h.state.get("lb1").is_none());
        assert!(h.state.get("tg1").is_none());
        assert!(!h.provider.delete_log().contains(&String::from("v1")));
    }

    #[tokio::test]
    async fn test_destroy_treats_not_found_as_deleted() {
        let mut h = Harness::new(SimulatedProvider::new());
        h.apply().await;
        let handle = h.provider.handle_of("tg1").unwrap();
        assert!(h.provider.forget(&handle));

        let executor = h.executor();
        let result = h.destroy_with(&executor, &[]).await;
        assert!(result.success());
        assert!(h.state.resources.is_empty());
    }

    #[tokio::test]
    async fn test_targeted_destroy_takes_dependents() {
        let mut h = Harness::new(SimulatedProvider::new());
        h.apply().await;
        let executor = h.executor();
        let result = h.destroy_with(&executor, &["s1"]).await;

        assert_eq!(result.succeeded, 3);
        assert!(h.state.get("s1").is_none());
        assert!(h.state.get("lb1").is_none());
        assert!(h.state.get("asg1").is_none());
        assert_eq!(h.status("v1"), ResourceStatus::Ready);
        assert_eq!(h.status("tg1"), ResourceStatus::Ready);
    }

    #[tokio::test]
    async fn test_destroy_includes_orphans() {
        let mut h = Harness::new(SimulatedProvider::new());
        h.apply().await;
        let orphan = h
            .provider
            .create(&CreateRequest::new("bastion", ResourceKind::Instance, BTreeMap::new()))
            .await
            .unwrap();
        let mut record = ResourceState::new("bastion", ResourceKind::Instance, "old", vec![String::from("s1")]);
        record.status = ResourceStatus::Ready;
        record.handle = Some(orphan.handle);
        h.state.upsert(record);

        let executor = h.executor();
        let result = h.destroy_with(&executor, &[]).await;
        assert!(result.success());
        let log = h.provider.delete_log();
        assert!(position(&log, "bastion") < position(&log, "s1"));
    }

    #[tokio::test]
    async fn test_create_request_carries_resolved_references() {
        let mut provider = MockProvider::new();
        provider.expect_name().return_const("mock");
        provider
            .expect_create()
            .withf(|r: &CreateRequest| r.resource_id == "v1")
            .times(1)
            .returning(|r| {
                let mut resource = ProviderResource::new("arn:vpc/vpc-abc", ProviderStatus::Available);
                resource.attributes.insert(String::from("id"), json!("vpc-abc"));
                resource.attributes.insert(String::from("arn"), json!("arn:vpc/vpc-abc"));
                assert_eq!(r.region.as_deref(), Some("us-east-1"));
                Ok(resource)
            });
        provider
            .expect_create()
            .withf(|r: &CreateRequest| r.resource_id == "s1" && r.attributes["vpc_id"] == json!("vpc-abc"))
            .times(1)
            .returning(|_| Ok(ProviderResource::new("arn:subnet/subnet-1", ProviderStatus::Available)));

        let config = ConfigParser::new().parse_yaml(EXAMPLE, None).unwrap();
        let plan = Plan::from_config(&config).unwrap();
        let graph = DependencyGraph::from_plan(&plan).unwrap();
        let temp = TempDir::new().unwrap();
        let store = LocalStateStore::with_base_dir(temp.path());
        let mut state = StateSnapshot::new("web-stack", "dev");

        let executor = PlanExecutor::new(Arc::new(provider));
        let result = executor
            .apply(&plan, &graph, &mut state, &store, &[String::from("s1")])
            .await
            .unwrap();
        assert_eq!(result.succeeded, 2);
    }

    #[test]
    fn test_result_display() {
        let result = ExecutionResult::new(RunOperation::Apply, Vec::new(), false);
        assert_eq!(result.to_string(), "apply of 0 resources: 0 succeeded, 0 unchanged, 0 failed, 0 skipped");
        assert!(result.success());
    }
}
