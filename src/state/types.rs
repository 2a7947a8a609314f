//! State types for tracking realized resources.
//!
//! These types are the recorded inventory of a project: one
//! [`ResourceState`] per declaration, with its provider handle, realized
//! attributes and lifecycle status. The apply engine is the only writer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

use crate::config::ResourceKind;
use crate::error::StateError;

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of run history entries kept in the snapshot.
pub const MAX_HISTORY: usize = 100;

/// The complete recorded state of a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// State format version.
    pub version: String,
    /// Project name.
    pub project: String,
    /// Environment name.
    pub environment: String,
    /// Hash of the last applied plan.
    pub plan_hash: String,
    /// Recorded resources, keyed by declaration identifier.
    pub resources: BTreeMap<String, ResourceState>,
    /// Resolved outputs of the last run.
    #[serde(default)]
    pub outputs: BTreeMap<String, JsonValue>,
    /// Incremented on every save.
    #[serde(default)]
    pub serial: u64,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<RunHistoryEntry>,
}

/// Recorded state of a single resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceState {
    /// Declaration identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Provider-assigned handle (e.g. an ARN), once the create call returned.
    #[serde(default)]
    pub handle: Option<String>,
    /// Realized attributes reported by the provider.
    #[serde(default)]
    pub attributes: BTreeMap<String, JsonValue>,
    /// Lifecycle status.
    pub status: ResourceStatus,
    /// Hash of the declaration this record was realized from.
    pub declaration_hash: String,
    /// Dependencies at the time of realization, used to order destroys.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Reason of the last failure.
    #[serde(default)]
    pub error: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When the record last changed.
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    /// Declared, not yet acted upon in this cycle.
    Pending,
    /// Create issued, waiting for readiness.
    Creating,
    /// Realized and available.
    Ready,
    /// Creation, readiness or deletion failed, or blocked by a dependency.
    Failed,
    /// Delete issued, waiting for completion.
    Deleting,
    /// Deleted.
    Deleted,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of run.
    pub operation: RunOperation,
    /// Plan hash at the time of the run.
    pub plan_hash: String,
    /// Resources that completed.
    pub succeeded: usize,
    /// Resources that failed.
    pub failed: usize,
    /// Resources that were skipped.
    pub skipped: usize,
    /// Whether the run succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of runs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Apply run.
    Apply,
    /// Destroy run.
    Destroy,
}

impl ResourceStatus {
    /// Returns true if the lifecycle allows moving from `self` to `to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Creating | Self::Failed)
                | (Self::Creating, Self::Ready | Self::Failed)
                | (Self::Ready, Self::Deleting)
                | (Self::Deleting, Self::Deleted | Self::Failed)
        )
    }

    /// Returns the lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Failed => "failed",
            Self::Deleting => "deleting",
            Self::Deleted => "deleted",
        }
    }
}

impl StateSnapshot {
    /// Creates a new empty snapshot.
    #[must_use]
    pub fn new(project: &str, environment: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            project: project.to_string(),
            environment: environment.to_string(),
            plan_hash: String::new(),
            resources: BTreeMap::new(),
            outputs: BTreeMap::new(),
            serial: 0,
            last_updated: Utc::now(),
            history: Vec::new(),
        }
    }

    /// Gets a resource by identifier.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceState> {
        self.resources.get(id)
    }

    /// Gets a mutable reference to a resource by identifier.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut ResourceState> {
        self.resources.get_mut(id)
    }

    /// Adds or replaces a resource record.
    pub fn upsert(&mut self, resource: ResourceState) {
        self.resources.insert(resource.id.clone(), resource);
        self.last_updated = Utc::now();
    }

    /// Removes a resource record.
    pub fn remove(&mut self, id: &str) -> Option<ResourceState> {
        let result = self.resources.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Moves `id` to `to`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the record is missing or the transition is invalid.
    pub fn transition(&mut self, id: &str, to: ResourceStatus) -> Result<(), StateError> {
        let record = self.resources.get_mut(id).ok_or_else(|| StateError::InvalidTransition {
            resource: id.to_string(),
            from: String::from("absent"),
            to: to.to_string(),
        })?;
        record.transition(to)?;
        self.last_updated = record.updated_at;
        Ok(())
    }

    /// Ensures a record exists for a declaration, seeding it as `Pending`.
    ///
    /// A `Pending` record picks up the latest declaration hash and
    /// dependencies; realized records keep what they were realized from.
    pub fn ensure_declared(&mut self, id: &str, kind: ResourceKind, declaration_hash: &str, dependencies: &[String]) {
        match self.resources.get_mut(id) {
            Some(record) if record.status == ResourceStatus::Pending => {
                record.kind = kind;
                declaration_hash.clone_into(&mut record.declaration_hash);
                dependencies.clone_into(&mut record.dependencies);
            }
            Some(_) => {}
            None => {
                self.upsert(ResourceState::new(id, kind, declaration_hash, dependencies.to_vec()));
            }
        }
    }

    /// Re-seeds records at the start of an apply cycle.
    ///
    /// `Ready` records are kept as they are. `Deleted` records are dropped.
    /// Everything else goes back to `Pending`, keeping any handle so the
    /// engine can resume it.
    pub fn begin_apply_cycle(&mut self) {
        self.resources.retain(|_, r| r.status != ResourceStatus::Deleted);
        for record in self.resources.values_mut() {
            if record.status != ResourceStatus::Ready {
                record.reset(ResourceStatus::Pending);
            }
        }
        self.last_updated = Utc::now();
    }

    /// Re-seeds records at the start of a destroy cycle.
    ///
    /// Records with a handle still exist physically and become `Ready` so
    /// they can be deleted. Records without a handle never existed and are
    /// dropped.
    pub fn begin_destroy_cycle(&mut self) {
        self.resources
            .retain(|_, r| r.handle.is_some() && r.status != ResourceStatus::Deleted);
        for record in self.resources.values_mut() {
            if record.status != ResourceStatus::Ready {
                record.reset(ResourceStatus::Ready);
            }
        }
        self.last_updated = Utc::now();
    }

    /// Drops every `Deleted` record, returning how many were removed.
    pub fn prune_deleted(&mut self) -> usize {
        let before = self.resources.len();
        self.resources.retain(|_, r| r.status != ResourceStatus::Deleted);
        before - self.resources.len()
    }

    /// Marks the snapshot as about to be saved.
    pub fn touch(&mut self) {
        self.serial += 1;
        self.last_updated = Utc::now();
    }

    /// Adds a history entry, keeping only the most recent ones.
    pub fn add_history(&mut self, entry: RunHistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            let excess = self.history.len() + 1 - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.history.push(entry);
    }

    /// Returns all records with the given status.
    #[must_use]
    pub fn with_status(&self, status: ResourceStatus) -> Vec<&ResourceState> {
        self.resources.values().filter(|r| r.status == status).collect()
    }

    /// Returns the number of records per status.
    #[must_use]
    pub fn status_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for record in self.resources.values() {
            *counts.entry(record.status.to_string()).or_insert(0) += 1;
        }
        counts
    }

    /// Returns true if every record is `Ready`.
    #[must_use]
    pub fn is_fully_ready(&self) -> bool {
        self.resources.values().all(|r| r.status == ResourceStatus::Ready)
    }

    /// Returns all record identifiers.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }
}

impl ResourceState {
    /// Creates a new `Pending` record.
    #[must_use]
    pub fn new(id: &str, kind: ResourceKind, declaration_hash: &str, dependencies: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            kind,
            handle: None,
            attributes: BTreeMap::new(),
            status: ResourceStatus::Pending,
            declaration_hash: declaration_hash.to_string(),
            dependencies,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves to `to`, enforcing the lifecycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the transition is not allowed.
    pub fn transition(&mut self, to: ResourceStatus) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                resource: self.id.clone(),
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to != ResourceStatus::Failed {
            self.error = None;
        }
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Records a failure reason, moving to `Failed`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current status cannot fail.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), StateError> {
        self.transition(ResourceStatus::Failed)?;
        self.error = Some(reason.into());
        Ok(())
    }

    /// Returns true if the record is `Ready`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready
    }

    /// Looks up a realized attribute.
    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&JsonValue> {
        self.attributes.get(name)
    }

    fn reset(&mut self, status: ResourceStatus) {
        self.status = status;
        self.error = None;
        self.updated_at = Utc::now();
    }
}

impl RunHistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, plan_hash: &str, succeeded: usize, failed: usize, skipped: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            plan_hash: plan_hash.to_string(),
            succeeded,
            failed,
            skipped,
            success: failed == 0,
            error: None,
        }
    }

    /// Attaches an error, marking the entry failed.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Destroy => "destroy",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with(records: &[(&str, ResourceStatus, Option<&str>)]) -> StateSnapshot {
        let mut state = StateSnapshot::new("web-stack", "dev");
        for (id, status, handle) in records {
            let mut record = ResourceState::new(id, ResourceKind::Vpc, "h", Vec::new());
            record.status = *status;
            record.handle = handle.map(String::from);
            state.upsert(record);
        }
        state
    }

    #[test]
    fn test_lifecycle_transitions() {
        use ResourceStatus::{Creating, Deleted, Deleting, Failed, Pending, Ready};

        assert!(Pending.can_transition_to(Creating));
        assert!(Pending.can_transition_to(Failed));
        assert!(Creating.can_transition_to(Ready));
        assert!(Creating.can_transition_to(Failed));
        assert!(Ready.can_transition_to(Deleting));
        assert!(Deleting.can_transition_to(Deleted));
        assert!(Deleting.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Ready));
        assert!(!Ready.can_transition_to(Creating));
        assert!(!Failed.can_transition_to(Creating));
        assert!(!Deleted.can_transition_to(Pending));
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut record = ResourceState::new("vpc", ResourceKind::Vpc, "h", Vec::new());
        let err = record.transition(ResourceStatus::Ready).unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { ref resource, .. } if resource == "vpc"));
        assert_eq!(record.status, ResourceStatus::Pending);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut record = ResourceState::new("vpc", ResourceKind::Vpc, "h", Vec::new());
        record.transition(ResourceStatus::Creating).unwrap();
        record.fail("quota exceeded").unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("quota exceeded"));
    }

    #[test]
    fn test_begin_apply_cycle_reseeds_and_keeps_handles() {
        let mut state = snapshot_with(&[
            ("ready", ResourceStatus::Ready, Some("arn:1")),
            ("creating", ResourceStatus::Creating, Some("arn:2")),
            ("failed", ResourceStatus::Failed, None),
            ("gone", ResourceStatus::Deleted, Some("arn:3")),
        ]);

        state.begin_apply_cycle();

        assert_eq!(state.get("ready").unwrap().status, ResourceStatus::Ready);
        let creating = state.get("creating").unwrap();
        assert_eq!(creating.status, ResourceStatus::Pending);
        assert_eq!(creating.handle.as_deref(), Some("arn:2"));
        assert_eq!(state.get("failed").unwrap().status, ResourceStatus::Pending);
        assert!(state.get("gone").is_none());
    }

    #[test]
    fn test_begin_destroy_cycle_drops_unrealized() {
        let mut state = snapshot_with(&[
            ("ready", ResourceStatus::Ready, Some("arn:1")),
            ("failed-with-handle", ResourceStatus::Failed, Some("arn:2")),
            ("never-created", ResourceStatus::Pending, None),
        ]);

        state.begin_destroy_cycle();

        assert_eq!(state.resource_ids(), vec!["failed-with-handle", "ready"]);
        assert!(state.is_fully_ready());
    }

    #[test]
    fn test_ensure_declared_only_updates_pending() {
        let mut state = snapshot_with(&[("vpc", ResourceStatus::Ready, Some("arn:1"))]);
        state.ensure_declared("vpc", ResourceKind::Vpc, "new-hash", &[]);
        state.ensure_declared("subnet", ResourceKind::Subnet, "s-hash", &[String::from("vpc")]);

        assert_eq!(state.get("vpc").unwrap().declaration_hash, "h");
        let subnet = state.get("subnet").unwrap();
        assert_eq!(subnet.status, ResourceStatus::Pending);
        assert_eq!(subnet.dependencies, vec![String::from("vpc")]);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StateSnapshot::new("web-stack", "dev");
        for _ in 0..(MAX_HISTORY + 5) {
            state.add_history(RunHistoryEntry::new(RunOperation::Apply, "h", 1, 0, 0));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
    }

    #[test]
    fn test_history_entry_success_flag() {
        assert!(RunHistoryEntry::new(RunOperation::Apply, "h", 3, 0, 0).success);
        assert!(!RunHistoryEntry::new(RunOperation::Apply, "h", 2, 1, 1).success);
        let cancelled = RunHistoryEntry::new(RunOperation::Destroy, "h", 0, 0, 0).with_error("cancelled");
        assert!(!cancelled.success);
    }

    #[test]
    fn test_touch_increments_serial() {
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.touch();
        state.touch();
        assert_eq!(state.serial, 2);
    }
}
