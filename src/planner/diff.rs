//! Diff engine comparing a plan against recorded state.
//!
//! The comparison is against the state snapshot only; the live provider is
//! never consulted.

use std::collections::HashSet;
use tracing::debug;

use crate::config::ResourceKind;
use crate::state::{ResourceStatus, StateSnapshot};

use super::plan::Plan;

/// Engine for computing what a run would do.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDiff {
    /// Declaration identifier.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Type of difference.
    pub diff_type: DiffType,
    /// Recorded handle, if any.
    pub handle: Option<String>,
    /// Hash the record was realized from.
    pub old_hash: Option<String>,
    /// Hash of the current declaration.
    pub new_hash: Option<String>,
}

/// Type of difference detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiffType {
    /// No realized record: an apply creates it.
    Create,
    /// A previous run left it unfinished with a handle: an apply resumes it.
    Resume,
    /// Ready and unchanged.
    NoChange,
    /// Ready, but the declaration changed since it was realized. Reported only.
    Changed,
    /// Recorded but no longer declared. Removed by `destroy`.
    Orphan,
    /// Deleted by a destroy.
    Delete,
}

/// Complete diff result.
#[derive(Debug, Default)]
pub struct DiffResult {
    /// All resource diffs, plan order first, then orphans.
    pub diffs: Vec<ResourceDiff>,
    /// Number of resources to create.
    pub creates: usize,
    /// Number of resources to resume.
    pub resumes: usize,
    /// Number of changed declarations.
    pub changed: usize,
    /// Number of orphaned records.
    pub orphans: usize,
    /// Number of resources to delete.
    pub deletes: usize,
    /// Number of unchanged resources.
    pub unchanged: usize,
}

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes what an apply of `plan` would do given `state`.
    #[must_use]
    pub fn compute_diff(&self, plan: &Plan, state: Option<&StateSnapshot>) -> DiffResult {
        let mut diffs = Vec::with_capacity(plan.len());

        for decl in plan.declarations() {
            let record = state.and_then(|s| s.get(&decl.id));
            let (diff_type, handle, old_hash) = match record {
                None => (DiffType::Create, None, None),
                Some(r) if r.status == ResourceStatus::Ready => {
                    let diff_type = if r.declaration_hash == decl.hash {
                        DiffType::NoChange
                    } else {
                        DiffType::Changed
                    };
                    (diff_type, r.handle.clone(), Some(r.declaration_hash.clone()))
                }
                Some(r) if r.handle.is_some() && r.status != ResourceStatus::Deleted => {
                    (DiffType::Resume, r.handle.clone(), Some(r.declaration_hash.clone()))
                }
                Some(r) => (DiffType::Create, None, Some(r.declaration_hash.clone())),
            };

            debug!(resource = %decl.id, %diff_type, "Computed diff");
            diffs.push(ResourceDiff {
                id: decl.id.clone(),
                kind: decl.kind,
                diff_type,
                handle,
                old_hash,
                new_hash: Some(decl.hash.clone()),
            });
        }

        if let Some(state) = state {
            let declared: HashSet<&str> = plan.declarations().iter().map(|d| d.id.as_str()).collect();
            for record in state.resources.values() {
                if declared.contains(record.id.as_str())
                    || record.handle.is_none()
                    || record.status == ResourceStatus::Deleted
                {
                    continue;
                }
                debug!(resource = %record.id, "Found orphaned record");
                diffs.push(ResourceDiff {
                    id: record.id.clone(),
                    kind: record.kind,
                    diff_type: DiffType::Orphan,
                    handle: record.handle.clone(),
                    old_hash: Some(record.declaration_hash.clone()),
                    new_hash: None,
                });
            }
        }

        DiffResult::from_diffs(diffs)
    }

    /// Computes what a destroy would delete: every record with a handle.
    #[must_use]
    pub fn compute_destroy(&self, state: Option<&StateSnapshot>) -> DiffResult {
        let diffs = state
            .map(|s| {
                s.resources
                    .values()
                    .filter(|r| r.handle.is_some() && r.status != ResourceStatus::Deleted)
                    .map(|r| ResourceDiff {
                        id: r.id.clone(),
                        kind: r.kind,
                        diff_type: DiffType::Delete,
                        handle: r.handle.clone(),
                        old_hash: Some(r.declaration_hash.clone()),
                        new_hash: None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        DiffResult::from_diffs(diffs)
    }
}

impl DiffResult {
    fn from_diffs(diffs: Vec<ResourceDiff>) -> Self {
        let count = |t: DiffType| diffs.iter().filter(|d| d.diff_type == t).count();
        Self {
            creates: count(DiffType::Create),
            resumes: count(DiffType::Resume),
            changed: count(DiffType::Changed),
            orphans: count(DiffType::Orphan),
            deletes: count(DiffType::Delete),
            unchanged: count(DiffType::NoChange),
            diffs,
        }
    }

    /// Returns true if a run would issue any provider call.
    #[must_use]
    pub const fn has_changes(&self) -> bool {
        self.creates > 0 || self.resumes > 0 || self.deletes > 0
    }

    /// Returns the number of resources a run would act upon.
    #[must_use]
    pub const fn total_changes(&self) -> usize {
        self.creates + self.resumes + self.deletes
    }

    /// Filters to diffs worth showing.
    #[must_use]
    pub fn actionable_diffs(&self) -> Vec<&ResourceDiff> {
        self.diffs
            .iter()
            .filter(|d| d.diff_type != DiffType::NoChange)
            .collect()
    }

    /// Looks up the diff of one resource.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ResourceDiff> {
        self.diffs.iter().find(|d| d.id == id)
    }
}

impl DiffType {
    /// Returns the symbol shown in front of the resource in plan output.
    #[must_use]
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Resume => "~",
            Self::NoChange => " ",
            Self::Changed => "!",
            Self::Orphan => "?",
            Self::Delete => "-",
        }
    }
}

impl std::fmt::Display for DiffType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Resume => "resume",
            Self::NoChange => "no change",
            Self::Changed => "changed",
            Self::Orphan => "orphan",
            Self::Delete => "delete",
        };
        write!(f, "{s}")
    }
}

impl std::fmt::Display for ResourceDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} ({}): {}", self.diff_type.symbol(), self.id, self.kind, self.diff_type)?;
        if let Some(handle) = &self.handle {
            write!(f, " [{handle}]")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for DiffResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to resume, {} to delete, {} unchanged",
            self.creates, self.resumes, self.deletes, self.unchanged
        )?;
        if self.changed > 0 {
            write!(f, ", {} changed", self.changed)?;
        }
        if self.orphans > 0 {
            write!(f, ", {} orphaned", self.orphans)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::state::ResourceState;

    const PLAN: &str = r"
project:
  name: web-stack
resources:
  - id: vpc
    type: vpc
    attributes:
      cidr_block: 10.0.0.0/16
  - id: subnet
    type: subnet
    attributes:
      vpc_id: ${vpc.id}
      cidr_block: 10.0.1.0/24
  - id: sg
    type: security_group
    attributes:
      vpc_id: ${vpc.id}
      name: web
";

    fn plan() -> Plan {
        let config = ConfigParser::new().parse_yaml(PLAN, None).unwrap();
        Plan::from_config(&config).unwrap()
    }

    fn record(plan: &Plan, id: &str, status: ResourceStatus, handle: Option<&str>) -> ResourceState {
        let decl = plan.get(id).map_or_else(
            || (ResourceKind::Instance, String::from("old")),
            |d| (d.kind, d.hash.clone()),
        );
        let mut record = ResourceState::new(id, decl.0, &decl.1, Vec::new());
        record.status = status;
        record.handle = handle.map(String::from);
        record
    }

    #[test]
    fn test_no_state_creates_everything() {
        let plan = plan();
        let diff = DiffEngine::new().compute_diff(&plan, None);
        assert_eq!(diff.creates, 3);
        assert!(diff.has_changes());
        assert_eq!(diff.diffs[0].id, "vpc");
    }

    #[test]
    fn test_classification() {
        let plan = plan();
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.upsert(record(&plan, "vpc", ResourceStatus::Ready, Some("arn:vpc")));
        state.upsert(record(&plan, "subnet", ResourceStatus::Creating, Some("arn:subnet")));
        let mut sg = record(&plan, "sg", ResourceStatus::Ready, Some("arn:sg"));
        sg.declaration_hash = String::from("stale");
        state.upsert(sg);
        state.upsert(record(&plan, "bastion", ResourceStatus::Ready, Some("arn:i")));

        let diff = DiffEngine::new().compute_diff(&plan, Some(&state));

        assert_eq!(diff.get("vpc").unwrap().diff_type, DiffType::NoChange);
        assert_eq!(diff.get("subnet").unwrap().diff_type, DiffType::Resume);
        assert_eq!(diff.get("sg").unwrap().diff_type, DiffType::Changed);
        assert_eq!(diff.get("bastion").unwrap().diff_type, DiffType::Orphan);
        assert_eq!(diff.total_changes(), 1);
        assert_eq!(diff.actionable_diffs().len(), 3);
    }

    #[test]
    fn test_failed_without_handle_is_recreated() {
        let plan = plan();
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.upsert(record(&plan, "vpc", ResourceStatus::Failed, None));

        let diff = DiffEngine::new().compute_diff(&plan, Some(&state));
        assert_eq!(diff.get("vpc").unwrap().diff_type, DiffType::Create);
    }

    #[test]
    fn test_destroy_preview() {
        let plan = plan();
        let mut state = StateSnapshot::new("web-stack", "dev");
        state.upsert(record(&plan, "vpc", ResourceStatus::Ready, Some("arn:vpc")));
        state.upsert(record(&plan, "subnet", ResourceStatus::Pending, None));

        let diff = DiffEngine::new().compute_destroy(Some(&state));
        assert_eq!(diff.deletes, 1);
        assert_eq!(diff.diffs[0].to_string(), "- vpc (vpc): delete [arn:vpc]");
        assert!(!DiffEngine::new().compute_destroy(None).has_changes());
    }
}
