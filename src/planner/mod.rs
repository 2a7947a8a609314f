//! Planning and execution module.
//!
//! This module turns a parsed plan file into an immutable [`Plan`], orders it
//! with a [`DependencyGraph`], compares it against recorded state, applies or
//! destroys it, and resolves the declared outputs.

mod diff;
mod executor;
mod graph;
mod outputs;
mod plan;

pub use diff::{DiffEngine, DiffResult, DiffType, ResourceDiff};
pub use executor::{
    ActionType, DEFAULT_PARALLELISM, ExecutionResult, OutcomeStatus, PlanExecutor, ResourceOutcome,
};
pub use graph::DependencyGraph;
pub use outputs::{LookupFailure, OutputResolver, ResolvedOutputs, lookup_reference};
pub use plan::{OutputDeclaration, Plan, ResourceDeclaration};
