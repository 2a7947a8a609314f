// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
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
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Tierform
//!
//! A declarative engine that realizes a graph of interdependent cloud
//! resources, records what it created, and tears it down again.
//!
//! ## Overview
//!
//! Tierform reads a plan file describing resources and the references between
//! them, then:
//!
//! - Orders resources by their dependencies and rejects cycles up front
//! - Creates independent resources concurrently and waits for readiness
//! - Records every handle as soon as it is assigned, so an interrupted run resumes
//! - Destroys in reverse dependency order
//! - Resolves declared outputs from the realized attributes
//!
//! ## Architecture
//!
//! 1. **Plan**: Declared in `tierform.yaml` and parsed into an immutable [`Plan`]
//! 2. **Graph**: A [`DependencyGraph`] built from `${resource.attribute}` references
//! 3. **Engine**: A [`PlanExecutor`] driving a [`Provider`] under a state lock
//! 4. **State**: A [`StateSnapshot`] persisted through a [`StateStore`]
//!
//! ## Modules
//!
//! - [`config`]: Plan file parsing, attribute values and validation
//! - [`planner`]: Plan model, dependency graph, diff, apply engine and outputs
//! - [`provider`]: Control-plane abstraction with simulated and HTTP implementations
//! - [`state`]: State storage backends (local, S3) and locking
//! - [`reconciler`]: Locked, persisted apply and destroy runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: web-stack
//!
//! resources:
//!   - id: vpc
//!     type: vpc
//!     attributes:
//!       cidr_block: 10.0.0.0/16
//!   - id: subnet
//!     type: subnet
//!     count: 2
//!     attributes:
//!       vpc_id: ${vpc.id}
//!       cidr_block: 10.0.${count.index}.0/24
//!
//! outputs:
//!   subnet_ids: ${subnet[*].id}
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, PlanConfig};
pub use error::{Result, TierformError};
pub use planner::{DependencyGraph, DiffEngine, OutputResolver, Plan, PlanExecutor};
pub use provider::{HttpProvider, Provider, SimulatedProvider};
pub use reconciler::{Reconciler, RunReport};
pub use state::{LocalStateStore, S3StateStore, StateSnapshot, StateStore};
