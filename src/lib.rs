// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(missing_docs)]                // All public items must be documented
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden

// Clippy lints (warnings only)
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
//! A state-diff and execution-graph engine for declarative infrastructure.
//!
//! ## Overview
//!
//! Converge reads a desired configuration, compares it with the recorded
//! state of every managed object, and drives providers until the real
//! world matches:
//!
//! - Declare resources, data sources and inline modules in `converge.yaml`
//! - Preview every create, update, replace and delete as a plan
//! - Apply the plan as a dependency graph with bounded parallelism
//! - Persist state atomically behind an exclusive lock (local file or S3)
//!
//! ## Architecture
//!
//! 1. **Configuration**: parsed, validated and expanded into instances
//! 2. **Planner**: diffs each instance against state under its schema
//! 3. **Graph**: orders changes, deletes after their dependents
//! 4. **Walker**: applies nodes concurrently, retries, cancels, re-plans
//! 5. **State**: a synchronized working copy written back after each run
//!
//! ## Modules
//!
//! - [`value`]: Attribute values, paths and unknowns
//! - [`address`]: Resource instance addresses
//! - [`provider`]: Provider interface, schemas and built-in providers
//! - [`config`]: Configuration parsing, validation and expansion
//! - [`state`]: State snapshots, locking and storage backends
//! - [`planner`]: Diff computation and the dependency graph
//! - [`engine`]: Graph walker, executor and retry policy
//! - [`orchestrator`]: Plan, apply, refresh, import and state commands
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: my-project
//!
//! resources:
//!   - type: local_file
//!     name: motd
//!     count: 2
//!     attributes:
//!       filename: "out/motd-${count.index}.txt"
//!       content: "hello"
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod address;
pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod planner;
pub mod provider;
pub mod state;
pub mod value;

#[cfg(test)]
mod testing;

// ============================================================================
// Re-exports
// ============================================================================

pub use address::ResourceAddress;
pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use context::EngineContext;
pub use engine::{CancelSignal, RetryPolicy, Walker};
pub use error::{ConvergeError, Result};
pub use orchestrator::{Orchestrator, RunOptions, RunReport};
pub use planner::{Action, Change, DependencyGraph, Plan, PlanMode, Planner};
pub use provider::{Provider, ProviderRegistry};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateSnapshot, StateStore};
pub use value::{AttrPath, Value};
