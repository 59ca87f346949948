//! Planning module for converge runs.
//!
//! This module handles the comparison between desired configuration and
//! recorded state, producing per-instance changes ordered in a dependency
//! graph.

mod change;
mod diff;
mod graph;
mod plan;

pub use change::{Action, AttributeChange, Change, ReplaceReason, SENSITIVE_MASK};
pub use diff::{DiffEngine, DiffRequest};
pub use graph::{DependencyGraph, GraphNode, NodeId, NodePhase};
pub use plan::{Plan, PlanMode, PlanRequest, PlanSummary, Planner};
