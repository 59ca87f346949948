//! Node progress events.
//!
//! The walker reports every node transition to a [`ProgressHook`]. Hooks
//! only observe; rendering is left to the caller.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::address::ResourceAddress;
use crate::planner::Action;

/// Runtime status of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Waiting for dependencies.
    Pending,
    /// All dependencies complete.
    Ready,
    /// Operation in flight.
    Running,
    /// Finished successfully.
    Complete,
    /// Operation failed.
    Errored,
    /// Never run because a dependency failed or the walk was cancelled.
    Skipped,
}

/// One node transition.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Node address.
    pub address: ResourceAddress,
    /// Planned action.
    pub action: Action,
    /// New status.
    pub status: NodeStatus,
    /// Time spent running, for finished nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
    /// Error text, for errored and skipped nodes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Receives node transitions.
pub trait ProgressHook: Send + Sync {
    /// Called once per transition, from the walker's coordinating task.
    fn on_event(&self, event: &ProgressEvent);
}

/// Hook that logs transitions with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHook;

impl NodeStatus {
    /// Returns true for terminal statuses.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Complete | Self::Errored | Self::Skipped)
    }
}

impl ProgressEvent {
    /// Event without duration or error.
    #[must_use]
    pub const fn new(address: ResourceAddress, action: Action, status: NodeStatus) -> Self {
        Self {
            address,
            action,
            status,
            duration: None,
            error: None,
        }
    }
}

impl ProgressHook for TracingHook {
    fn on_event(&self, event: &ProgressEvent) {
        let address = &event.address;
        let action = event.action;
        match event.status {
            NodeStatus::Pending | NodeStatus::Ready => {
                debug!(address = %address, action = %action, status = %event.status, "Node waiting");
            }
            NodeStatus::Running => info!(address = %address, action = %action, "Starting {action}"),
            NodeStatus::Complete => {
                let elapsed = event.duration.unwrap_or_default();
                info!(address = %address, action = %action, "Completed {action} after {elapsed:?}");
            }
            NodeStatus::Errored => error!(
                address = %address,
                action = %action,
                "Failed: {}",
                event.error.as_deref().unwrap_or("unknown error")
            ),
            NodeStatus::Skipped => warn!(
                address = %address,
                action = %action,
                "Skipped: {}",
                event.error.as_deref().unwrap_or("walk stopped")
            ),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Errored => "errored",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}
