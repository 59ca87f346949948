//! Apply engine.
//!
//! The [`Walker`] schedules graph nodes onto a bounded pool, the
//! [`ApplyExecutor`] runs one provider operation per node and the
//! [`RetryPolicy`] wraps each call with timeout and backoff.

mod events;
mod executor;
pub mod poll;
mod retry;
mod walker;

pub use events::{NodeStatus, ProgressEvent, ProgressHook, TracingHook};
pub use executor::ApplyExecutor;
pub use poll::{PollError, PollOptions, poll_until};
pub use retry::RetryPolicy;
pub use walker::{CancelSignal, NodeReport, WalkResult, Walker};
