//! State persistence for the converge engine.
//!
//! This module holds the recorded state of every managed resource instance,
//! the synchronized working copy used during a run, and the backends that
//! persist snapshots and coordinate the exclusive state lock.

mod local;
mod lock;
mod memory;
mod s3;
mod store;
mod types;
mod working;

pub use local::LocalStateStore;
pub use lock::{LockInfo, STALE_LOCK_SECS, acquire_with_wait, generate_holder_id};
pub use memory::MemoryStateStore;
pub use s3::S3StateStore;
pub use store::{StateStore, next_snapshot};
pub use types::{
    HistoryEntry, InstanceStatus, MAX_HISTORY, ResourceInstanceState, RunOperation, STATE_VERSION,
    StateSnapshot,
};
pub use working::WorkingState;
