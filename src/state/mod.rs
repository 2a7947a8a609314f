//! State management module for the Tierform engine.
//!
//! This module provides persistent storage of the realized resource
//! inventory between runs, with locking so concurrent runs are serialized.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LOCK_REFRESH_INTERVAL, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::StateStore;
pub use types::{
    MAX_HISTORY, ResourceState, ResourceStatus, RunHistoryEntry, RunOperation, STATE_VERSION, StateSnapshot,
};
