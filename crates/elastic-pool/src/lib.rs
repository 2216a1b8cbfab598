//! elastic-pool — the authoritative worker registry.
//!
//! Workers live in exactly one of three sets:
//!
//! - **static**: fixed resources that are never destroyed
//! - **critical**: dynamic resources needed to keep some task type runnable
//! - **non-critical**: dynamic resources that may be destroyed freely
//!
//! The pool also keeps, per task type, the compatible workers and the
//! pool-wide number of simultaneous instances.

pub mod error;
pub mod pool;

pub use error::{PoolError, PoolResult};
pub use pool::{PoolState, PoolWorker, ResourcePool, WorkerKind, WorkerState};
