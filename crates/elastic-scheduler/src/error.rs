//! Scheduler error types.

use thiserror::Error;

use crate::action::ActionId;

/// Protocol violations surfaced to the caller. Lack of capacity is not an
/// error; it is reported through `PlacementResult`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("action {0} is not scheduled on this worker")]
    ActionNotFound(ActionId),

    #[error("action {0} is already scheduled on this worker")]
    AlreadyScheduled(ActionId),

    #[error("worker {worker} cannot host implementation {impl_id} of core {core_id}")]
    NotHostable {
        worker: String,
        core_id: u32,
        impl_id: u32,
    },

    #[error("local optimization already in progress on {0}")]
    OptimizationInProgress(String),

    #[error("no local optimization in progress on {0}")]
    NoOptimization(String),

    #[error("worker {0} is gone")]
    WorkerGone(String),
}

/// Result alias for scheduler operations.
pub type SchedulerResult<T> = Result<T, SchedulerError>;
