//! Error types for the scheduler session and its optimizers.

use thiserror::Error;

use elastic_core::{CoreError, CoreId};
use elastic_pool::PoolError;
use elastic_provider::ProviderError;
use elastic_scheduler::{ActionId, SchedulerError};

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors surfaced by the session and the optimizers.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("unknown action: {0}")]
    UnknownAction(ActionId),

    #[error("action already submitted: {0}")]
    DuplicateAction(ActionId),

    #[error("no worker can run core {0}")]
    NoCompatibleWorker(CoreId),

    #[error("worker {0} is not elastic")]
    NotElastic(String),
}
