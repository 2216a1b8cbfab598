//! Error types for the worker pool.

use thiserror::Error;

pub type PoolResult<T> = Result<T, PoolError>;

/// Errors raised by the resource pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("worker already registered: {0}")]
    DuplicateWorker(String),

    #[error("worker {0} is static and cannot be resized")]
    NotDynamic(String),
}
