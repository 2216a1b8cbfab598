//! Error types for elastic providers.

use thiserror::Error;

use crate::connector::ConnectorError;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by providers and the provider manager.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {provider} has no instance type {type_name}")]
    UnknownType { provider: String, type_name: String },

    #[error("provider {provider} has no image {image}")]
    UnknownImage { provider: String, image: String },

    #[error("provider already registered: {0}")]
    DuplicateProvider(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error("creation request {0} is not pending")]
    RequestNotPending(u64),

    #[error("no provider hosts worker {0}")]
    UnknownVm(String),
}
