//! Core error types.

use thiserror::Error;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised while loading configuration or resolving catalog entries.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("unknown core: {0}")]
    UnknownCore(u32),

    #[error("unknown implementation {impl_id} for core {core_id}")]
    UnknownImplementation { core_id: u32, impl_id: u32 },

    #[error("invalid profile record: {0}")]
    InvalidRecord(#[from] serde_json::Error),
}
