//! elastic-core — shared model for the elastic scheduling core.
//!
//! Everything the schedulers, the worker pool, the provider manager and
//! the optimizers agree on lives here:
//!
//! - **`resources`**: `Capacity` (the divisible part of a description)
//!   and the `ResourceDescription` tagged union (method, service, cloud)
//! - **`task`**: task types ("cores"), implementation variants and the
//!   growable `CoreCatalog`
//! - **`profile`**: execution statistics and their key/value records
//! - **`score`**: comparable placement scores
//! - **`config`**: `elastic.toml` parsing and validation
//!
//! # Units
//!
//! ```text
//! time      i64 milliseconds (NEVER = i64::MAX)
//! power     watts; power * ms = millijoules
//! price     currency per hour; price * ms = currency * 3.6e6
//! budgets   seconds, watt-hours, currency, watts, currency per hour
//! ```

pub mod config;
pub mod error;
pub mod profile;
pub mod resources;
pub mod score;
pub mod task;

pub use config::{ElasticConfig, ElasticityConfig, IdleDefaults, OptimizationConfig, OptimizationGoal};
pub use error::{CoreError, CoreResult};
pub use profile::{Profile, ProfileRecord, WorkerRecord};
pub use resources::{
    Capacity, CloudResources, MethodResources, ResourceDescription, ServiceResources, TypeComponent,
};
pub use score::{MoScore, Score};
pub use task::{CoreCatalog, CoreDefinition, CoreId, ImplId, Implementation};

/// Milliseconds on a worker timeline.
pub type Timestamp = i64;

/// A time that is never reached.
pub const NEVER: Timestamp = i64::MAX;

/// Unbounded start of a worker's initial free interval.
pub const ORIGIN: Timestamp = i64::MIN;
