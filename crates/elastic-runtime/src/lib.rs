//! elastic-runtime — the scheduler session and its optimizers.
//!
//! - **`session`**: `ElasticSession`, the context every component works
//!   through: catalog, action board, worker pool, provider manager and
//!   one actor per worker
//! - **`schedule_optimizer`**: periodic load balancing that migrates
//!   pending actions off the most committed workers
//! - **`configuration`**: configuration costs, the fleet simulation and
//!   the goal-specific comparators
//! - **`resource_optimizer`**: periodic elasticity decisions: add an
//!   instance, remove a component, or leave the fleet alone
//!
//! ```text
//!   task engine ──submit/notify──► ElasticSession ──► WorkerHandle (per worker)
//!        ▲                            │    │
//!        └──────── LaunchEvent ───────┘    ├──► ResourcePool
//!                                          └──► ElasticProviderManager
//!
//!   ScheduleOptimizer ──migrate──► ElasticSession
//!   ResourceOptimizer ──request_creation / reduce_worker──► ElasticSession
//! ```

pub mod configuration;
pub mod error;
pub mod resource_optimizer;
pub mod schedule_optimizer;
pub mod session;

pub use configuration::{
    improves_cost, improves_energy, improves_time, is_acceptable, select_best_action, simulate, Budgets,
    ConfigurationCost, SimResource,
};
pub use error::{RuntimeError, RuntimeResult};
pub use resource_optimizer::{Candidate, PolicyOutcome, ResourceOptimizer};
pub use schedule_optimizer::{Migration, ScheduleOptimizer};
pub use session::{ElasticSession, LaunchEvent, Reduction, SessionState};
