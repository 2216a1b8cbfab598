//! elastic-scheduler — per-worker timeline scheduling.
//!
//! Each worker keeps a gap timeline: time-ordered pieces of capacity that
//! are free now or become free when their origin action ends. Actions are
//! placed by consuming gaps and leave a gap of their own behind.
//!
//! - **`gap`**: the `GapTimeline` and its allocation primitives
//! - **`scheduler`**: `ResourceScheduler`: placement, removal, scores,
//!   accounting and the three-phase local optimization
//! - **`simulation`**: the pure discrete-event replay behind local
//!   optimization
//! - **`board`**: `ActionBoard`, the shared expected-timing table
//! - **`worker`**: `WorkerHandle`, the actor that owns one scheduler
//!
//! ```text
//!   caller ──► WorkerHandle ──mpsc──► actor ──► ResourceScheduler ──► GapTimeline
//!                                       │                │
//!                                       │ spawn_blocking └──► ActionBoard (shared)
//!                                       ▼
//!                                 simulate_local
//! ```

pub mod action;
pub mod board;
pub mod error;
pub mod gap;
pub mod scheduler;
pub mod simulation;
pub mod worker;

pub use action::{selection_order, ActionId, ActionState, BlockReason, PlacementResult, SchedulableAction};
pub use board::{ActionBoard, ActionTiming};
pub use error::{SchedulerError, SchedulerResult};
pub use gap::{Gap, GapTimeline};
pub use scheduler::{
    Accounting, DonationCandidate, ImplementationStats, OptimizationReport, ResourceScheduler, ScheduledEntry,
    WorkerSnapshot,
};
pub use simulation::{simulate_local, OptimizationInput, OptimizationOutcome, SimAction, SimPlacement};
pub use worker::{CapacityChange, WorkerCommand, WorkerHandle};
