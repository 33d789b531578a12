//! Job processing.
//!
//! - [`Worker`]: processing loops with graceful shutdown
//! - [`LeaseManager`]: lock renewal for jobs held by this process
//! - [`StalledSweeper`]: recovery of jobs whose worker died

pub mod lease;
pub mod pool;
pub mod stalled;

pub use lease::{LeaseManager, LockExtender};
pub use pool::{Processor, Worker, WorkerConfig, WorkerError, WorkerStats};
pub use stalled::{
    StalledSweeper, SweepReport, STALLED_FAILURE_REASON, SUPERSEDED_FAILURE_REASON,
};
