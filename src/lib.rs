//! recurq: Redis-backed job queue with recurring job schedulers.
//!
//! A job scheduler turns a cron pattern or a fixed interval into a chain of
//! jobs, keeping exactly one pending job per scheduler. Workers hold jobs
//! through renewable locks, and jobs whose worker died are detected by a
//! periodic stalled job sweep.
//!
//! ```ignore
//! use recurq::{JobTemplate, Queue, RepeatOptions};
//!
//! let queue = Queue::connect("redis://127.0.0.1:6379", "recurq", "mail").await?;
//! queue
//!     .upsert_job_scheduler(
//!         "digest",
//!         RepeatOptions::pattern("0 9 * * *").with_tz("Europe/Paris"),
//!         "send-digest",
//!         JobTemplate::default(),
//!     )
//!     .await?;
//! ```

pub mod cli;
pub mod clock;
pub mod error;
pub mod events;
pub mod metrics;
pub mod observability;
pub mod queue;
pub mod repeat;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{QueueError, SchedulerError};
pub use events::{EventBus, QueueEvent};
pub use queue::{
    FlowCollaborator, Job, JobOptions, JobOutcome, JobState, MemoryStore, Queue, RedisStore,
    RemoveOnFinish, Store,
};
pub use repeat::{
    JobSchedulerRecord, JobTemplate, RecurrenceCalculator, RepeatOptions, RepeatStrategy,
    SchedulerContinuation,
};
pub use worker::{LeaseManager, LockExtender, Processor, StalledSweeper, Worker, WorkerConfig};
