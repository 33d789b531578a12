//! Jobs, their storage and the queue facade.
//!
//! - [`job`]: job record, options and states
//! - [`keys`]: Redis key layout and scheduler job ids
//! - [`store`]: transactional storage backends (Redis, in-memory)
//! - [`flow`]: parent/child failure hooks
//! - [`Queue`]: producer and worker operations

pub mod flow;
pub mod job;
pub mod keys;
#[allow(clippy::module_inception)]
mod queue;
pub mod store;

pub use flow::{FlowCollaborator, NoopFlow};
pub use job::{
    Job, JobOptions, JobOutcome, JobState, ParentFailurePolicy, ParentRef, RemoveOnFinish,
};
pub use keys::{scheduler_job_id, QueueKeys, DEFAULT_PREFIX, STALLED_CHECK_MARKER};
pub use queue::Queue;
pub use store::{MemoryStore, RedisStore, Store, Txn, Write};
