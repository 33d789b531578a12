//! Storage backends.
//!
//! Every multi-step state change runs as an optimistic transaction:
//!
//! ```text
//!   begin() ──► reads ──► stage(write)* ──► commit() ─┬─► true: applied
//!                                                      └─► false: conflict, retry
//! ```
//!
//! All reads of a transaction happen before its writes, and staged writes are
//! not visible to later reads of the same transaction. Redis implements this
//! with `WATCH`/`MULTI`/`EXEC` on a dedicated connection; the in-memory store
//! holds a mutex for the lifetime of the transaction and never conflicts.
//!
//! Callers wrap their read-then-write logic in [`atomically!`], which retries
//! conflicted commits up to [`MAX_TXN_ATTEMPTS`] times.

use async_trait::async_trait;

use crate::error::QueueError;
use crate::events::QueueEvent;
use crate::repeat::{JobSchedulerRecord, StoredScheduler};

use super::job::{Job, JobState};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

/// Commit attempts before giving up with `QueueError::Contention`.
pub const MAX_TXN_ATTEMPTS: u32 = 16;

/// A write staged inside a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    /// Replaces the job record and files it under its state with `score`.
    PutJob { job: Job, score: i64 },
    /// Deletes the job record, its lock and every state entry.
    DeleteJob { id: String },
    /// Replaces the scheduler record and indexes it by its next occurrence.
    PutScheduler(JobSchedulerRecord),
    /// Adds a bare legacy entry to the repeat index.
    IndexLegacyScheduler { key: String, next: i64 },
    /// Deletes a repeat index member and its record, if any.
    DeleteScheduler { member: String },
    SetLock {
        job_id: String,
        token: String,
        ttl_ms: u64,
    },
    DeleteLock { job_id: String },
    /// Sets a named marker that expires after `ttl_ms`.
    SetMarker { name: String, ttl_ms: u64 },
    /// Publishes an event on the global stream.
    Emit(QueueEvent),
}

impl Write {
    /// Files the job under its state using the state's natural score.
    pub fn put_job(job: Job) -> Self {
        let score = match job.state {
            JobState::Delayed => job.ready_at(),
            JobState::Active => job.processed_on.unwrap_or(job.timestamp),
            JobState::Completed | JobState::Failed => job.finished_on.unwrap_or(job.timestamp),
            _ => job.timestamp,
        };
        Write::PutJob { job, score }
    }
}

/// A backend holding jobs, locks, schedulers and events for one queue.
#[async_trait]
pub trait Store: Send + Sync + std::fmt::Debug {
    /// Opens a transaction.
    async fn begin(&self) -> Result<Box<dyn Txn>, QueueError>;

    /// Reads up to `count` global events published after the cursor `after`
    /// (from the start when `None`), returning each with its cursor.
    async fn read_events(
        &self,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, QueueEvent)>, QueueError>;
}

/// An open transaction.
#[async_trait]
pub trait Txn: Send {
    async fn job(&mut self, id: &str) -> Result<Option<Job>, QueueError>;

    /// Token of the live lock on `job_id`, if any.
    async fn lock_token(&mut self, job_id: &str) -> Result<Option<String>, QueueError>;

    /// Up to `limit` job ids in `state`, lowest score first.
    async fn jobs_in(&mut self, state: JobState, limit: usize) -> Result<Vec<String>, QueueError>;

    /// Up to `limit` job ids in `state` with a score of at most `max_score`.
    async fn jobs_due(
        &mut self,
        state: JobState,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError>;

    async fn count_in(&mut self, state: JobState) -> Result<usize, QueueError>;

    /// Looks up a repeat index member, structured or legacy.
    async fn scheduler(&mut self, member: &str) -> Result<Option<StoredScheduler>, QueueError>;

    /// Schedulers ranked by next occurrence; `start` and `end` are inclusive
    /// ranks and may be negative to count from the end.
    async fn schedulers(
        &mut self,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<StoredScheduler>, QueueError>;

    async fn scheduler_count(&mut self) -> Result<usize, QueueError>;

    async fn marker_exists(&mut self, name: &str) -> Result<bool, QueueError>;

    /// Stages a write, applied only on a successful commit.
    fn stage(&mut self, write: Write);

    /// Applies staged writes atomically. Returns `false` when a concurrent
    /// writer touched something this transaction read.
    async fn commit(self: Box<Self>) -> Result<bool, QueueError>;
}

/// Runs `$body` against a fresh transaction and commits it, retrying the
/// whole block when the commit conflicts. The block evaluates to the value
/// of the macro; `return` and `?` inside it leave the enclosing function
/// without committing.
macro_rules! atomically {
    ($store:expr, |$tx:ident| $body:block) => {{
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            #[allow(unused_mut)]
            let mut $tx = $store.begin().await?;
            let outcome = $body;
            if $tx.commit().await? {
                break outcome;
            }
            if attempt >= $crate::queue::store::MAX_TXN_ATTEMPTS {
                return Err($crate::error::QueueError::Contention { attempts: attempt }.into());
            }
            tracing::debug!(attempt, "transaction conflicted, retrying");
        }
    }};
}

pub(crate) use atomically;

/// Resolves Redis-style inclusive ranks against a list of `len` items.
pub(crate) fn rank_range(len: usize, start: isize, end: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let end = if end < 0 { len + end } else { end.min(len - 1) };
    if len == 0 || start > end || start >= len {
        return None;
    }
    Some((start as usize, end as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobOptions;

    #[test]
    fn test_rank_range() {
        assert_eq!(rank_range(5, 0, -1), Some((0, 4)));
        assert_eq!(rank_range(5, 1, 2), Some((1, 2)));
        assert_eq!(rank_range(5, -2, -1), Some((3, 4)));
        assert_eq!(rank_range(5, 3, 100), Some((3, 4)));
        assert_eq!(rank_range(5, 6, 8), None);
        assert_eq!(rank_range(0, 0, -1), None);
        assert_eq!(rank_range(3, 2, 1), None);
    }

    #[test]
    fn test_put_job_scores() {
        let job = Job::new(
            "d",
            "x",
            serde_json::Value::Null,
            JobOptions::default().with_delay(250),
            1_000,
        );
        match Write::put_job(job) {
            Write::PutJob { score, .. } => assert_eq!(score, 1_250),
            other => panic!("unexpected write {:?}", other),
        }

        let mut job = Job::new("a", "x", serde_json::Value::Null, JobOptions::default(), 1_000);
        job.state = JobState::Active;
        job.processed_on = Some(2_000);
        match Write::put_job(job) {
            Write::PutJob { score, .. } => assert_eq!(score, 2_000),
            other => panic!("unexpected write {:?}", other),
        }
    }
}
