//! Job schedulers.
//!
//! A job scheduler turns a recurrence (a cron pattern or a fixed interval)
//! into a chain of jobs, one pending job at a time:
//!
//! 1. [`RecurrenceCalculator`] computes occurrences.
//! 2. [`SchedulerStore`] persists scheduler records and writes each
//!    occurrence's job atomically with the record.
//! 3. [`SchedulerContinuation`] writes the next job when the current one
//!    completes or fails, retrying transient store failures.

pub mod continuation;
pub mod record;
pub mod recurrence;
pub mod store;

pub use continuation::{ContinuationConfig, FinishOutcome, SchedulerContinuation};
pub use record::{parse_legacy_key, JobSchedulerRecord, JobTemplate, StoredScheduler};
pub use recurrence::{CronStrategy, RecurrenceCalculator, RepeatOptions, RepeatStrategy};
pub use store::SchedulerStore;
