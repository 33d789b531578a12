//! Atomic storage of job schedulers and their companion jobs.
//!
//! A scheduler owns at most one pending job at a time. Its id is derived
//! from the occurrence it stands for (`repeat:<schedulerId>:<millis>`), so
//! two processes computing the same occurrence race for the same id instead
//! of creating duplicates. Every operation below reads and writes inside one
//! store transaction.
//!
//! # Slot collisions
//!
//! When the computed id is already taken:
//!
//! - by a job of another scheduler (or a plain job): `JobIdCollision`
//! - by this scheduler's pending job: the job is replaced in place
//! - by this scheduler's active, finished or deferred job: `every` schedulers move on
//!   to the following slot (`SlotsBusy` if that one is taken too), pattern
//!   schedulers report `JobIdCollision`

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::SchedulerError;
use crate::events::QueueEvent;
use crate::metrics::MetricsCollector;
use crate::queue::keys::scheduler_job_id;
use crate::queue::store::{atomically, Store, Txn, Write};
use crate::queue::Job;

use super::record::{JobSchedulerRecord, JobTemplate, StoredScheduler};
use super::recurrence::{RecurrenceCalculator, RepeatOptions};

/// Occurrence chosen for the next companion job.
#[derive(Debug)]
struct Slot {
    next: i64,
    job_id: String,
    /// The id is held by this scheduler's pending job, which gets replaced.
    replaces: bool,
}

/// Where upsert takes the schedule from.
#[derive(Debug)]
struct Plan {
    next: i64,
    iteration_count: u32,
    offset: i64,
}

/// Persistent job schedulers of one queue.
#[derive(Debug, Clone)]
pub struct SchedulerStore {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    calculator: Arc<RecurrenceCalculator>,
    queue_name: String,
    metrics: MetricsCollector,
}

impl SchedulerStore {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        calculator: Arc<RecurrenceCalculator>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            clock,
            calculator,
            queue_name: queue_name.into(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn calculator(&self) -> &RecurrenceCalculator {
        &self.calculator
    }

    /// Creates or updates the scheduler `scheduler_id` and writes its next
    /// companion job.
    ///
    /// With the same recurrence shape the iteration count and phase are kept:
    /// a pending companion is rescheduled (an `every` companion keeps its
    /// slot and is replaced in place), an active companion is left to finish
    /// and the new job takes the occurrence after it. A new scheduler or a
    /// changed shape restarts the count, and `every` schedulers run at once.
    ///
    /// # Arguments
    ///
    /// * `scheduler_id` - Stable id of the scheduler
    /// * `repeat` - Recurrence options
    /// * `name` - Name of every produced job
    /// * `template` - Data and options copied onto every produced job
    ///
    /// # Returns
    ///
    /// The companion job, or `None` when the recurrence has no further
    /// occurrence (nothing is written then).
    ///
    /// # Errors
    ///
    /// - Configuration errors before storage is touched
    /// - `EndDateInPast` when `end_date` is not after now
    /// - `JobIdCollision` / `SlotsBusy` when the computed slot is taken
    pub async fn upsert(
        &self,
        scheduler_id: &str,
        repeat: RepeatOptions,
        name: &str,
        template: JobTemplate,
    ) -> Result<Option<Job>, SchedulerError> {
        self.calculator.validate(&repeat, name)?;
        let now = self.clock.now_millis();
        if repeat.end_date.is_some_and(|end| end <= now) {
            return Err(SchedulerError::EndDateInPast);
        }

        let job = atomically!(self.store, |tx| {
            let existing = tx
                .scheduler(scheduler_id)
                .await?
                .map(StoredScheduler::into_record);
            let pending = match existing {
                Some(ref record) => pending_companion(&mut *tx, record).await?,
                None => None,
            };

            let plan = match existing.as_ref().filter(|r| r.same_shape(&repeat)) {
                None => {
                    let opts = repeat.clone().with_count(0);
                    let Some(next) = self.calculator.first_occurrence(now, &opts, name)? else {
                        return Ok(None);
                    };
                    let offset = repeat
                        .every
                        .map_or(0, |every| repeat.offset.unwrap_or(next).rem_euclid(every));
                    Plan {
                        next,
                        iteration_count: 1,
                        offset,
                    }
                }
                Some(record) if pending.is_some() => {
                    let opts = RepeatOptions {
                        offset: Some(record.offset),
                        count: record.iteration_count.saturating_sub(1),
                        ..repeat.clone()
                    };
                    let next = match repeat.every {
                        Some(_) => Some(record.next).filter(|at| opts.admits(*at)),
                        None => self.calculator.next(now, &opts, name)?,
                    };
                    let Some(next) = next else {
                        return Ok(None);
                    };
                    Plan {
                        next,
                        iteration_count: record.iteration_count,
                        offset: record.offset,
                    }
                }
                Some(record) => {
                    let opts = RepeatOptions {
                        offset: Some(record.offset),
                        count: record.iteration_count,
                        immediately: false,
                        ..repeat.clone()
                    };
                    let Some(next) = self.calculator.next(now.max(record.next), &opts, name)?
                    else {
                        return Ok(None);
                    };
                    Plan {
                        next,
                        iteration_count: record.iteration_count + 1,
                        offset: record.offset,
                    }
                }
            };

            let slot = claim_slot(
                &mut *tx,
                scheduler_id,
                plan.next,
                repeat.every,
                repeat.end_date,
            )
            .await?;

            if let Some(old) = pending.filter(|p| p.id != slot.job_id) {
                tx.stage(Write::DeleteJob { id: old.id.clone() });
                tx.stage(Write::Emit(QueueEvent::Removed { job_id: old.id }));
            }

            let record = JobSchedulerRecord {
                key: scheduler_id.to_string(),
                name: name.to_string(),
                pattern: repeat.pattern.clone(),
                every: repeat.every,
                tz: repeat.tz.clone(),
                utc: repeat.utc,
                start_date: repeat.start_date,
                end_date: repeat.end_date,
                limit: repeat.limit,
                offset: plan.offset,
                iteration_count: plan.iteration_count,
                next: slot.next,
                template: template.clone(),
            };
            tx.stage(Write::PutScheduler(record.clone()));
            Some(stage_iteration(&mut *tx, &record, &slot, now))
        });

        if let Some(ref job) = job {
            self.metrics.record_scheduler_upsert(&self.queue_name);
            info!(
                queue = %self.queue_name,
                scheduler_id = scheduler_id,
                job_id = %job.id,
                delay = job.delay,
                "Job scheduler upserted"
            );
        }
        Ok(job)
    }

    /// Writes the companion that follows the job at `finished_slot`.
    ///
    /// Does nothing when the scheduler is gone or already points at another
    /// slot, so calling it twice for the same slot is harmless. Deletes the
    /// scheduler when its recurrence is exhausted.
    pub async fn advance(
        &self,
        scheduler_id: &str,
        finished_slot: i64,
    ) -> Result<Option<Job>, SchedulerError> {
        let now = self.clock.now_millis();

        let job = atomically!(self.store, |tx| {
            let Some(StoredScheduler::Structured(record)) = tx.scheduler(scheduler_id).await?
            else {
                return Ok(None);
            };
            if record.next != finished_slot {
                debug!(
                    scheduler_id = scheduler_id,
                    slot = finished_slot,
                    next = record.next,
                    "Scheduler already moved past this slot"
                );
                return Ok(None);
            }

            let opts = record.repeat_options();
            match self
                .calculator
                .following_occurrence(now, finished_slot, &opts, &record.name)?
            {
                None => {
                    tx.stage(Write::DeleteScheduler {
                        member: record.key.clone(),
                    });
                    None
                }
                Some(next) => {
                    let slot = claim_slot(
                        &mut *tx,
                        scheduler_id,
                        next,
                        record.every,
                        record.end_date,
                    )
                    .await?;
                    let record = JobSchedulerRecord {
                        next: slot.next,
                        iteration_count: record.iteration_count + 1,
                        ..record
                    };
                    tx.stage(Write::PutScheduler(record.clone()));
                    Some(stage_iteration(&mut *tx, &record, &slot, now))
                }
            }
        });

        match job {
            Some(ref job) => debug!(
                queue = %self.queue_name,
                scheduler_id = scheduler_id,
                job_id = %job.id,
                "Scheduled next iteration"
            ),
            None => debug!(
                queue = %self.queue_name,
                scheduler_id = scheduler_id,
                "No further iteration scheduled"
            ),
        }
        Ok(job)
    }

    /// Removes a scheduler and its pending companion. An active companion, or
    /// one holding a deferred outcome, is left to finish. Returns `false` when
    /// the scheduler does not exist.
    pub async fn remove(&self, scheduler_id: &str) -> Result<bool, SchedulerError> {
        self.remove_member(scheduler_id).await
    }

    /// Removes a scheduler by its repeat index member, which is the id for
    /// current schedulers and the packed key for legacy ones.
    pub async fn remove_by_key(&self, key: &str) -> Result<bool, SchedulerError> {
        self.remove_member(key).await
    }

    async fn remove_member(&self, member: &str) -> Result<bool, SchedulerError> {
        let removed = atomically!(self.store, |tx| {
            match tx.scheduler(member).await? {
                None => false,
                Some(stored) => {
                    if let StoredScheduler::Structured(ref record) = stored {
                        if let Some(job) = pending_companion(&mut *tx, record).await? {
                            tx.stage(Write::DeleteJob { id: job.id.clone() });
                            tx.stage(Write::Emit(QueueEvent::Removed { job_id: job.id }));
                        }
                    }
                    tx.stage(Write::DeleteScheduler {
                        member: member.to_string(),
                    });
                    true
                }
            }
        });

        if removed {
            info!(queue = %self.queue_name, scheduler = member, "Job scheduler removed");
        }
        Ok(removed)
    }

    /// Returns the scheduler, normalizing legacy entries.
    pub async fn get(&self, scheduler_id: &str) -> Result<Option<JobSchedulerRecord>, SchedulerError> {
        let stored = atomically!(self.store, |tx| { tx.scheduler(scheduler_id).await? });
        Ok(stored.map(StoredScheduler::into_record))
    }

    /// Schedulers ranked by next occurrence between the inclusive ranks
    /// `start` and `end` (negative ranks count from the end).
    pub async fn list(
        &self,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<JobSchedulerRecord>, SchedulerError> {
        let stored = atomically!(self.store, |tx| { tx.schedulers(start, end, asc).await? });
        Ok(stored.into_iter().map(StoredScheduler::into_record).collect())
    }

    pub async fn count(&self) -> Result<usize, SchedulerError> {
        let count = atomically!(self.store, |tx| { tx.scheduler_count().await? });
        Ok(count)
    }
}

/// The record's current companion, if it is still pending.
async fn pending_companion(
    tx: &mut dyn Txn,
    record: &JobSchedulerRecord,
) -> Result<Option<Job>, SchedulerError> {
    let job = tx.job(&scheduler_job_id(&record.key, record.next)).await?;
    Ok(job.filter(|job| is_pending_companion(job, &record.key)))
}

/// A job of `scheduler_id` that has not run yet. A delayed job carrying a
/// deferred outcome already ran and must not be replaced or dropped.
fn is_pending_companion(job: &Job, scheduler_id: &str) -> bool {
    job.scheduler_key.as_deref() == Some(scheduler_id)
        && job.state.is_pending()
        && job.deferred.is_none()
}

/// Picks the id for the occurrence at `next`, applying the collision rules.
async fn claim_slot(
    tx: &mut dyn Txn,
    scheduler_id: &str,
    next: i64,
    every: Option<i64>,
    end_date: Option<i64>,
) -> Result<Slot, SchedulerError> {
    let job_id = scheduler_job_id(scheduler_id, next);
    let Some(occupant) = tx.job(&job_id).await? else {
        return Ok(Slot {
            next,
            job_id,
            replaces: false,
        });
    };

    if occupant.scheduler_key.as_deref() != Some(scheduler_id) {
        return Err(SchedulerError::JobIdCollision { job_id });
    }
    if is_pending_companion(&occupant, scheduler_id) {
        return Ok(Slot {
            next,
            job_id,
            replaces: true,
        });
    }

    let Some(every) = every else {
        return Err(SchedulerError::JobIdCollision { job_id });
    };
    let busy = || SchedulerError::SlotsBusy {
        scheduler_id: scheduler_id.to_string(),
    };
    let Some(next) = next.checked_add(every) else {
        return Err(busy());
    };
    if end_date.is_some_and(|end| next > end) {
        return Err(busy());
    }
    let job_id = scheduler_job_id(scheduler_id, next);
    match tx.job(&job_id).await? {
        None => Ok(Slot {
            next,
            job_id,
            replaces: false,
        }),
        Some(job) if is_pending_companion(&job, scheduler_id) => Ok(Slot {
            next,
            job_id,
            replaces: true,
        }),
        Some(_) => Err(busy()),
    }
}

/// Stages the companion job for `slot` and its events.
fn stage_iteration(tx: &mut dyn Txn, record: &JobSchedulerRecord, slot: &Slot, now: i64) -> Job {
    let delay = (slot.next - now).max(0);
    let mut opts = record.template.opts.clone();
    opts.job_id = None;

    let mut job = Job::new(
        slot.job_id.clone(),
        record.name.clone(),
        record.template.data.clone(),
        opts.with_delay(delay),
        now,
    );
    job.scheduler_key = Some(record.key.clone());

    if slot.replaces {
        tx.stage(Write::Emit(QueueEvent::Duplicated {
            job_id: job.id.clone(),
        }));
    }
    tx.stage(Write::put_job(job.clone()));
    tx.stage(Write::Emit(if delay > 0 {
        QueueEvent::Delayed {
            job_id: job.id.clone(),
            delay,
        }
    } else {
        QueueEvent::Waiting {
            job_id: job.id.clone(),
        }
    }));
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::store::MemoryStore;
    use crate::queue::{JobOptions, JobState};

    const NOW: i64 = 1_700_000_000_000;

    fn scheduler_store() -> (SchedulerStore, MemoryStore, ManualClock) {
        let clock = ManualClock::new(NOW);
        let memory = MemoryStore::new(Arc::new(clock.clone()));
        let schedulers = SchedulerStore::new(
            Arc::new(memory.clone()),
            Arc::new(clock.clone()),
            Arc::new(RecurrenceCalculator::new()),
            "unit",
        );
        (schedulers, memory, clock)
    }

    fn template() -> JobTemplate {
        JobTemplate::new(serde_json::json!({"k": "v"}), JobOptions::default())
    }

    #[tokio::test]
    async fn test_new_every_scheduler_runs_at_once() {
        let (schedulers, _, _) = scheduler_store();
        let job = schedulers
            .upsert("s1", RepeatOptions::every(60_000), "tick", template())
            .await
            .expect("upsert")
            .expect("job");

        assert_eq!(job.id, format!("repeat:s1:{}", NOW));
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.scheduler_key.as_deref(), Some("s1"));
        assert_eq!(job.data, serde_json::json!({"k": "v"}));

        let record = schedulers.get("s1").await.expect("get").expect("record");
        assert_eq!(record.iteration_count, 1);
        assert_eq!(record.next, NOW);
        assert_eq!(record.offset, NOW.rem_euclid(60_000));
    }

    #[tokio::test]
    async fn test_advance_is_idempotent_per_slot() {
        let (schedulers, _, clock) = scheduler_store();
        schedulers
            .upsert("s1", RepeatOptions::every(1_000), "tick", template())
            .await
            .expect("upsert");

        clock.advance(10);
        let next = schedulers.advance("s1", NOW).await.expect("advance").expect("job");
        assert_eq!(next.id, format!("repeat:s1:{}", NOW + 1_000));
        assert_eq!(next.state, JobState::Delayed);
        assert_eq!(next.delay, 990);

        assert!(schedulers.advance("s1", NOW).await.expect("advance").is_none());
        let record = schedulers.get("s1").await.expect("get").expect("record");
        assert_eq!(record.iteration_count, 2);
    }

    #[tokio::test]
    async fn test_advance_deletes_exhausted_scheduler() {
        let (schedulers, _, _) = scheduler_store();
        schedulers
            .upsert("once", RepeatOptions::every(1_000).with_limit(1), "tick", template())
            .await
            .expect("upsert");

        assert!(schedulers.advance("once", NOW).await.expect("advance").is_none());
        assert!(schedulers.get("once").await.expect("get").is_none());
        assert_eq!(schedulers.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_foreign_job_at_slot_is_a_collision() {
        let (schedulers, memory, _) = scheduler_store();
        let mut tx = memory.begin().await.expect("begin");
        tx.stage(Write::put_job(Job::new(
            format!("repeat:s1:{}", NOW),
            "intruder",
            serde_json::Value::Null,
            JobOptions::default(),
            NOW,
        )));
        tx.commit().await.expect("commit");

        let err = schedulers
            .upsert("s1", RepeatOptions::every(1_000), "tick", template())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::JobIdCollision { .. }));
        assert!(schedulers.get("s1").await.expect("get").is_none());
    }
}
