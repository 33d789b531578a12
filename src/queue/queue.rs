//! Queue facade over a [`Store`].
//!
//! Producers add jobs and manage job schedulers here; workers use the
//! lock-guarded transitions (`take_next`, `move_to_finished`, `retry_job`,
//! `defer_for_continuation`, `extend_locks`).
//!
//! # Job lifecycle
//!
//! ```text
//!   add ──► waiting ◄──────── promote_delayed ◄── delayed
//!              │                                    ▲
//!          take_next                                │ retry_job (backoff)
//!              ▼                                    │ defer_for_continuation
//!            active ────────────────────────────────┘
//!              │
//!       move_to_finished
//!              ▼
//!     completed / failed
//! ```
//!
//! A job leaves `active` only through its lock token, or with no token at all
//! once the lock has expired (stalled-job handling).

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{system_clock, Clock};
use crate::error::{QueueError, SchedulerError};
use crate::events::QueueEvent;
use crate::repeat::{
    JobSchedulerRecord, JobTemplate, RecurrenceCalculator, RepeatOptions, SchedulerStore,
};

use super::flow::{FlowCollaborator, NoopFlow};
use super::job::{Job, JobOptions, JobOutcome, JobState, RemoveOnFinish};
use super::keys::{scheduler_job_id, QueueKeys};
use super::store::{atomically, MemoryStore, RedisStore, Store, Txn, Write};

/// Due delayed jobs inspected per `claim_deferred` call.
const CLAIM_SCAN_LIMIT: usize = 100;

/// A named queue.
#[derive(Debug, Clone)]
pub struct Queue {
    name: String,
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    flow: Arc<dyn FlowCollaborator>,
    schedulers: SchedulerStore,
}

impl Queue {
    /// Creates a queue over an existing store.
    pub fn new(name: impl Into<String>, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let name = name.into();
        let schedulers = SchedulerStore::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::new(RecurrenceCalculator::new()),
            name.clone(),
        );
        Self {
            name,
            store,
            clock,
            flow: Arc::new(NoopFlow),
            schedulers,
        }
    }

    /// Connects to Redis and opens the queue `queue` under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str, queue: &str) -> Result<Self, QueueError> {
        let store = RedisStore::connect(redis_url, QueueKeys::new(prefix, queue)).await?;
        info!(queue = queue, prefix = prefix, "Connected to Redis queue");
        Ok(Self::new(queue, Arc::new(store), system_clock()))
    }

    /// Opens a queue backed by a fresh in-memory store.
    pub fn in_memory(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        let store = MemoryStore::new(Arc::clone(&clock));
        Self::new(name, Arc::new(store), clock)
    }

    /// Replaces the recurrence calculator, e.g. to register custom
    /// strategies.
    pub fn with_calculator(mut self, calculator: RecurrenceCalculator) -> Self {
        self.schedulers = SchedulerStore::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            Arc::new(calculator),
            self.name.clone(),
        );
        self
    }

    /// Sets the collaborator notified when a job with a parent fails.
    pub fn with_flow(mut self, flow: Arc<dyn FlowCollaborator>) -> Self {
        self.flow = flow;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn schedulers(&self) -> &SchedulerStore {
        &self.schedulers
    }

    /// Adds a job.
    ///
    /// When `opts.job_id` names an existing job nothing is written, a
    /// `duplicated` event is emitted and the existing job is returned.
    pub async fn add(
        &self,
        name: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now_millis();
        let id = opts
            .job_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let job = atomically!(self.store, |tx| {
            match tx.job(&id).await? {
                Some(existing) => {
                    tx.stage(Write::Emit(QueueEvent::Duplicated {
                        job_id: id.clone(),
                    }));
                    existing
                }
                None => {
                    let job = Job::new(id.clone(), name, data.clone(), opts.clone(), now);
                    tx.stage(Write::put_job(job.clone()));
                    tx.stage(Write::Emit(arrival_event(&job)));
                    job
                }
            }
        });

        debug!(queue = %self.name, job_id = %job.id, state = %job.state, "Job added");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let job = atomically!(self.store, |tx| { tx.job(job_id).await? });
        Ok(job)
    }

    /// Removes a job.
    ///
    /// # Errors
    ///
    /// - `JobBelongsToScheduler` if the job is the current companion of its
    ///   scheduler (remove the scheduler instead)
    /// - `JobLocked` if a worker holds the job's lock
    pub async fn remove_job(&self, job_id: &str) -> Result<bool, QueueError> {
        let removed = atomically!(self.store, |tx| {
            let Some(job) = tx.job(job_id).await? else {
                return Ok(false);
            };
            if let Some(ref scheduler_id) = job.scheduler_key {
                if let Some(stored) = tx.scheduler(scheduler_id).await? {
                    if scheduler_job_id(scheduler_id, stored.next()) == job.id {
                        return Err(QueueError::JobBelongsToScheduler {
                            job_id: job.id,
                            scheduler_id: scheduler_id.clone(),
                        });
                    }
                }
            }
            if tx.lock_token(job_id).await?.is_some() {
                return Err(QueueError::JobLocked(job_id.to_string()));
            }
            tx.stage(Write::DeleteJob {
                id: job_id.to_string(),
            });
            tx.stage(Write::Emit(QueueEvent::Removed {
                job_id: job_id.to_string(),
            }));
            true
        });
        Ok(removed)
    }

    /// Number of jobs in every indexed state.
    pub async fn job_counts(&self) -> Result<HashMap<JobState, usize>, QueueError> {
        let counts = atomically!(self.store, |tx| {
            let mut counts = HashMap::new();
            for state in JobState::INDEXED {
                counts.insert(state, tx.count_in(state).await?);
            }
            counts
        });
        Ok(counts)
    }

    /// Global events published after the cursor `after`.
    pub async fn events(
        &self,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, QueueEvent)>, QueueError> {
        self.store.read_events(after, count).await
    }

    // --- Job schedulers ---

    /// Creates or updates a job scheduler. See [`SchedulerStore::upsert`].
    pub async fn upsert_job_scheduler(
        &self,
        scheduler_id: &str,
        repeat: RepeatOptions,
        name: &str,
        template: JobTemplate,
    ) -> Result<Option<Job>, SchedulerError> {
        self.schedulers
            .upsert(scheduler_id, repeat, name, template)
            .await
    }

    pub async fn get_job_scheduler(
        &self,
        scheduler_id: &str,
    ) -> Result<Option<JobSchedulerRecord>, SchedulerError> {
        self.schedulers.get(scheduler_id).await
    }

    pub async fn get_job_schedulers(
        &self,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<JobSchedulerRecord>, SchedulerError> {
        self.schedulers.list(start, end, asc).await
    }

    pub async fn get_job_schedulers_count(&self) -> Result<usize, SchedulerError> {
        self.schedulers.count().await
    }

    pub async fn remove_job_scheduler(&self, scheduler_id: &str) -> Result<bool, SchedulerError> {
        self.schedulers.remove(scheduler_id).await
    }

    /// Removes a scheduler by its repeat index key, including legacy keys.
    pub async fn remove_repeatable_by_key(&self, key: &str) -> Result<bool, SchedulerError> {
        self.schedulers.remove_by_key(key).await
    }

    // --- Worker transitions ---

    /// Moves the oldest waiting job to active and locks it with `token`.
    pub async fn take_next(
        &self,
        token: &str,
        lock_duration_ms: u64,
    ) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now_millis();

        let job = atomically!(self.store, |tx| {
            let Some(id) = tx.jobs_in(JobState::Waiting, 1).await?.into_iter().next() else {
                return Ok(None);
            };
            let mut job = tx
                .job(&id)
                .await?
                .ok_or_else(|| QueueError::JobNotFound(id.clone()))?;
            job.state = JobState::Active;
            job.attempts_started += 1;
            job.processed_on = Some(now);
            lock_active(&mut *tx, &job, token, lock_duration_ms);
            job
        });

        Ok(Some(with_token(job, token)))
    }

    /// Moves up to `limit` due delayed jobs to waiting. Jobs carrying a
    /// deferred outcome are left for [`Queue::claim_deferred`].
    pub async fn promote_delayed(&self, limit: usize) -> Result<usize, QueueError> {
        let now = self.clock.now_millis();

        let promoted = atomically!(self.store, |tx| {
            let due = tx.jobs_due(JobState::Delayed, now, limit).await?;
            let mut jobs = Vec::with_capacity(due.len());
            for id in due {
                if let Some(job) = tx.job(&id).await? {
                    if job.deferred.is_none() {
                        jobs.push(job);
                    }
                }
            }
            let promoted = jobs.len();
            for mut job in jobs {
                let score = job.ready_at().min(now);
                job.state = JobState::Waiting;
                tx.stage(Write::Emit(QueueEvent::Waiting {
                    job_id: job.id.clone(),
                }));
                tx.stage(Write::PutJob { job, score });
            }
            promoted
        });

        if promoted > 0 {
            debug!(queue = %self.name, count = promoted, "Promoted delayed jobs");
        }
        Ok(promoted)
    }

    /// Claims one due delayed job whose terminal outcome was deferred because
    /// its scheduler continuation failed. The job comes back active and
    /// locked, with `deferred` still set.
    pub async fn claim_deferred(
        &self,
        token: &str,
        lock_duration_ms: u64,
    ) -> Result<Option<Job>, QueueError> {
        let now = self.clock.now_millis();

        let job = atomically!(self.store, |tx| {
            let due = tx
                .jobs_due(JobState::Delayed, now, CLAIM_SCAN_LIMIT)
                .await?;
            let mut claimed = None;
            for id in due {
                if let Some(job) = tx.job(&id).await? {
                    if job.deferred.is_some() {
                        claimed = Some(job);
                        break;
                    }
                }
            }
            let Some(mut job) = claimed else {
                return Ok(None);
            };
            job.state = JobState::Active;
            job.processed_on = Some(now);
            lock_active(&mut *tx, &job, token, lock_duration_ms);
            job
        });

        debug!(queue = %self.name, job_id = %job.id, "Claimed deferred job");
        Ok(Some(with_token(job, token)))
    }

    /// Moves an active job to completed or failed.
    ///
    /// `token` must match the job's lock. `None` is only accepted when the
    /// lock is gone, which is how stalled jobs are failed. The job is kept,
    /// trimmed or deleted according to its `remove_on_*` policy, and a
    /// failing job with a parent is reported to the flow collaborator.
    ///
    /// # Errors
    ///
    /// - `JobNotFound` if the job does not exist
    /// - `LockMismatch` if the token does not match the lock
    /// - `NotActive` if the job is not active
    pub async fn move_to_finished(
        &self,
        job_id: &str,
        outcome: JobOutcome,
        token: Option<&str>,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now_millis();
        let state = outcome.terminal_state();

        let job = atomically!(self.store, |tx| {
            let mut job = load_active(&mut *tx, job_id, token).await?;
            let policy = match state {
                JobState::Completed => job.opts.remove_on_complete,
                _ => job.opts.remove_on_fail,
            };
            let retained = match policy {
                RemoveOnFinish::KeepLast(_) => tx.jobs_in(state, usize::MAX).await?,
                _ => Vec::new(),
            };

            job.state = state;
            job.attempts_made += 1;
            job.finished_on = Some(now);
            job.deferred = None;
            let event = match outcome {
                JobOutcome::Completed(ref value) => {
                    job.return_value = Some(value.clone());
                    QueueEvent::Completed {
                        job_id: job.id.clone(),
                        return_value: value.clone(),
                    }
                }
                JobOutcome::Failed(ref reason) => {
                    job.failed_reason = Some(reason.clone());
                    QueueEvent::Failed {
                        job_id: job.id.clone(),
                        failed_reason: reason.clone(),
                    }
                }
            };

            tx.stage(Write::DeleteLock {
                job_id: job.id.clone(),
            });
            match policy {
                RemoveOnFinish::Never => tx.stage(Write::put_job(job.clone())),
                RemoveOnFinish::Always | RemoveOnFinish::KeepLast(0) => {
                    tx.stage(Write::DeleteJob { id: job.id.clone() })
                }
                RemoveOnFinish::KeepLast(keep) => {
                    tx.stage(Write::put_job(job.clone()));
                    let excess = (retained.len() + 1).saturating_sub(keep);
                    for id in retained.into_iter().take(excess) {
                        tx.stage(Write::DeleteJob { id });
                    }
                }
            }
            tx.stage(Write::Emit(event));
            job
        });

        info!(
            queue = %self.name,
            job_id = %job.id,
            state = %job.state,
            attempts_made = job.attempts_made,
            "Job finished"
        );

        if let (JobOutcome::Failed(reason), Some(parent)) = (&outcome, &job.opts.parent) {
            if let Err(e) = self.flow.child_failed(&job, parent, reason).await {
                warn!(
                    job_id = %job.id,
                    parent_id = %parent.id,
                    error = %e,
                    "Failed to notify parent of child failure"
                );
            }
        }

        Ok(job)
    }

    /// Records a failed attempt and schedules another one, after the job's
    /// backoff if it has one.
    pub async fn retry_job(
        &self,
        job_id: &str,
        token: &str,
        reason: &str,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now_millis();

        let job = atomically!(self.store, |tx| {
            let mut job = load_active(&mut *tx, job_id, Some(token)).await?;
            job.attempts_made += 1;
            job.failed_reason = Some(reason.to_string());

            let backoff = job.opts.backoff;
            let event = if backoff > 0 {
                job.state = JobState::Delayed;
                QueueEvent::Delayed {
                    job_id: job.id.clone(),
                    delay: backoff,
                }
            } else {
                job.state = JobState::Waiting;
                QueueEvent::Waiting {
                    job_id: job.id.clone(),
                }
            };
            tx.stage(Write::DeleteLock {
                job_id: job.id.clone(),
            });
            tx.stage(Write::PutJob {
                job: job.clone(),
                score: now + backoff,
            });
            tx.stage(Write::Emit(event));
            job
        });

        debug!(
            queue = %self.name,
            job_id = %job.id,
            attempts_made = job.attempts_made,
            state = %job.state,
            "Job scheduled for retry"
        );
        Ok(job)
    }

    /// Parks an active job in delayed for `delay_ms`, carrying `outcome` to
    /// be applied once the scheduler continuation succeeds.
    pub async fn defer_for_continuation(
        &self,
        job_id: &str,
        outcome: JobOutcome,
        token: Option<&str>,
        delay_ms: i64,
    ) -> Result<Job, QueueError> {
        let now = self.clock.now_millis();
        let delay = delay_ms.max(0);

        let job = atomically!(self.store, |tx| {
            let mut job = load_active(&mut *tx, job_id, token).await?;
            job.state = JobState::Delayed;
            job.deferred = Some(outcome.clone());
            tx.stage(Write::DeleteLock {
                job_id: job.id.clone(),
            });
            tx.stage(Write::PutJob {
                job: job.clone(),
                score: now + delay,
            });
            tx.stage(Write::Emit(QueueEvent::Delayed {
                job_id: job.id.clone(),
                delay,
            }));
            job
        });

        warn!(
            queue = %self.name,
            job_id = %job.id,
            delay_ms = delay,
            "Job outcome deferred until its scheduler continuation succeeds"
        );
        Ok(job)
    }

    /// Extends the locks of `ids` held with the matching `tokens` to
    /// `duration_ms` from now. Returns the ids whose lock is gone or held
    /// with another token.
    pub async fn extend_locks(
        &self,
        ids: &[String],
        tokens: &[String],
        duration_ms: u64,
    ) -> Result<Vec<String>, QueueError> {
        let failed = atomically!(self.store, |tx| {
            let mut extended = Vec::new();
            let mut failed = Vec::new();
            for (id, token) in ids.iter().zip(tokens) {
                match tx.lock_token(id).await? {
                    Some(ref held) if held == token => extended.push((id, token)),
                    _ => failed.push(id.clone()),
                }
            }
            for (id, token) in extended {
                tx.stage(Write::SetLock {
                    job_id: id.clone(),
                    token: token.clone(),
                    ttl_ms: duration_ms,
                });
            }
            failed
        });
        Ok(failed)
    }
}

fn arrival_event(job: &Job) -> QueueEvent {
    match job.state {
        JobState::Delayed => QueueEvent::Delayed {
            job_id: job.id.clone(),
            delay: job.delay,
        },
        _ => QueueEvent::Waiting {
            job_id: job.id.clone(),
        },
    }
}

fn with_token(mut job: Job, token: &str) -> Job {
    job.lock_token = Some(token.to_string());
    job
}

/// Stages an active job together with its lock.
fn lock_active(tx: &mut dyn Txn, job: &Job, token: &str, lock_duration_ms: u64) {
    tx.stage(Write::put_job(job.clone()));
    tx.stage(Write::SetLock {
        job_id: job.id.clone(),
        token: token.to_string(),
        ttl_ms: lock_duration_ms,
    });
    tx.stage(Write::Emit(QueueEvent::Active {
        job_id: job.id.clone(),
    }));
}

/// Reads an active job and checks that `token` matches its lock.
async fn load_active(
    tx: &mut dyn Txn,
    job_id: &str,
    token: Option<&str>,
) -> Result<Job, QueueError> {
    let job = tx
        .job(job_id)
        .await?
        .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
    let held = tx.lock_token(job_id).await?;
    if held.as_deref() != token {
        return Err(QueueError::LockMismatch {
            job_id: job_id.to_string(),
        });
    }
    if job.state != JobState::Active {
        return Err(QueueError::NotActive {
            job_id: job_id.to_string(),
            state: job.state.to_string(),
        });
    }
    Ok(job)
}
