//! Stalled job detection.
//!
//! An active job whose lock expired has lost its worker. Every stalled
//! interval one process (whoever sets the queue-wide `stalled-check` marker
//! first) sweeps the active jobs: stalled ones go back to waiting, and a job
//! that stalled too many times fails. Scheduler jobs fail through the
//! scheduler continuation so the recurrence goes on.
//!
//! Two kinds of stalled jobs never go back to waiting. A job carrying a
//! deferred outcome already ran, so it returns to delayed for the next
//! deferred claim. A scheduler job whose scheduler was upserted while it ran
//! is no longer the scheduler's companion; requeueing it would give the
//! scheduler a second pending job, so it fails instead.

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::metrics::MetricsCollector;
use crate::observability::{trace_operation, SpanKind};
use crate::queue::store::atomically;
use crate::queue::{
    scheduler_job_id, Job, JobOutcome, JobState, Queue, Write, STALLED_CHECK_MARKER,
};
use crate::repeat::{SchedulerContinuation, StoredScheduler};

/// Failure reason of jobs that stalled more than `max_stalled_count` times.
pub const STALLED_FAILURE_REASON: &str = "job stalled more than allowable limit";

/// Failure reason of stalled scheduler jobs whose scheduler moved on.
pub const SUPERSEDED_FAILURE_REASON: &str = "job stalled after its scheduler moved on";

/// Result of one sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// `false` when another process holds the sweep marker.
    pub ran: bool,
    /// Jobs moved back to waiting.
    pub requeued: Vec<String>,
    /// Jobs failed for stalling too often.
    pub failed: Vec<String>,
}

#[derive(Debug)]
enum StallCheck {
    Untouched,
    Requeued,
    Exceeded(Job),
    Superseded(Job),
}

/// Sweeps a queue for stalled jobs.
#[derive(Debug, Clone)]
pub struct StalledSweeper {
    queue: Queue,
    continuation: SchedulerContinuation,
    bus: EventBus,
    stalled_interval: Duration,
    max_stalled_count: u32,
    metrics: MetricsCollector,
}

impl StalledSweeper {
    pub fn new(
        queue: Queue,
        continuation: SchedulerContinuation,
        bus: EventBus,
        stalled_interval: Duration,
        max_stalled_count: u32,
    ) -> Self {
        Self {
            queue,
            continuation,
            bus,
            stalled_interval,
            max_stalled_count,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sweeps every `stalled_interval` until `shutdown` fires. Errors are
    /// emitted on the local bus and the loop goes on.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.stalled_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    let result = trace_operation(
                        SpanKind::Internal,
                        "moveStalledJobsToWait",
                        self.queue.name(),
                        self.sweep(),
                    )
                    .await;
                    if let Err(e) = result {
                        self.bus.emit(QueueEvent::error(format!(
                            "Failed to check stalled jobs: {}",
                            e
                        )));
                    }
                }
            }
        }
        debug!(queue = %self.queue.name(), "Stalled job checker stopped");
    }

    /// Runs one sweep if no other process swept during the current interval.
    pub async fn sweep(&self) -> Result<SweepReport, QueueError> {
        if !self.acquire_marker().await? {
            debug!(queue = %self.queue.name(), "Stalled check already done this interval");
            return Ok(SweepReport::default());
        }

        let active = atomically!(self.queue.store(), |tx| {
            tx.jobs_in(JobState::Active, usize::MAX).await?
        });

        let mut report = SweepReport {
            ran: true,
            ..Default::default()
        };
        for job_id in active {
            match self.check_job(&job_id).await {
                Ok(StallCheck::Untouched) => {}
                Ok(StallCheck::Requeued) => {
                    warn!(queue = %self.queue.name(), job_id = %job_id, "Job stalled, moved back to wait");
                    self.bus.emit(QueueEvent::Stalled {
                        job_id: job_id.clone(),
                    });
                    self.metrics.record_stalled(self.queue.name(), "requeued");
                    report.requeued.push(job_id);
                }
                Ok(StallCheck::Exceeded(job)) => match self.fail(&job, STALLED_FAILURE_REASON).await {
                    Ok(()) => {
                        self.metrics.record_stalled(self.queue.name(), "failed");
                        report.failed.push(job_id);
                    }
                    Err(e) => self.bus.emit(QueueEvent::error(format!(
                        "Failed to fail stalled job {}: {}",
                        job_id, e
                    ))),
                },
                Ok(StallCheck::Superseded(job)) => {
                    self.bus.emit(QueueEvent::Stalled {
                        job_id: job_id.clone(),
                    });
                    match self.fail(&job, SUPERSEDED_FAILURE_REASON).await {
                        Ok(()) => {
                            self.metrics.record_stalled(self.queue.name(), "failed");
                            report.failed.push(job_id);
                        }
                        Err(e) => self.bus.emit(QueueEvent::error(format!(
                            "Failed to fail stalled job {}: {}",
                            job_id, e
                        ))),
                    }
                }
                Err(e) => self.bus.emit(QueueEvent::error(format!(
                    "Failed to check stalled job {}: {}",
                    job_id, e
                ))),
            }
        }

        if !report.requeued.is_empty() || !report.failed.is_empty() {
            info!(
                queue = %self.queue.name(),
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                "Stalled jobs handled"
            );
        }
        Ok(report)
    }

    async fn acquire_marker(&self) -> Result<bool, QueueError> {
        let ttl_ms = self.stalled_interval.as_millis() as u64;
        let acquired = atomically!(self.queue.store(), |tx| {
            if tx.marker_exists(STALLED_CHECK_MARKER).await? {
                return Ok(false);
            }
            tx.stage(Write::SetMarker {
                name: STALLED_CHECK_MARKER.to_string(),
                ttl_ms,
            });
            true
        });
        Ok(acquired)
    }

    /// Requeues the job if it is active without a lock, or hands it back
    /// for failing once it has stalled `max_stalled_count` times already.
    async fn check_job(&self, job_id: &str) -> Result<StallCheck, QueueError> {
        let max = self.max_stalled_count;
        let now = self.queue.clock().now_millis();
        let check = atomically!(self.queue.store(), |tx| {
            let Some(mut job) = tx.job(job_id).await? else {
                return Ok(StallCheck::Untouched);
            };
            if job.state != JobState::Active || tx.lock_token(job_id).await?.is_some() {
                return Ok(StallCheck::Untouched);
            }
            if job.deferred.is_some() {
                job.state = JobState::Delayed;
                tx.stage(Write::PutJob { job, score: now });
                tx.stage(Write::Emit(QueueEvent::Stalled {
                    job_id: job_id.to_string(),
                }));
                return Ok(StallCheck::Requeued);
            }
            if let Some(key) = job.scheduler_key.clone() {
                if let Some(StoredScheduler::Structured(record)) = tx.scheduler(&key).await? {
                    if scheduler_job_id(&key, record.next) != job.id {
                        return Ok(StallCheck::Superseded(job));
                    }
                }
            }
            if job.stalled_counter >= max {
                return Ok(StallCheck::Exceeded(job));
            }

            job.stalled_counter += 1;
            job.state = JobState::Waiting;
            tx.stage(Write::put_job(job));
            tx.stage(Write::Emit(QueueEvent::Stalled {
                job_id: job_id.to_string(),
            }));
            StallCheck::Requeued
        });
        Ok(check)
    }

    async fn fail(&self, job: &Job, reason: &str) -> Result<(), QueueError> {
        warn!(
            queue = %self.queue.name(),
            job_id = %job.id,
            stalled_counter = job.stalled_counter,
            reason = reason,
            "Failing stalled job"
        );
        let outcome = JobOutcome::Failed(reason.to_string());
        self.continuation.finish(job, outcome, None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::{JobOptions, MemoryStore};
    use crate::repeat::ContinuationConfig;
    use std::sync::Arc;

    fn setup(max_stalled_count: u32) -> (Queue, MemoryStore, StalledSweeper) {
        let clock = ManualClock::new(1_000);
        let store = MemoryStore::new(Arc::new(clock.clone()));
        let queue = Queue::new("unit", Arc::new(store.clone()), Arc::new(clock));
        let bus = EventBus::new();
        let continuation =
            SchedulerContinuation::new(queue.clone(), bus.clone(), ContinuationConfig::default());
        let sweeper = StalledSweeper::new(
            queue.clone(),
            continuation,
            bus,
            Duration::from_secs(30),
            max_stalled_count,
        );
        (queue, store, sweeper)
    }

    #[tokio::test]
    async fn test_locked_jobs_are_untouched() {
        let (queue, _, sweeper) = setup(1);
        queue
            .add("j", serde_json::Value::Null, JobOptions::default())
            .await
            .unwrap();
        let job = queue.take_next("tok", 30_000).await.unwrap().unwrap();

        let report = sweeper.sweep().await.unwrap();
        assert!(report.ran);
        assert!(report.requeued.is_empty());
        assert_eq!(
            queue.get_job(&job.id).await.unwrap().unwrap().state,
            JobState::Active
        );
    }

    #[tokio::test]
    async fn test_marker_limits_one_sweep_per_interval() {
        let (queue, store, sweeper) = setup(1);
        queue
            .add("j", serde_json::Value::Null, JobOptions::default())
            .await
            .unwrap();
        let job = queue.take_next("tok", 30_000).await.unwrap().unwrap();

        assert!(sweeper.sweep().await.unwrap().ran);

        store.expire_lock(&job.id).await;
        let report = sweeper.sweep().await.unwrap();
        assert!(!report.ran);
        assert_eq!(
            queue.get_job(&job.id).await.unwrap().unwrap().state,
            JobState::Active
        );

        store.expire_marker(STALLED_CHECK_MARKER).await;
        let report = sweeper.sweep().await.unwrap();
        assert_eq!(report.requeued, vec![job.id.clone()]);
        let requeued = queue.get_job(&job.id).await.unwrap().unwrap();
        assert_eq!(requeued.state, JobState::Waiting);
        assert_eq!(requeued.stalled_counter, 1);
    }
}
