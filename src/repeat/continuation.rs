//! Scheduler continuation.
//!
//! When a scheduler's job reaches a terminal state, the scheduler must write
//! the job for its next occurrence before the finished job is released.
//! Transient store failures are retried with exponential backoff. If every
//! attempt fails, the finished job is parked in delayed with its outcome
//! deferred, so a worker picks it up later, retries the continuation and only
//! then applies the outcome. The recurrence never stops silently.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{QueueError, SchedulerError};
use crate::events::{EventBus, QueueEvent};
use crate::metrics::MetricsCollector;
use crate::queue::{Job, JobOutcome, Queue};

/// Message of the worker error emitted when the next iteration could not be
/// written.
pub const CONTINUATION_FAILED: &str = "Failed to add repeatable job for next iteration";

/// Retry policy of the continuation.
#[derive(Debug, Clone)]
pub struct ContinuationConfig {
    /// Attempts before falling back to deferring the job.
    pub max_attempts: u32,
    /// Delay before the second attempt, doubled for every further one.
    pub base_delay: Duration,
    /// How long a deferred job waits before it is claimed again.
    pub retry_delay: Duration,
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl ContinuationConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Backoff before attempt `attempt + 1`.
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16))
    }
}

/// What happened to a job handed to [`SchedulerContinuation::finish`].
#[derive(Debug, Clone, PartialEq)]
pub enum FinishOutcome {
    /// The job reached its terminal state.
    Finished(Job),
    /// The continuation failed; the job waits in delayed with its outcome.
    Deferred(Job),
}

impl FinishOutcome {
    pub fn job(&self) -> &Job {
        match self {
            FinishOutcome::Finished(job) | FinishOutcome::Deferred(job) => job,
        }
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, FinishOutcome::Deferred(_))
    }
}

/// Finishes jobs, writing the next scheduler iteration first when the job
/// belongs to a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerContinuation {
    queue: Queue,
    bus: EventBus,
    config: ContinuationConfig,
    metrics: MetricsCollector,
}

impl SchedulerContinuation {
    pub fn new(queue: Queue, bus: EventBus, config: ContinuationConfig) -> Self {
        Self {
            queue,
            bus,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    /// Advances the scheduler past `slot`, retrying retryable failures.
    pub async fn continue_after(
        &self,
        scheduler_id: &str,
        slot: i64,
    ) -> Result<Option<Job>, SchedulerError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.queue.schedulers().advance(scheduler_id, slot).await {
                Ok(job) => return Ok(job),
                Err(e) if e.is_retryable() && attempt < self.config.max_attempts => {
                    let delay = self.config.backoff(attempt);
                    warn!(
                        scheduler_id = scheduler_id,
                        attempt = attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Scheduler continuation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Applies `outcome` to an active job.
    ///
    /// For scheduler jobs the next iteration is written first. When that
    /// keeps failing with a retryable error the job is deferred instead of
    /// finished; any other continuation error is reported and the job
    /// finishes anyway.
    ///
    /// # Arguments
    ///
    /// * `job` - The active job
    /// * `outcome` - Completion value or failure reason
    /// * `token` - The job's lock token, `None` for jobs whose lock expired
    pub async fn finish(
        &self,
        job: &Job,
        outcome: JobOutcome,
        token: Option<&str>,
    ) -> Result<FinishOutcome, QueueError> {
        if let (Some(scheduler_id), Some(slot)) = (job.scheduler_key.as_deref(), job.scheduler_slot())
        {
            match self.continue_after(scheduler_id, slot).await {
                Ok(next) => debug!(
                    job_id = %job.id,
                    next_job_id = next.as_ref().map(|j| j.id.as_str()).unwrap_or("-"),
                    "Scheduler continued"
                ),
                Err(e) => {
                    self.bus.emit(QueueEvent::error(format!(
                        "{} (job {}): {}",
                        CONTINUATION_FAILED, job.id, e
                    )));
                    if e.is_retryable() {
                        self.metrics.record_continuation_failure(self.queue.name());
                        let delay_ms = self.config.retry_delay.as_millis() as i64;
                        let deferred = self
                            .queue
                            .defer_for_continuation(&job.id, outcome, token, delay_ms)
                            .await?;
                        return Ok(FinishOutcome::Deferred(deferred));
                    }
                }
            }
        }

        let status = if outcome.is_failure() { "failed" } else { "completed" };
        let finished = self.queue.move_to_finished(&job.id, outcome, token).await?;
        if let (Some(started), Some(ended)) = (finished.processed_on, finished.finished_on) {
            let secs = (ended - started).max(0) as f64 / 1000.0;
            self.metrics
                .record_job_finished(self.queue.name(), status, secs);
        }
        Ok(FinishOutcome::Finished(finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::JobState;
    use crate::repeat::{JobTemplate, RepeatOptions};
    use std::sync::Arc;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_backoff_doubles() {
        let config = ContinuationConfig::default().with_base_delay(Duration::from_millis(50));
        assert_eq!(config.backoff(1), Duration::from_millis(50));
        assert_eq!(config.backoff(2), Duration::from_millis(100));
        assert_eq!(config.backoff(3), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_finish_writes_next_iteration_first() {
        let clock = ManualClock::new(NOW);
        let queue = Queue::in_memory("unit", Arc::new(clock.clone()));
        let continuation =
            SchedulerContinuation::new(queue.clone(), EventBus::new(), ContinuationConfig::default());

        queue
            .upsert_job_scheduler("s", RepeatOptions::every(1_000), "tick", JobTemplate::default())
            .await
            .unwrap();
        let job = queue.take_next("tok", 30_000).await.unwrap().unwrap();

        clock.advance(200);
        let outcome = continuation
            .finish(&job, JobOutcome::Completed(serde_json::json!("ok")), Some("tok"))
            .await
            .unwrap();
        assert!(!outcome.is_deferred());
        assert_eq!(outcome.job().state, JobState::Completed);

        let next = queue
            .get_job(&format!("repeat:s:{}", NOW + 1_000))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.state, JobState::Delayed);
        assert_eq!(next.delay, 800);
    }

    #[tokio::test]
    async fn test_finish_plain_job_skips_continuation() {
        let clock = ManualClock::new(NOW);
        let queue = Queue::in_memory("unit", Arc::new(clock));
        let continuation =
            SchedulerContinuation::new(queue.clone(), EventBus::new(), ContinuationConfig::default());

        queue
            .add("plain", serde_json::Value::Null, Default::default())
            .await
            .unwrap();
        let job = queue.take_next("tok", 30_000).await.unwrap().unwrap();
        let outcome = continuation
            .finish(&job, JobOutcome::Failed("bad input".into()), Some("tok"))
            .await
            .unwrap();
        assert_eq!(outcome.job().state, JobState::Failed);
        assert_eq!(outcome.job().failed_reason.as_deref(), Some("bad input"));
    }
}
