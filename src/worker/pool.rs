//! Worker processing jobs from a queue.
//!
//! A [`Worker`] runs `concurrency` processing loops plus two background
//! tasks: lock renewal ([`LeaseManager`]) and the stalled job sweep
//! ([`StalledSweeper`]).
//!
//! # Processing loop
//!
//! Each loop repeatedly:
//!
//! 1. Promotes due delayed jobs to waiting
//! 2. Claims a job whose outcome was deferred by a failed scheduler
//!    continuation, and finishes it
//! 3. Takes the next waiting job with a fresh lock token, runs the
//!    [`Processor`] and finishes or retries the job
//!
//! and sleeps for the poll interval when there was nothing to do. Jobs are
//! tracked by the lease manager for exactly as long as they are processed. A
//! panicking processor fails the attempt like a returned error.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::queue::{Job, JobOutcome, JobState, Queue};
use crate::repeat::{ContinuationConfig, FinishOutcome, SchedulerContinuation};

use super::lease::LeaseManager;
use super::stalled::StalledSweeper;

/// Due delayed jobs promoted per loop iteration.
const PROMOTE_BATCH: usize = 100;

/// Errors that can occur while starting or stopping a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Worker is already running")]
    AlreadyRunning,

    #[error("Worker is not running")]
    NotRunning,

    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Handles one job.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Processes `job`. The returned value is stored as the job's return
    /// value; an error fails the attempt.
    async fn process(&self, job: &Job) -> anyhow::Result<Value>;
}

/// Configuration for a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of processing loops.
    pub concurrency: usize,
    /// Lifetime of a job lock, renewed while the job is processed.
    pub lock_duration: Duration,
    /// Lock renewal period. Zero disables renewal.
    pub lock_renew_time: Duration,
    /// Period of the stalled job sweep. Zero disables the sweep.
    pub stalled_interval: Duration,
    /// Times a job may stall before it fails.
    pub max_stalled_count: u32,
    /// Wait between polls when there is no job.
    pub poll_interval: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Retry policy of scheduler continuations.
    pub continuation: ContinuationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            lock_duration: Duration::from_secs(30),
            lock_renew_time: Duration::from_secs(15),
            stalled_interval: Duration::from_secs(30),
            max_stalled_count: 1,
            poll_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(60),
            continuation: ContinuationConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration with `concurrency` processing loops.
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            ..Default::default()
        }
    }

    /// Sets the lock duration and renews at half of it.
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self.lock_renew_time = duration / 2;
        self
    }

    pub fn with_lock_renew_time(mut self, renew_time: Duration) -> Self {
        self.lock_renew_time = renew_time;
        self
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn with_max_stalled_count(mut self, count: u32) -> Self {
        self.max_stalled_count = count;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets how many times a scheduler continuation is attempted.
    pub fn with_continuation_retries(mut self, attempts: u32) -> Self {
        self.continuation = self.continuation.with_max_attempts(attempts);
        self
    }

    pub fn with_continuation_base_delay(mut self, delay: Duration) -> Self {
        self.continuation = self.continuation.with_base_delay(delay);
        self
    }

    fn lock_duration_ms(&self) -> u64 {
        self.lock_duration.as_millis() as u64
    }
}

/// Statistics about a worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub concurrency: usize,
    /// Jobs currently being processed.
    pub active_jobs: usize,
    pub jobs_completed: u64,
    /// Jobs that failed for good.
    pub jobs_failed: u64,
    /// Failed attempts that were retried.
    pub jobs_retried: u64,
    /// Jobs parked because their scheduler continuation failed.
    pub jobs_deferred: u64,
    pub average_job_duration: Duration,
}

impl WorkerStats {
    /// Returns the number of jobs that reached a terminal state.
    pub fn total_processed(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.jobs_completed as f64 / total as f64) * 100.0
    }
}

#[derive(Debug, Default)]
struct SharedWorkerStats {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    jobs_deferred: AtomicU64,
    total_duration_ms: AtomicU64,
    timed_jobs: AtomicU64,
    active_jobs: AtomicU64,
}

impl SharedWorkerStats {
    fn record_duration(&self, duration: Duration) {
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
        self.timed_jobs.fetch_add(1, Ordering::SeqCst);
    }

    fn record_finish(&self, outcome: &FinishOutcome) {
        let counter = match outcome {
            FinishOutcome::Deferred(_) => &self.jobs_deferred,
            FinishOutcome::Finished(job) if job.state == JobState::Failed => &self.jobs_failed,
            FinishOutcome::Finished(_) => &self.jobs_completed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }

    fn to_worker_stats(&self, concurrency: usize) -> WorkerStats {
        let timed = self.timed_jobs.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let average_job_duration = if timed > 0 {
            Duration::from_millis(total_duration_ms / timed)
        } else {
            Duration::ZERO
        };

        WorkerStats {
            concurrency,
            active_jobs: self.active_jobs.load(Ordering::SeqCst) as usize,
            jobs_completed: self.jobs_completed.load(Ordering::SeqCst),
            jobs_failed: self.jobs_failed.load(Ordering::SeqCst),
            jobs_retried: self.jobs_retried.load(Ordering::SeqCst),
            jobs_deferred: self.jobs_deferred.load(Ordering::SeqCst),
            average_job_duration,
        }
    }
}

/// Processes jobs of one queue.
pub struct Worker {
    id: String,
    config: WorkerConfig,
    queue: Queue,
    processor: Arc<dyn Processor>,
    bus: EventBus,
    lease: LeaseManager,
    continuation: SchedulerContinuation,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedWorkerStats>,
    is_running: AtomicBool,
}

impl Worker {
    /// Creates a stopped worker.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue to process
    /// * `processor` - Job handler
    /// * `config` - Worker configuration
    pub fn new(queue: Queue, processor: Arc<dyn Processor>, config: WorkerConfig) -> Self {
        let bus = EventBus::new();
        let lease = new_lease(&queue, &bus, &config);
        let continuation =
            SchedulerContinuation::new(queue.clone(), bus.clone(), config.continuation.clone());
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            id: format!("worker-{}", Uuid::new_v4().simple()),
            config,
            queue,
            processor,
            bus,
            lease,
            continuation,
            shutdown_tx,
            handles: Vec::new(),
            stats: Arc::new(SharedWorkerStats::default()),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts the processing loops, lock renewal and the stalled sweep.
    ///
    /// # Errors
    ///
    /// Returns `WorkerError::AlreadyRunning` if the worker is already running.
    pub fn start(&mut self) -> Result<(), WorkerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(WorkerError::AlreadyRunning);
        }

        // shutdown closed the previous manager for good
        if self.lease.is_closed() {
            self.lease = new_lease(&self.queue, &self.bus, &self.config);
        }
        self.lease.start();

        if !self.config.stalled_interval.is_zero() {
            let sweeper = StalledSweeper::new(
                self.queue.clone(),
                self.continuation.clone(),
                self.bus.clone(),
                self.config.stalled_interval,
                self.config.max_stalled_count,
            );
            self.handles
                .push(tokio::spawn(sweeper.run(self.shutdown_tx.subscribe())));
        }

        for i in 0..self.config.concurrency {
            let processing = ProcessingLoop {
                id: format!("{}-{}", self.id, i),
                config: self.config.clone(),
                queue: self.queue.clone(),
                processor: Arc::clone(&self.processor),
                bus: self.bus.clone(),
                lease: self.lease.clone(),
                continuation: self.continuation.clone(),
                stats: Arc::clone(&self.stats),
                shutdown_rx: self.shutdown_tx.subscribe(),
            };
            self.handles.push(tokio::spawn(processing.run()));
        }

        info!(
            worker_id = %self.id,
            queue = %self.queue.name(),
            concurrency = self.config.concurrency,
            "Worker started"
        );
        Ok(())
    }

    /// Stops the worker, letting in-flight jobs finish.
    ///
    /// # Errors
    ///
    /// - `WorkerError::NotRunning` if the worker was not started
    /// - `WorkerError::ShutdownTimeout` if the loops did not stop in time
    pub async fn shutdown(&mut self) -> Result<(), WorkerError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(WorkerError::NotRunning);
        }

        info!(worker_id = %self.id, "Initiating worker shutdown");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.drain(..).collect();
        let shutdown_future = async {
            for result in join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };
        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;

        self.lease.close();
        self.is_running.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                info!(worker_id = %self.id, "Worker shutdown complete");
                Ok(())
            }
            Err(_) => Err(WorkerError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.to_worker_stats(self.config.concurrency)
    }

    /// Local events of this worker (errors, stalled jobs).
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn lease(&self) -> &LeaseManager {
        &self.lease
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }
}

fn new_lease(queue: &Queue, bus: &EventBus, config: &WorkerConfig) -> LeaseManager {
    LeaseManager::new(
        Arc::new(queue.clone()),
        Arc::clone(queue.clock()),
        bus.clone(),
        queue.name(),
        config.lock_duration,
        config.lock_renew_time,
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

/// One processing loop of a worker.
struct ProcessingLoop {
    id: String,
    config: WorkerConfig,
    queue: Queue,
    processor: Arc<dyn Processor>,
    bus: EventBus,
    lease: LeaseManager,
    continuation: SchedulerContinuation,
    stats: Arc<SharedWorkerStats>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl ProcessingLoop {
    async fn run(mut self) {
        debug!(worker_id = %self.id, "Processing loop started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let idle = match self.step().await {
                Ok(worked) => !worked,
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to fetch next job");
                    self.bus.emit(QueueEvent::error(e.to_string()));
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    _ = self.shutdown_rx.recv() => break,
                }
            }
        }

        debug!(worker_id = %self.id, "Processing loop stopped");
    }

    /// Handles at most one job. Returns whether there was one.
    async fn step(&self) -> Result<bool, QueueError> {
        self.queue.promote_delayed(PROMOTE_BATCH).await?;

        let token = Uuid::new_v4().to_string();
        let lock_ms = self.config.lock_duration_ms();

        if let Some(job) = self.queue.claim_deferred(&token, lock_ms).await? {
            self.finish_deferred(job, &token).await;
            return Ok(true);
        }

        match self.queue.take_next(&token, lock_ms).await? {
            Some(job) => {
                self.process_job(job, &token).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn process_job(&self, job: Job, token: &str) {
        info!(
            worker_id = %self.id,
            job_id = %job.id,
            name = %job.name,
            attempt = job.attempts_started,
            "Processing job"
        );

        self.lease
            .track_job(&job.id, token, self.queue.clock().now_millis());
        self.stats.active_jobs.fetch_add(1, Ordering::SeqCst);
        let start_time = Instant::now();

        let result = match AssertUnwindSafe(self.processor.process(&job))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                error!(worker_id = %self.id, job_id = %job.id, "Processor panicked");
                Err(anyhow::anyhow!("processor panicked: {}", panic_message(&*panic)))
            }
        };

        self.stats.record_duration(start_time.elapsed());
        self.stats.active_jobs.fetch_sub(1, Ordering::SeqCst);

        let finished = match result {
            Ok(value) => self
                .continuation
                .finish(&job, JobOutcome::Completed(value), Some(token))
                .await
                .map(Some),
            Err(e) if job.should_retry() => {
                warn!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %e,
                    remaining_attempts = job.remaining_attempts().saturating_sub(1),
                    "Job failed, scheduling retry"
                );
                self.stats.jobs_retried.fetch_add(1, Ordering::SeqCst);
                self.queue
                    .retry_job(&job.id, token, &e.to_string())
                    .await
                    .map(|_| None)
            }
            Err(e) => {
                warn!(worker_id = %self.id, job_id = %job.id, error = %e, "Job failed");
                self.continuation
                    .finish(&job, JobOutcome::Failed(e.to_string()), Some(token))
                    .await
                    .map(Some)
            }
        };

        self.lease.untrack_job(&job.id);
        self.settle(&job, finished);
    }

    async fn finish_deferred(&self, job: Job, token: &str) {
        let Some(outcome) = job.deferred.clone() else {
            return;
        };
        info!(worker_id = %self.id, job_id = %job.id, "Retrying deferred scheduler continuation");

        self.lease
            .track_job(&job.id, token, self.queue.clock().now_millis());
        let finished = self
            .continuation
            .finish(&job, outcome, Some(token))
            .await
            .map(Some);
        self.lease.untrack_job(&job.id);
        self.settle(&job, finished);
    }

    fn settle(&self, job: &Job, finished: Result<Option<FinishOutcome>, QueueError>) {
        match finished {
            Ok(Some(outcome)) => self.stats.record_finish(&outcome),
            Ok(None) => {}
            Err(e) => {
                error!(
                    worker_id = %self.id,
                    job_id = %job.id,
                    error = %e,
                    "Failed to move job out of active"
                );
                self.bus.emit(QueueEvent::error(format!(
                    "Failed to finish job {}: {}",
                    job.id, e
                )));
            }
        }
    }
}
