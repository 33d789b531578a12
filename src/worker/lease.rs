//! Lock renewal for jobs held by this process.
//!
//! A worker holds each active job through a lock that expires after the lock
//! duration. The [`LeaseManager`] tracks the jobs this process is working on
//! and renews their locks on a timer, in one batch per tick. A job whose lock
//! cannot be renewed has been reclaimed by someone else (usually the stalled
//! sweeper after a long pause); it is reported and no longer tracked.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::metrics::MetricsCollector;
use crate::observability::{trace_operation, SpanKind};
use crate::queue::Queue;

/// Extends job locks held with known tokens.
#[async_trait]
pub trait LockExtender: Send + Sync + fmt::Debug {
    /// Extends the lock of every `ids[i]` held with `tokens[i]` to
    /// `duration_ms` from now. Returns the ids that could not be extended.
    async fn extend_locks(
        &self,
        ids: &[String],
        tokens: &[String],
        duration_ms: u64,
    ) -> Result<Vec<String>, QueueError>;
}

#[async_trait]
impl LockExtender for Queue {
    async fn extend_locks(
        &self,
        ids: &[String],
        tokens: &[String],
        duration_ms: u64,
    ) -> Result<Vec<String>, QueueError> {
        Queue::extend_locks(self, ids, tokens, duration_ms).await
    }
}

#[derive(Debug, Clone)]
struct Lease {
    token: String,
    last_renewed: i64,
}

struct LeaseInner {
    extender: Arc<dyn LockExtender>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    queue_name: String,
    lock_duration: Duration,
    renew_time: Duration,
    leases: DashMap<String, Lease>,
    closed: AtomicBool,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    metrics: MetricsCollector,
}

impl LeaseInner {
    fn report_active(&self) {
        self.metrics
            .update_active_jobs(&self.queue_name, self.leases.len());
    }

    async fn renew(&self) -> usize {
        let now = self.clock.now_millis();
        let half = (self.renew_time.as_millis() / 2) as i64;

        let (ids, tokens): (Vec<String>, Vec<String>) = self
            .leases
            .iter()
            .filter(|entry| entry.last_renewed + half < now)
            .map(|entry| (entry.key().clone(), entry.token.clone()))
            .unzip();
        if ids.is_empty() {
            return 0;
        }

        let result = trace_operation(
            SpanKind::Internal,
            "extendLocks",
            &self.queue_name,
            self.extender
                .extend_locks(&ids, &tokens, self.lock_duration.as_millis() as u64),
        )
        .await;

        match result {
            Ok(failed) => {
                let failed: HashSet<&String> = failed.iter().collect();
                for id in &failed {
                    self.bus.emit(QueueEvent::error(format!(
                        "could not renew lock for job {}",
                        id
                    )));
                    self.leases.remove(id.as_str());
                }
                self.metrics
                    .record_lock_renewal_failures(&self.queue_name, failed.len());

                let mut renewed = 0;
                for id in ids.iter().filter(|id| !failed.contains(id)) {
                    if let Some(mut lease) = self.leases.get_mut(id) {
                        lease.last_renewed = now;
                        renewed += 1;
                    }
                }
                if !failed.is_empty() {
                    self.report_active();
                }
                debug!(
                    queue = %self.queue_name,
                    renewed = renewed,
                    failed = failed.len(),
                    "Renewed job locks"
                );
                renewed
            }
            Err(e) => {
                self.bus.emit(QueueEvent::error(e.to_string()));
                0
            }
        }
    }
}

/// Renews the locks of the jobs this process is working on.
///
/// Cheap to clone; clones share the tracked jobs and the timer.
#[derive(Clone)]
pub struct LeaseManager {
    inner: Arc<LeaseInner>,
}

impl fmt::Debug for LeaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("queue", &self.inner.queue_name)
            .field("tracked", &self.inner.leases.len())
            .field("running", &self.is_running())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl LeaseManager {
    /// Creates a stopped manager.
    ///
    /// # Arguments
    ///
    /// * `extender` - Collaborator performing the lock extension
    /// * `clock` - Time source for renewal ages
    /// * `bus` - Local bus receiving renewal errors
    /// * `queue_name` - Queue name used in spans and metrics
    /// * `lock_duration` - New lock lifetime on every renewal
    /// * `renew_time` - Timer period; zero disables renewal
    pub fn new(
        extender: Arc<dyn LockExtender>,
        clock: Arc<dyn Clock>,
        bus: EventBus,
        queue_name: impl Into<String>,
        lock_duration: Duration,
        renew_time: Duration,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(LeaseInner {
                extender,
                clock,
                bus,
                queue_name: queue_name.into(),
                lock_duration,
                renew_time,
                leases: DashMap::new(),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                shutdown_tx,
                metrics: MetricsCollector::new(),
            }),
        }
    }

    /// Starts tracking `job_id`. Ignored when the manager is closed, when
    /// the id is empty, or when the job is already tracked.
    pub fn track_job(&self, job_id: &str, token: &str, started_at: i64) {
        if self.inner.closed.load(Ordering::SeqCst) || job_id.is_empty() {
            return;
        }
        self.inner
            .leases
            .entry(job_id.to_string())
            .or_insert_with(|| Lease {
                token: token.to_string(),
                last_renewed: started_at,
            });
        self.inner.report_active();
    }

    pub fn untrack_job(&self, job_id: &str) {
        if self.inner.leases.remove(job_id).is_some() {
            self.inner.report_active();
        }
    }

    pub fn active_job_count(&self) -> usize {
        self.inner.leases.len()
    }

    pub fn is_tracking(&self, job_id: &str) -> bool {
        self.inner.leases.contains_key(job_id)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// A closed manager never tracks or renews again.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Starts the renewal timer. Does nothing when already running, closed,
    /// or configured with a zero renew time.
    pub fn start(&self) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || inner.renew_time.is_zero() {
            return;
        }
        if inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(inner);
        let mut shutdown_rx = inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(inner.renew_time);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        if inner.closed.load(Ordering::SeqCst) {
                            break;
                        }
                        inner.renew().await;
                    }
                }
            }

            inner.running.store(false, Ordering::SeqCst);
            debug!(queue = %inner.queue_name, "Lock renewal stopped");
        });

        info!(
            queue = %self.inner.queue_name,
            renew_ms = self.inner.renew_time.as_millis() as u64,
            "Lock renewal started"
        );
    }

    /// Runs one renewal pass now and returns the number of renewed locks.
    pub async fn renew_locks(&self) -> usize {
        self.inner.renew().await
    }

    /// Stops the timer and forgets every tracked job. Safe to call more than
    /// once. An extension already in flight is not revoked.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
        self.inner.leases.clear();
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.report_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeExtender {
        calls: Mutex<Vec<Vec<String>>>,
        reject: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LockExtender for FakeExtender {
        async fn extend_locks(
            &self,
            ids: &[String],
            _tokens: &[String],
            _duration_ms: u64,
        ) -> Result<Vec<String>, QueueError> {
            self.calls.lock().unwrap().push(ids.to_vec());
            let reject = self.reject.lock().unwrap();
            Ok(ids.iter().filter(|id| reject.contains(id)).cloned().collect())
        }
    }

    fn manager(extender: Arc<FakeExtender>, clock: &ManualClock) -> LeaseManager {
        LeaseManager::new(
            extender,
            Arc::new(clock.clone()),
            EventBus::new(),
            "unit",
            Duration::from_millis(1_000),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_track_is_idempotent_and_ignores_empty_ids() {
        let clock = ManualClock::new(0);
        let leases = manager(Arc::new(FakeExtender::default()), &clock);

        leases.track_job("a", "t1", 0);
        leases.track_job("a", "t2", 0);
        leases.track_job("", "t3", 0);
        assert_eq!(leases.active_job_count(), 1);

        leases.untrack_job("a");
        leases.untrack_job("a");
        assert_eq!(leases.active_job_count(), 0);
    }

    #[tokio::test]
    async fn test_renew_only_batches_stale_leases() {
        let clock = ManualClock::new(0);
        let extender = Arc::new(FakeExtender::default());
        let leases = manager(extender.clone(), &clock);

        leases.track_job("old", "t", 0);
        clock.set(200);
        leases.track_job("fresh", "t", 200);

        clock.set(300);
        assert_eq!(leases.renew_locks().await, 1);
        assert_eq!(*extender.calls.lock().unwrap(), vec![vec!["old".to_string()]]);

        // "old" was renewed at 300, "fresh" is now older than half the period
        clock.set(500);
        assert_eq!(leases.renew_locks().await, 1);
        assert_eq!(
            extender.calls.lock().unwrap().last().cloned(),
            Some(vec!["fresh".to_string()])
        );
    }

    #[tokio::test]
    async fn test_close_clears_and_blocks_tracking() {
        let clock = ManualClock::new(0);
        let leases = manager(Arc::new(FakeExtender::default()), &clock);
        leases.track_job("a", "t", 0);

        leases.close();
        leases.close();
        assert_eq!(leases.active_job_count(), 0);

        leases.track_job("b", "t", 0);
        assert_eq!(leases.active_job_count(), 0);

        leases.start();
        assert!(!leases.is_running());
        assert!(leases.is_closed());
    }

    #[tokio::test]
    async fn test_zero_renew_time_never_starts() {
        let clock = ManualClock::new(0);
        let leases = LeaseManager::new(
            Arc::new(FakeExtender::default()),
            Arc::new(clock),
            EventBus::new(),
            "unit",
            Duration::from_millis(1_000),
            Duration::ZERO,
        );
        leases.start();
        assert!(!leases.is_running());
    }
}
