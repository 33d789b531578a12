//! Scheduler continuation under store failures.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use recurq::queue::{scheduler_job_id, Store, Txn};
use recurq::repeat::continuation::CONTINUATION_FAILED;
use recurq::repeat::{ContinuationConfig, FinishOutcome};
use recurq::{
    EventBus, JobOutcome, JobState, JobTemplate, ManualClock, MemoryStore, Queue, QueueError,
    QueueEvent, RepeatOptions, SchedulerContinuation,
};

const NOW: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Transient,
    Permanent,
}

/// Memory store whose next `failures` transactions cannot be opened.
#[derive(Debug)]
struct FlakyStore {
    inner: MemoryStore,
    failures: AtomicU32,
    kind: Failure,
}

impl FlakyStore {
    fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn Txn>, QueueError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(match self.kind {
                Failure::Transient => QueueError::Unavailable("connection reset".into()),
                Failure::Permanent => QueueError::Corrupt {
                    key: "repeat".into(),
                    reason: "garbled".into(),
                },
            });
        }
        self.inner.begin().await
    }

    async fn read_events(
        &self,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, QueueEvent)>, QueueError> {
        self.inner.read_events(after, count).await
    }
}

struct Harness {
    queue: Queue,
    store: Arc<FlakyStore>,
    clock: ManualClock,
    bus: EventBus,
    continuation: SchedulerContinuation,
}

async fn harness(kind: Failure) -> Harness {
    let clock = ManualClock::new(NOW);
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(Arc::new(clock.clone())),
        failures: AtomicU32::new(0),
        kind,
    });
    let queue = Queue::new("continuation", store.clone(), Arc::new(clock.clone()));
    let bus = EventBus::new();
    let config = ContinuationConfig::default()
        .with_max_attempts(3)
        .with_base_delay(Duration::from_millis(100))
        .with_retry_delay(Duration::from_secs(5));
    let continuation = SchedulerContinuation::new(queue.clone(), bus.clone(), config);

    queue
        .upsert_job_scheduler("s", RepeatOptions::every(1_000), "tick", JobTemplate::default())
        .await
        .unwrap();

    Harness {
        queue,
        store,
        clock,
        bus,
        continuation,
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let h = harness(Failure::Transient).await;
    let job = h.queue.take_next("tok", 30_000).await.unwrap().unwrap();

    h.store.fail_next(2);
    let outcome = h
        .continuation
        .finish(&job, JobOutcome::Completed(serde_json::json!(1)), Some("tok"))
        .await
        .unwrap();

    assert!(!outcome.is_deferred());
    assert_eq!(outcome.job().state, JobState::Completed);
    let next = h
        .queue
        .get_job(&scheduler_job_id("s", NOW + 1_000))
        .await
        .unwrap();
    assert!(next.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_defer_the_outcome() {
    let h = harness(Failure::Transient).await;
    let mut events = h.bus.subscribe();
    let job = h.queue.take_next("tok", 30_000).await.unwrap().unwrap();

    h.store.fail_next(3);
    let outcome = h
        .continuation
        .finish(&job, JobOutcome::Completed(serde_json::json!("done")), Some("tok"))
        .await
        .unwrap();

    let FinishOutcome::Deferred(deferred) = outcome else {
        panic!("expected the outcome to be deferred");
    };
    assert_eq!(deferred.state, JobState::Delayed);
    assert_eq!(
        deferred.deferred,
        Some(JobOutcome::Completed(serde_json::json!("done")))
    );

    match events.try_recv().unwrap() {
        QueueEvent::Error { message } => {
            assert!(message.starts_with(CONTINUATION_FAILED));
            assert!(message.contains(&job.id));
        }
        other => panic!("unexpected event {:?}", other),
    }

    // Not promoted to waiting: only a deferred claim picks it up.
    h.clock.advance(5_000);
    assert_eq!(h.queue.promote_delayed(100).await.unwrap(), 0);
    let claimed = h
        .queue
        .claim_deferred("tok-2", 30_000)
        .await
        .unwrap()
        .expect("deferred job is due");
    assert_eq!(claimed.id, job.id);

    let outcome = claimed.deferred.clone().unwrap();
    let finished = h
        .continuation
        .finish(&claimed, outcome, Some("tok-2"))
        .await
        .unwrap();
    assert!(!finished.is_deferred());
    assert_eq!(finished.job().state, JobState::Completed);
    assert!(finished.job().deferred.is_none());

    let record = h.queue.get_job_scheduler("s").await.unwrap().unwrap();
    assert_eq!(record.iteration_count, 2);
    assert!(record.next > NOW);
    let counts = h.queue.job_counts().await.unwrap();
    assert_eq!(counts[&JobState::Waiting] + counts[&JobState::Delayed], 1);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_failure_still_finishes_the_job() {
    let h = harness(Failure::Permanent).await;
    let mut events = h.bus.subscribe();
    let job = h.queue.take_next("tok", 30_000).await.unwrap().unwrap();

    h.store.fail_next(1);
    let outcome = h
        .continuation
        .finish(&job, JobOutcome::Failed("boom".into()), Some("tok"))
        .await
        .unwrap();

    assert!(!outcome.is_deferred());
    assert_eq!(outcome.job().state, JobState::Failed);
    assert_eq!(outcome.job().failed_reason.as_deref(), Some("boom"));
    assert!(matches!(
        events.try_recv().unwrap(),
        QueueEvent::Error { .. }
    ));

    // The scheduler did not advance.
    let record = h.queue.get_job_scheduler("s").await.unwrap().unwrap();
    assert_eq!(record.next, NOW);
    assert!(h
        .queue
        .get_job(&scheduler_job_id("s", NOW + 1_000))
        .await
        .unwrap()
        .is_none());
}
