//! In-memory store.
//!
//! Used by tests and by single-process deployments. A transaction holds the
//! state mutex from `begin` to `commit`, so transactions are serialized and
//! commits never conflict. Lock and marker expiry is evaluated against the
//! injected [`Clock`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::clock::Clock;
use crate::error::QueueError;
use crate::events::QueueEvent;
use crate::queue::job::{Job, JobState};
use crate::repeat::{JobSchedulerRecord, StoredScheduler};

use super::{rank_range, Store, Txn, Write};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events kept for `read_events` before the oldest are dropped.
const MAX_RETAINED_EVENTS: usize = 10_000;

#[derive(Debug, Default)]
struct MemoryState {
    jobs: HashMap<String, Job>,
    /// Per-state ordering: `(score, insertion sequence, job id)`.
    index: HashMap<JobState, BTreeSet<(i64, u64, String)>>,
    placement: HashMap<String, (JobState, i64, u64)>,
    seq: u64,
    /// Job id to `(token, expires_at)`.
    locks: HashMap<String, (String, i64)>,
    markers: HashMap<String, i64>,
    schedulers: HashMap<String, JobSchedulerRecord>,
    /// Repeat index member to next occurrence.
    repeat_index: HashMap<String, i64>,
    events: Vec<(u64, QueueEvent)>,
    event_seq: u64,
}

impl MemoryState {
    fn unindex(&mut self, id: &str) {
        if let Some((state, score, seq)) = self.placement.remove(id) {
            if let Some(set) = self.index.get_mut(&state) {
                set.remove(&(score, seq, id.to_string()));
            }
        }
    }

    fn apply(&mut self, write: Write, now: i64, events_tx: &broadcast::Sender<QueueEvent>) {
        match write {
            Write::PutJob { job, score } => {
                self.unindex(&job.id);
                if JobState::INDEXED.contains(&job.state) {
                    self.seq += 1;
                    let seq = self.seq;
                    self.index
                        .entry(job.state)
                        .or_default()
                        .insert((score, seq, job.id.clone()));
                    self.placement.insert(job.id.clone(), (job.state, score, seq));
                }
                let mut job = job;
                job.lock_token = None;
                self.jobs.insert(job.id.clone(), job);
            }
            Write::DeleteJob { id } => {
                self.unindex(&id);
                self.jobs.remove(&id);
                self.locks.remove(&id);
            }
            Write::PutScheduler(record) => {
                self.repeat_index.insert(record.key.clone(), record.next);
                self.schedulers.insert(record.key.clone(), record);
            }
            Write::IndexLegacyScheduler { key, next } => {
                self.repeat_index.insert(key, next);
            }
            Write::DeleteScheduler { member } => {
                self.repeat_index.remove(&member);
                self.schedulers.remove(&member);
            }
            Write::SetLock {
                job_id,
                token,
                ttl_ms,
            } => {
                self.locks
                    .insert(job_id, (token, now.saturating_add(ttl_ms as i64)));
            }
            Write::DeleteLock { job_id } => {
                self.locks.remove(&job_id);
            }
            Write::SetMarker { name, ttl_ms } => {
                self.markers.insert(name, now.saturating_add(ttl_ms as i64));
            }
            Write::Emit(event) => {
                self.event_seq += 1;
                self.events.push((self.event_seq, event.clone()));
                if self.events.len() > MAX_RETAINED_EVENTS {
                    let excess = self.events.len() - MAX_RETAINED_EVENTS;
                    self.events.drain(..excess);
                }
                let _ = events_tx.send(event);
            }
        }
    }

    fn stored_scheduler(&self, member: &str) -> Option<StoredScheduler> {
        if let Some(record) = self.schedulers.get(member) {
            return Some(StoredScheduler::Structured(record.clone()));
        }
        self.repeat_index
            .get(member)
            .map(|next| StoredScheduler::Legacy {
                key: member.to_string(),
                next: *next,
            })
    }
}

/// Store that keeps everything in process memory.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
            events_tx,
        }
    }

    /// Live feed of global events committed from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events_tx.subscribe()
    }

    /// Drops the lock on `job_id` as if its owner had died.
    pub async fn expire_lock(&self, job_id: &str) {
        self.state.lock().await.locks.remove(job_id);
    }

    /// Drops a marker as if its TTL had elapsed.
    pub async fn expire_marker(&self, name: &str) {
        self.state.lock().await.markers.remove(name);
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn Txn>, QueueError> {
        let guard = Arc::clone(&self.state).lock_owned().await;
        Ok(Box::new(MemoryTxn {
            guard,
            now: self.clock.now_millis(),
            writes: Vec::new(),
            events_tx: self.events_tx.clone(),
        }))
    }

    async fn read_events(
        &self,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, QueueEvent)>, QueueError> {
        let after = match after {
            Some(cursor) => cursor.parse::<u64>().map_err(|_| QueueError::Corrupt {
                key: "events".to_string(),
                reason: format!("invalid event cursor '{}'", cursor),
            })?,
            None => 0,
        };
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|(seq, _)| *seq > after)
            .take(count)
            .map(|(seq, event)| (seq.to_string(), event.clone()))
            .collect())
    }
}

struct MemoryTxn {
    guard: OwnedMutexGuard<MemoryState>,
    now: i64,
    writes: Vec<Write>,
    events_tx: broadcast::Sender<QueueEvent>,
}

impl MemoryTxn {
    fn ids_in(&self, state: JobState) -> impl Iterator<Item = &(i64, u64, String)> {
        self.guard.index.get(&state).into_iter().flat_map(|set| set.iter())
    }
}

#[async_trait]
impl Txn for MemoryTxn {
    async fn job(&mut self, id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.guard.jobs.get(id).cloned())
    }

    async fn lock_token(&mut self, job_id: &str) -> Result<Option<String>, QueueError> {
        Ok(self
            .guard
            .locks
            .get(job_id)
            .filter(|(_, expires_at)| *expires_at > self.now)
            .map(|(token, _)| token.clone()))
    }

    async fn jobs_in(&mut self, state: JobState, limit: usize) -> Result<Vec<String>, QueueError> {
        Ok(self
            .ids_in(state)
            .take(limit)
            .map(|(_, _, id)| id.clone())
            .collect())
    }

    async fn jobs_due(
        &mut self,
        state: JobState,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        Ok(self
            .ids_in(state)
            .take_while(|(score, _, _)| *score <= max_score)
            .take(limit)
            .map(|(_, _, id)| id.clone())
            .collect())
    }

    async fn count_in(&mut self, state: JobState) -> Result<usize, QueueError> {
        Ok(self.guard.index.get(&state).map_or(0, BTreeSet::len))
    }

    async fn scheduler(&mut self, member: &str) -> Result<Option<StoredScheduler>, QueueError> {
        Ok(self.guard.stored_scheduler(member))
    }

    async fn schedulers(
        &mut self,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<StoredScheduler>, QueueError> {
        let mut ranked: Vec<(i64, &String)> = self
            .guard
            .repeat_index
            .iter()
            .map(|(member, next)| (*next, member))
            .collect();
        ranked.sort();
        if !asc {
            ranked.reverse();
        }

        let Some((from, to)) = rank_range(ranked.len(), start, end) else {
            return Ok(Vec::new());
        };
        Ok(ranked[from..=to]
            .iter()
            .filter_map(|(_, member)| self.guard.stored_scheduler(member))
            .collect())
    }

    async fn scheduler_count(&mut self) -> Result<usize, QueueError> {
        Ok(self.guard.repeat_index.len())
    }

    async fn marker_exists(&mut self, name: &str) -> Result<bool, QueueError> {
        Ok(self
            .guard
            .markers
            .get(name)
            .is_some_and(|expires_at| *expires_at > self.now))
    }

    fn stage(&mut self, write: Write) {
        self.writes.push(write);
    }

    async fn commit(self: Box<Self>) -> Result<bool, QueueError> {
        let MemoryTxn {
            mut guard,
            now,
            writes,
            events_tx,
        } = *self;
        for write in writes {
            guard.apply(write, now, &events_tx);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::JobOptions;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new(10_000);
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    fn job(id: &str, timestamp: i64) -> Job {
        Job::new(id, "test", serde_json::Value::Null, JobOptions::default(), timestamp)
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let (store, _) = store();
        let mut tx = store.begin().await.expect("begin");
        tx.stage(Write::put_job(job("a", 1)));
        assert!(tx.job("a").await.expect("read").is_none());
        assert!(tx.commit().await.expect("commit"));

        let mut tx = store.begin().await.expect("begin");
        assert!(tx.job("a").await.expect("read").is_some());
    }

    #[tokio::test]
    async fn test_dropped_transaction_writes_nothing() {
        let (store, _) = store();
        {
            let mut tx = store.begin().await.expect("begin");
            tx.stage(Write::put_job(job("a", 1)));
        }
        let mut tx = store.begin().await.expect("begin");
        assert_eq!(tx.count_in(JobState::Waiting).await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_state_index_order_and_moves() {
        let (store, _) = store();
        let mut tx = store.begin().await.expect("begin");
        tx.stage(Write::put_job(job("late", 30)));
        tx.stage(Write::put_job(job("early", 10)));
        tx.stage(Write::put_job(job("tie", 10)));
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        assert_eq!(
            tx.jobs_in(JobState::Waiting, 10).await.expect("read"),
            vec!["early", "tie", "late"]
        );
        let mut moved = job("early", 10);
        moved.state = JobState::Active;
        moved.processed_on = Some(50);
        tx.stage(Write::put_job(moved));
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        assert_eq!(tx.count_in(JobState::Waiting).await.expect("count"), 2);
        assert_eq!(
            tx.jobs_in(JobState::Active, 10).await.expect("read"),
            vec!["early"]
        );
        assert_eq!(
            tx.jobs_due(JobState::Waiting, 10, 10).await.expect("read"),
            vec!["tie"]
        );
    }

    #[tokio::test]
    async fn test_lock_expires_with_clock() {
        let (store, clock) = store();
        let mut tx = store.begin().await.expect("begin");
        tx.stage(Write::SetLock {
            job_id: "a".to_string(),
            token: "t1".to_string(),
            ttl_ms: 1_000,
        });
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        assert_eq!(tx.lock_token("a").await.expect("read").as_deref(), Some("t1"));
        drop(tx);

        clock.advance(1_000);
        let mut tx = store.begin().await.expect("begin");
        assert_eq!(tx.lock_token("a").await.expect("read"), None);
    }

    #[tokio::test]
    async fn test_marker_ttl() {
        let (store, clock) = store();
        let mut tx = store.begin().await.expect("begin");
        assert!(!tx.marker_exists("stalled-check").await.expect("read"));
        tx.stage(Write::SetMarker {
            name: "stalled-check".to_string(),
            ttl_ms: 500,
        });
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        assert!(tx.marker_exists("stalled-check").await.expect("read"));
        drop(tx);

        clock.advance(501);
        let mut tx = store.begin().await.expect("begin");
        assert!(!tx.marker_exists("stalled-check").await.expect("read"));
    }

    #[tokio::test]
    async fn test_events_read_after_cursor() {
        let (store, _) = store();
        let mut tx = store.begin().await.expect("begin");
        for id in ["a", "b", "c"] {
            tx.stage(Write::Emit(QueueEvent::Waiting {
                job_id: id.to_string(),
            }));
        }
        tx.commit().await.expect("commit");

        let all = store.read_events(None, 10).await.expect("events");
        assert_eq!(all.len(), 3);
        let rest = store
            .read_events(Some(&all[0].0), 10)
            .await
            .expect("events");
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].1.job_id(), Some("b"));
    }

    #[tokio::test]
    async fn test_legacy_scheduler_lookup_and_ranking() {
        let (store, _) = store();
        let mut tx = store.begin().await.expect("begin");
        tx.stage(Write::IndexLegacyScheduler {
            key: "old::::1000".to_string(),
            next: 300,
        });
        tx.stage(Write::IndexLegacyScheduler {
            key: "older::::2000".to_string(),
            next: 100,
        });
        tx.commit().await.expect("commit");

        let mut tx = store.begin().await.expect("begin");
        assert!(matches!(
            tx.scheduler("old::::1000").await.expect("read"),
            Some(StoredScheduler::Legacy { next: 300, .. })
        ));
        let asc = tx.schedulers(0, -1, true).await.expect("read");
        assert_eq!(asc[0].member(), "older::::2000");
        let desc = tx.schedulers(0, 0, false).await.expect("read");
        assert_eq!(desc.len(), 1);
        assert_eq!(desc[0].member(), "old::::1000");
        assert_eq!(tx.scheduler_count().await.expect("count"), 2);
    }
}
