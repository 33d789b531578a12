//! Redis store.
//!
//! Transactions run on a dedicated connection: each read first `WATCH`es the
//! keys it touches, staged writes are sent as one `MULTI`/`EXEC` pipeline, and
//! an aborted `EXEC` (nil reply) reports a conflict. Plain reads outside
//! transactions share a [`ConnectionManager`], which reconnects on its own.

use std::collections::HashMap;

use ::redis::aio::{Connection, ConnectionManager};
use ::redis::{AsyncCommands, Pipeline};
use async_trait::async_trait;

use crate::error::QueueError;
use crate::events::QueueEvent;
use crate::queue::job::{Job, JobState};
use crate::queue::keys::QueueKeys;
use crate::repeat::{JobSchedulerRecord, StoredScheduler};

use super::{Store, Txn, Write};

/// Approximate cap on the length of the events stream.
const EVENTS_MAX_LEN: usize = 10_000;

/// Store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: ::redis::Client,
    redis: ConnectionManager,
    keys: QueueKeys,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `keys` - Key layout of the queue
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, keys: QueueKeys) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self {
            client,
            redis,
            keys,
        })
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn begin(&self) -> Result<Box<dyn Txn>, QueueError> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;
        Ok(Box::new(RedisTxn {
            conn,
            keys: self.keys.clone(),
            writes: Vec::new(),
        }))
    }

    async fn read_events(
        &self,
        after: Option<&str>,
        count: usize,
    ) -> Result<Vec<(String, QueueEvent)>, QueueError> {
        let mut conn = self.redis.clone();
        let start = match after {
            Some(cursor) => format!("({}", cursor),
            None => "-".to_string(),
        };
        let entries: Vec<(String, Vec<String>)> = ::redis::cmd("XRANGE")
            .arg(self.keys.events())
            .arg(start)
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        let mut events = Vec::with_capacity(entries.len());
        for (id, fields) in entries {
            let payload = fields
                .chunks(2)
                .find(|pair| pair.first().map(String::as_str) == Some("event"))
                .and_then(|pair| pair.get(1));
            if let Some(payload) = payload {
                events.push((id, serde_json::from_str(payload)?));
            }
        }
        Ok(events)
    }
}

struct RedisTxn {
    conn: Connection,
    keys: QueueKeys,
    writes: Vec<Write>,
}

impl RedisTxn {
    async fn watch(&mut self, keys: &[String]) -> Result<(), QueueError> {
        ::redis::cmd("WATCH")
            .arg(keys)
            .query_async::<_, ()>(&mut self.conn)
            .await?;
        Ok(())
    }

    async fn hash(&mut self, key: &str) -> Result<HashMap<String, String>, QueueError> {
        let fields: HashMap<String, String> = self.conn.hgetall(key).await?;
        Ok(fields)
    }

    fn queue_write(&self, pipe: &mut Pipeline, write: Write) -> Result<(), QueueError> {
        let keys = &self.keys;
        match write {
            Write::PutJob { job, score } => {
                let key = keys.job(&job.id);
                pipe.del(&key).ignore();
                pipe.hset_multiple(&key, &job.to_fields()?).ignore();
                for state in JobState::INDEXED {
                    pipe.zrem(keys.state(state), &job.id).ignore();
                }
                if JobState::INDEXED.contains(&job.state) {
                    pipe.zadd(keys.state(job.state), &job.id, score).ignore();
                }
            }
            Write::DeleteJob { id } => {
                pipe.del(keys.job(&id)).ignore();
                pipe.del(keys.lock(&id)).ignore();
                for state in JobState::INDEXED {
                    pipe.zrem(keys.state(state), &id).ignore();
                }
            }
            Write::PutScheduler(record) => {
                let key = keys.scheduler(&record.key);
                pipe.del(&key).ignore();
                pipe.hset_multiple(&key, &record.to_fields()?).ignore();
                pipe.zadd(keys.repeat(), &record.key, record.next).ignore();
            }
            Write::IndexLegacyScheduler { key, next } => {
                pipe.zadd(keys.repeat(), key, next).ignore();
            }
            Write::DeleteScheduler { member } => {
                pipe.del(keys.scheduler(&member)).ignore();
                pipe.zrem(keys.repeat(), &member).ignore();
            }
            Write::SetLock {
                job_id,
                token,
                ttl_ms,
            } => {
                pipe.cmd("SET")
                    .arg(keys.lock(&job_id))
                    .arg(token)
                    .arg("PX")
                    .arg(ttl_ms.max(1))
                    .ignore();
            }
            Write::DeleteLock { job_id } => {
                pipe.del(keys.lock(&job_id)).ignore();
            }
            Write::SetMarker { name, ttl_ms } => {
                pipe.cmd("SET")
                    .arg(keys.marker(&name))
                    .arg(1)
                    .arg("PX")
                    .arg(ttl_ms.max(1))
                    .ignore();
            }
            Write::Emit(event) => {
                pipe.cmd("XADD")
                    .arg(keys.events())
                    .arg("MAXLEN")
                    .arg("~")
                    .arg(EVENTS_MAX_LEN)
                    .arg("*")
                    .arg("event")
                    .arg(serde_json::to_string(&event)?)
                    .ignore();
            }
        }
        Ok(())
    }

    async fn stored_scheduler(
        &mut self,
        member: &str,
    ) -> Result<Option<StoredScheduler>, QueueError> {
        let fields = self.hash(&self.keys.scheduler(member)).await?;
        if !fields.is_empty() {
            return Ok(Some(StoredScheduler::Structured(
                JobSchedulerRecord::from_fields(member, &fields)?,
            )));
        }
        let score: Option<f64> = self.conn.zscore(self.keys.repeat(), member).await?;
        Ok(score.map(|next| StoredScheduler::Legacy {
            key: member.to_string(),
            next: next as i64,
        }))
    }
}

#[async_trait]
impl Txn for RedisTxn {
    async fn job(&mut self, id: &str) -> Result<Option<Job>, QueueError> {
        let key = self.keys.job(id);
        self.watch(&[key.clone()]).await?;
        let fields = self.hash(&key).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(Job::from_fields(id, &fields)?))
    }

    async fn lock_token(&mut self, job_id: &str) -> Result<Option<String>, QueueError> {
        let key = self.keys.lock(job_id);
        self.watch(&[key.clone()]).await?;
        let token: Option<String> = self.conn.get(&key).await?;
        Ok(token)
    }

    async fn jobs_in(&mut self, state: JobState, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.state(state);
        self.watch(&[key.clone()]).await?;
        let stop = isize::try_from(limit).map_or(-1, |l| l - 1);
        let ids: Vec<String> = self.conn.zrange(&key, 0, stop).await?;
        Ok(ids)
    }

    async fn jobs_due(
        &mut self,
        state: JobState,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let key = self.keys.state(state);
        self.watch(&[key.clone()]).await?;
        let ids: Vec<String> = self
            .conn
            .zrangebyscore_limit(&key, "-inf", max_score, 0, limit as isize)
            .await?;
        Ok(ids)
    }

    async fn count_in(&mut self, state: JobState) -> Result<usize, QueueError> {
        let key = self.keys.state(state);
        self.watch(&[key.clone()]).await?;
        let count: usize = self.conn.zcard(&key).await?;
        Ok(count)
    }

    async fn scheduler(&mut self, member: &str) -> Result<Option<StoredScheduler>, QueueError> {
        self.watch(&[self.keys.scheduler(member), self.keys.repeat()])
            .await?;
        self.stored_scheduler(member).await
    }

    async fn schedulers(
        &mut self,
        start: isize,
        end: isize,
        asc: bool,
    ) -> Result<Vec<StoredScheduler>, QueueError> {
        let repeat = self.keys.repeat();
        self.watch(&[repeat.clone()]).await?;
        let members: Vec<String> = if asc {
            self.conn.zrange(&repeat, start, end).await?
        } else {
            self.conn.zrevrange(&repeat, start, end).await?
        };

        let mut schedulers = Vec::with_capacity(members.len());
        for member in members {
            self.watch(&[self.keys.scheduler(&member)]).await?;
            if let Some(stored) = self.stored_scheduler(&member).await? {
                schedulers.push(stored);
            }
        }
        Ok(schedulers)
    }

    async fn scheduler_count(&mut self) -> Result<usize, QueueError> {
        let repeat = self.keys.repeat();
        self.watch(&[repeat.clone()]).await?;
        let count: usize = self.conn.zcard(&repeat).await?;
        Ok(count)
    }

    async fn marker_exists(&mut self, name: &str) -> Result<bool, QueueError> {
        let key = self.keys.marker(name);
        self.watch(&[key.clone()]).await?;
        let exists: bool = self.conn.exists(&key).await?;
        Ok(exists)
    }

    fn stage(&mut self, write: Write) {
        self.writes.push(write);
    }

    async fn commit(mut self: Box<Self>) -> Result<bool, QueueError> {
        if self.writes.is_empty() {
            ::redis::cmd("UNWATCH")
                .query_async::<_, ()>(&mut self.conn)
                .await?;
            return Ok(true);
        }

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for write in std::mem::take(&mut self.writes) {
            self.queue_write(&mut pipe, write)?;
        }

        let reply: Option<::redis::Value> = pipe.query_async(&mut self.conn).await?;
        Ok(reply.is_some())
    }
}
