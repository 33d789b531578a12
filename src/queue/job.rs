//! Job definitions for the queue.
//!
//! This module defines the core job types:
//!
//! - `Job`: A unit of work stored in the queue
//! - `JobState`: Which state set a job currently lives in
//! - `JobOptions`: Per-job retry, retention and parent settings
//! - `JobOutcome`: Terminal result handed to `move_to_finished`

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Default number of attempts for a job (no retries).
const DEFAULT_ATTEMPTS: u32 = 1;

/// States a job can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
    Paused,
    Prioritized,
    WaitingChildren,
    Unknown,
}

impl JobState {
    /// States backed by a sorted set in the store.
    pub const INDEXED: [JobState; 8] = [
        JobState::Waiting,
        JobState::Active,
        JobState::Delayed,
        JobState::Completed,
        JobState::Failed,
        JobState::Paused,
        JobState::Prioritized,
        JobState::WaitingChildren,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "wait",
            JobState::Active => "active",
            JobState::Delayed => "delayed",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Paused => "paused",
            JobState::Prioritized => "prioritized",
            JobState::WaitingChildren => "waiting-children",
            JobState::Unknown => "unknown",
        }
    }

    /// A pending job has not been handed to a worker yet.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            JobState::Waiting | JobState::Delayed | JobState::Paused | JobState::Prioritized
        )
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" | "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "delayed" => Ok(JobState::Delayed),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "paused" => Ok(JobState::Paused),
            "prioritized" => Ok(JobState::Prioritized),
            "waiting-children" => Ok(JobState::WaitingChildren),
            "unknown" => Ok(JobState::Unknown),
            other => Err(QueueError::Corrupt {
                key: "state".to_string(),
                reason: format!("unknown job state '{}'", other),
            }),
        }
    }
}

/// What to do with a job once it reaches a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoveOnFinish {
    /// Keep every finished job.
    #[default]
    Never,
    /// Delete the job as soon as it finishes.
    Always,
    /// Keep only the newest `n` jobs in the terminal state.
    KeepLast(usize),
}

/// How a parent reacts when a child fails for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentFailurePolicy {
    /// Fail the parent.
    #[default]
    Fail,
    /// Let the parent continue as if the child completed.
    Continue,
    /// Record the failure on the parent but do not block it.
    Ignore,
    /// Drop the child from the parent's dependencies.
    Remove,
}

/// Reference to the parent of a job in a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentRef {
    pub id: String,
    pub queue: String,
    #[serde(default)]
    pub on_failure: ParentFailurePolicy,
}

/// Per-job options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    /// Custom job id. A UUID is generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Milliseconds to wait before the job becomes ready.
    #[serde(default)]
    pub delay: i64,
    /// Total attempts before the job fails for good.
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Fixed delay in milliseconds between attempts.
    #[serde(default)]
    pub backoff: i64,
    #[serde(default)]
    pub remove_on_complete: RemoveOnFinish,
    #[serde(default)]
    pub remove_on_fail: RemoveOnFinish,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentRef>,
}

fn default_attempts() -> u32 {
    DEFAULT_ATTEMPTS
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            job_id: None,
            delay: 0,
            attempts: DEFAULT_ATTEMPTS,
            backoff: 0,
            remove_on_complete: RemoveOnFinish::Never,
            remove_on_fail: RemoveOnFinish::Never,
            parent: None,
        }
    }
}

impl JobOptions {
    /// Sets a custom job id.
    pub fn with_job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Sets the initial delay in milliseconds.
    pub fn with_delay(mut self, delay_ms: i64) -> Self {
        self.delay = delay_ms.max(0);
        self
    }

    /// Sets the total number of attempts.
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Sets the fixed backoff between attempts.
    pub fn with_backoff(mut self, backoff_ms: i64) -> Self {
        self.backoff = backoff_ms.max(0);
        self
    }

    pub fn with_remove_on_complete(mut self, policy: RemoveOnFinish) -> Self {
        self.remove_on_complete = policy;
        self
    }

    pub fn with_remove_on_fail(mut self, policy: RemoveOnFinish) -> Self {
        self.remove_on_fail = policy;
        self
    }

    /// Attaches the job to a parent in a flow.
    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Terminal result of processing a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed(serde_json::Value),
    Failed(String),
}

impl JobOutcome {
    /// State the job ends up in.
    pub fn terminal_state(&self) -> JobState {
        match self {
            JobOutcome::Completed(_) => JobState::Completed,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }
}

/// A job stored in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: serde_json::Value,
    pub opts: JobOptions,
    /// Creation time in Unix milliseconds.
    pub timestamp: i64,
    /// Delay relative to `timestamp`, in milliseconds.
    pub delay: i64,
    pub state: JobState,
    /// Id of the job scheduler that produced this job.
    pub scheduler_key: Option<String>,
    pub attempts_started: u32,
    pub attempts_made: u32,
    pub stalled_counter: u32,
    pub failed_reason: Option<String>,
    pub return_value: Option<serde_json::Value>,
    pub processed_on: Option<i64>,
    pub finished_on: Option<i64>,
    /// Terminal outcome postponed until the scheduler continuation succeeds.
    pub deferred: Option<JobOutcome>,
    /// Lock token, present only on jobs handed to a worker.
    #[serde(skip)]
    pub lock_token: Option<String>,
}

impl Job {
    /// Creates a new job. It is delayed when `opts.delay` is positive,
    /// waiting otherwise.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        data: serde_json::Value,
        opts: JobOptions,
        timestamp: i64,
    ) -> Self {
        let delay = opts.delay.max(0);
        Self {
            id: id.into(),
            name: name.into(),
            data,
            opts,
            timestamp,
            delay,
            state: if delay > 0 {
                JobState::Delayed
            } else {
                JobState::Waiting
            },
            scheduler_key: None,
            attempts_started: 0,
            attempts_made: 0,
            stalled_counter: 0,
            failed_reason: None,
            return_value: None,
            processed_on: None,
            finished_on: None,
            deferred: None,
            lock_token: None,
        }
    }

    /// Time at which a delayed job becomes ready.
    pub fn ready_at(&self) -> i64 {
        self.timestamp + self.delay
    }

    /// Millisecond slot encoded in a scheduler job id (`repeat:<id>:<millis>`).
    pub fn scheduler_slot(&self) -> Option<i64> {
        self.scheduler_key.as_ref()?;
        let (_, slot) = self.id.rsplit_once(':')?;
        slot.parse().ok()
    }

    /// Whether another attempt is allowed after the current one fails.
    pub fn should_retry(&self) -> bool {
        self.attempts_made + 1 < self.opts.attempts
    }

    pub fn remaining_attempts(&self) -> u32 {
        self.opts.attempts.saturating_sub(self.attempts_made)
    }

    /// Encodes the job as Redis hash fields.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        let mut fields = vec![
            ("name", self.name.clone()),
            ("data", serde_json::to_string(&self.data)?),
            ("opts", serde_json::to_string(&self.opts)?),
            ("timestamp", self.timestamp.to_string()),
            ("delay", self.delay.to_string()),
            ("state", self.state.as_str().to_string()),
            ("attemptsStarted", self.attempts_started.to_string()),
            ("attemptsMade", self.attempts_made.to_string()),
            ("stalledCounter", self.stalled_counter.to_string()),
        ];
        if let Some(ref key) = self.scheduler_key {
            fields.push(("schedulerKey", key.clone()));
        }
        if let Some(ref reason) = self.failed_reason {
            fields.push(("failedReason", reason.clone()));
        }
        if let Some(ref value) = self.return_value {
            fields.push(("returnvalue", serde_json::to_string(value)?));
        }
        if let Some(at) = self.processed_on {
            fields.push(("processedOn", at.to_string()));
        }
        if let Some(at) = self.finished_on {
            fields.push(("finishedOn", at.to_string()));
        }
        if let Some(ref outcome) = self.deferred {
            fields.push(("deferred", serde_json::to_string(outcome)?));
        }
        Ok(fields)
    }

    /// Decodes a job from Redis hash fields.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Corrupt` when a required field is missing or a
    /// numeric field does not parse.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, QueueError> {
        let corrupt = |reason: String| QueueError::Corrupt {
            key: id.to_string(),
            reason,
        };
        let int = |name: &str| -> Result<Option<i64>, QueueError> {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse::<i64>()
                        .map_err(|_| corrupt(format!("field '{}' is not an integer: {}", name, v)))
                })
                .transpose()
        };
        let count = |name: &str| -> Result<u32, QueueError> {
            Ok(int(name)?.unwrap_or(0).clamp(0, u32::MAX as i64) as u32)
        };

        let name = fields
            .get("name")
            .cloned()
            .ok_or_else(|| corrupt("missing field 'name'".to_string()))?;
        let data = match fields.get("data") {
            Some(raw) => serde_json::from_str(raw)?,
            None => serde_json::Value::Null,
        };
        let opts = match fields.get("opts") {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobOptions::default(),
        };
        let state = match fields.get("state") {
            Some(raw) => raw.parse()?,
            None => JobState::Unknown,
        };

        Ok(Self {
            id: id.to_string(),
            name,
            data,
            opts,
            timestamp: int("timestamp")?.unwrap_or(0),
            delay: int("delay")?.unwrap_or(0),
            state,
            scheduler_key: fields.get("schedulerKey").filter(|k| !k.is_empty()).cloned(),
            attempts_started: count("attemptsStarted")?,
            attempts_made: count("attemptsMade")?,
            stalled_counter: count("stalledCounter")?,
            failed_reason: fields.get("failedReason").cloned(),
            return_value: fields
                .get("returnvalue")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?,
            processed_on: int("processedOn")?,
            finished_on: int("finishedOn")?,
            deferred: fields
                .get("deferred")
                .map(|raw| serde_json::from_str(raw))
                .transpose()?,
            lock_token: None,
        })
    }
}
