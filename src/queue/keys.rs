//! Redis key layout.
//!
//! Every key of a queue lives under `<prefix>:<queue>`:
//!
//! | key                      | type          | content                        |
//! |--------------------------|---------------|--------------------------------|
//! | `<base>:<jobId>`         | hash          | job fields                     |
//! | `<base>:<jobId>:lock`    | string, PX    | lock token                     |
//! | `<base>:<state>`         | zset          | job ids per state              |
//! | `<base>:repeat`          | zset          | scheduler id or legacy key     |
//! | `<base>:repeat:<id>`     | hash          | scheduler record               |
//! | `<base>:stalled-check`   | string, PX    | sweep marker                   |
//! | `<base>:events`          | stream        | global events                  |

use super::job::JobState;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "recurq";

/// Name of the marker that guards the stalled-job sweep.
pub const STALLED_CHECK_MARKER: &str = "stalled-check";

/// Builds the id of the job a scheduler creates for the occurrence at `millis`.
pub fn scheduler_job_id(scheduler_id: &str, millis: i64) -> String {
    format!("repeat:{}:{}", scheduler_id, millis)
}

/// Key builder for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    queue: String,
    base: String,
}

impl QueueKeys {
    pub fn new(prefix: &str, queue: &str) -> Self {
        Self {
            queue: queue.to_string(),
            base: format!("{}:{}", prefix, queue),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    pub fn job(&self, job_id: &str) -> String {
        format!("{}:{}", self.base, job_id)
    }

    pub fn lock(&self, job_id: &str) -> String {
        format!("{}:{}:lock", self.base, job_id)
    }

    pub fn state(&self, state: JobState) -> String {
        format!("{}:{}", self.base, state.as_str())
    }

    /// Index of schedulers ordered by their next occurrence.
    pub fn repeat(&self) -> String {
        format!("{}:repeat", self.base)
    }

    pub fn scheduler(&self, scheduler_id: &str) -> String {
        format!("{}:repeat:{}", self.base, scheduler_id)
    }

    pub fn marker(&self, name: &str) -> String {
        format!("{}:{}", self.base, name)
    }

    pub fn events(&self) -> String {
        format!("{}:events", self.base)
    }
}

impl Default for QueueKeys {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, "default")
    }
}
