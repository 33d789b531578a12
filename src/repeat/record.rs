//! Persisted job scheduler records.
//!
//! A scheduler is stored as a hash keyed by its id plus an entry in the
//! repeat index scored by its next occurrence. Older deployments only wrote
//! the index entry, with every option packed into the member itself
//! (`name:jobId:endDate:tz:pattern`); those are read back as
//! [`StoredScheduler::Legacy`] and normalized on demand.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::QueueError;
use crate::queue::JobOptions;

use super::recurrence::RepeatOptions;

/// Data and options copied onto every job the scheduler creates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTemplate {
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub opts: JobOptions,
}

impl JobTemplate {
    pub fn new(data: serde_json::Value, opts: JobOptions) -> Self {
        Self { data, opts }
    }
}

/// One job scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSchedulerRecord {
    /// Scheduler id, or the full member for legacy entries.
    pub key: String,
    /// Name given to every produced job.
    pub name: String,
    pub pattern: Option<String>,
    pub every: Option<i64>,
    pub tz: Option<String>,
    pub utc: bool,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
    pub limit: Option<u32>,
    /// Phase of `every` slots.
    pub offset: i64,
    /// Number of jobs produced so far, including the pending one.
    pub iteration_count: u32,
    /// Millisecond slot of the current companion job.
    pub next: i64,
    pub template: JobTemplate,
}

impl JobSchedulerRecord {
    /// Options for computing the occurrence after the current one.
    pub fn repeat_options(&self) -> RepeatOptions {
        RepeatOptions {
            pattern: self.pattern.clone(),
            every: self.every,
            tz: self.tz.clone(),
            utc: self.utc,
            start_date: self.start_date,
            end_date: self.end_date,
            limit: self.limit,
            offset: Some(self.offset),
            immediately: false,
            count: self.iteration_count,
        }
    }

    /// Whether `opts` describes the same recurrence. Changing `every`, or the
    /// pattern or timezone of a cron scheduler, is a change of shape.
    pub fn same_shape(&self, opts: &RepeatOptions) -> bool {
        match (self.every, opts.every) {
            (Some(current), Some(requested)) => current == requested,
            (None, None) => self.pattern == opts.pattern && self.tz == opts.tz,
            _ => false,
        }
    }

    /// Encodes the record as Redis hash fields.
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, QueueError> {
        let mut fields = vec![
            ("key", self.key.clone()),
            ("name", self.name.clone()),
            ("utc", if self.utc { "1" } else { "0" }.to_string()),
            ("offset", self.offset.to_string()),
            ("iterationCount", self.iteration_count.to_string()),
            ("next", self.next.to_string()),
            ("template", serde_json::to_string(&self.template)?),
        ];
        if let Some(ref pattern) = self.pattern {
            fields.push(("pattern", pattern.clone()));
        }
        if let Some(every) = self.every {
            fields.push(("every", every.to_string()));
        }
        if let Some(ref tz) = self.tz {
            fields.push(("tz", tz.clone()));
        }
        if let Some(start) = self.start_date {
            fields.push(("startDate", start.to_string()));
        }
        if let Some(end) = self.end_date {
            fields.push(("endDate", end.to_string()));
        }
        if let Some(limit) = self.limit {
            fields.push(("limit", limit.to_string()));
        }
        Ok(fields)
    }

    /// Decodes a record from Redis hash fields.
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Result<Self, QueueError> {
        let int = |name: &str| -> Result<Option<i64>, QueueError> {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .map(|v| {
                    v.parse::<i64>().map_err(|_| QueueError::Corrupt {
                        key: id.to_string(),
                        reason: format!("scheduler field '{}' is not an integer: {}", name, v),
                    })
                })
                .transpose()
        };
        let template = match fields.get("template") {
            Some(raw) => serde_json::from_str(raw)?,
            None => JobTemplate::default(),
        };

        Ok(Self {
            key: fields.get("key").cloned().unwrap_or_else(|| id.to_string()),
            name: fields.get("name").cloned().unwrap_or_default(),
            pattern: fields.get("pattern").filter(|p| !p.is_empty()).cloned(),
            every: int("every")?,
            tz: fields.get("tz").filter(|t| !t.is_empty()).cloned(),
            utc: matches!(fields.get("utc").map(String::as_str), Some("1") | Some("true")),
            start_date: int("startDate")?,
            end_date: int("endDate")?,
            limit: int("limit")?.map(|l| l.clamp(0, u32::MAX as i64) as u32),
            offset: int("offset")?.unwrap_or(0),
            iteration_count: int("iterationCount")?
                .unwrap_or(0)
                .clamp(0, u32::MAX as i64) as u32,
            next: int("next")?.unwrap_or(0),
            template,
        })
    }
}

/// A scheduler as found in the repeat index.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredScheduler {
    /// Index entry backed by a record hash.
    Structured(JobSchedulerRecord),
    /// Bare index entry written before record hashes existed.
    Legacy { key: String, next: i64 },
}

impl StoredScheduler {
    /// Member of the repeat index this scheduler is stored under.
    pub fn member(&self) -> &str {
        match self {
            StoredScheduler::Structured(record) => &record.key,
            StoredScheduler::Legacy { key, .. } => key,
        }
    }

    pub fn next(&self) -> i64 {
        match self {
            StoredScheduler::Structured(record) => record.next,
            StoredScheduler::Legacy { next, .. } => *next,
        }
    }

    pub fn into_record(self) -> JobSchedulerRecord {
        match self {
            StoredScheduler::Structured(record) => record,
            StoredScheduler::Legacy { key, next } => parse_legacy_key(&key, next),
        }
    }
}

/// Parses a legacy index member `name:jobId:endDate:tz:pattern`.
///
/// Everything after the fourth separator belongs to the pattern, which may
/// itself contain colons. A purely numeric pattern is an `every` interval.
pub fn parse_legacy_key(key: &str, next: i64) -> JobSchedulerRecord {
    let parts: Vec<&str> = key.split(':').collect();
    let part = |i: usize| parts.get(i).copied().filter(|p: &&str| !p.is_empty());

    let tail = if parts.len() > 4 {
        parts[4..].join(":")
    } else {
        String::new()
    };
    let (pattern, every) = match tail.parse::<i64>() {
        Ok(every) => (None, Some(every)),
        Err(_) if tail.is_empty() => (None, None),
        Err(_) => (Some(tail), None),
    };

    JobSchedulerRecord {
        key: key.to_string(),
        name: part(0).unwrap_or_default().to_string(),
        pattern,
        every,
        tz: part(3).map(str::to_string),
        utc: false,
        start_date: None,
        end_date: part(2).and_then(|e| e.parse().ok()),
        limit: None,
        offset: 0,
        iteration_count: 0,
        next,
        template: JobTemplate::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> JobSchedulerRecord {
        JobSchedulerRecord {
            key: "nightly".to_string(),
            name: "backup".to_string(),
            pattern: Some("0 0 3 * * *".to_string()),
            every: None,
            tz: Some("Europe/Paris".to_string()),
            utc: false,
            start_date: None,
            end_date: Some(2_000_000_000_000),
            limit: Some(10),
            offset: 0,
            iteration_count: 3,
            next: 1_700_000_000_000,
            template: JobTemplate::new(serde_json::json!({"target": "s3"}), JobOptions::default()),
        }
    }

    #[test]
    fn test_record_fields_decode_to_same_record() {
        let record = sample();
        let fields: HashMap<String, String> = record
            .to_fields()
            .expect("fields should encode")
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        assert!(!fields.contains_key("every"));
        let decoded = JobSchedulerRecord::from_fields("nightly", &fields).expect("decode");
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_same_shape() {
        let record = sample();
        let same = RepeatOptions::pattern("0 0 3 * * *").with_tz("Europe/Paris");
        assert!(record.same_shape(&same));

        let other_tz = RepeatOptions::pattern("0 0 3 * * *").with_tz("UTC");
        assert!(!record.same_shape(&other_tz));
        assert!(!record.same_shape(&RepeatOptions::every(1_000)));

        let mut every = sample();
        every.pattern = None;
        every.every = Some(5_000);
        assert!(every.same_shape(&RepeatOptions::every(5_000)));
        assert!(!every.same_shape(&RepeatOptions::every(6_000)));
    }

    #[test]
    fn test_parse_legacy_pattern_key_with_colons() {
        let record = parse_legacy_key("report::1900000000000:America/New_York:0 */5 * * * *", 42);
        assert_eq!(record.name, "report");
        assert_eq!(record.end_date, Some(1_900_000_000_000));
        assert_eq!(record.tz.as_deref(), Some("America/New_York"));
        assert_eq!(record.pattern.as_deref(), Some("0 */5 * * * *"));
        assert_eq!(record.every, None);
        assert_eq!(record.next, 42);

        let record = parse_legacy_key("a:b:::x:y", 1);
        assert_eq!(record.pattern.as_deref(), Some("x:y"));
        assert_eq!(record.end_date, None);
        assert_eq!(record.tz, None);
    }

    #[test]
    fn test_parse_legacy_every_key() {
        let record = parse_legacy_key("poll::::60000", 7);
        assert_eq!(record.every, Some(60_000));
        assert_eq!(record.pattern, None);
        assert_eq!(record.key, "poll::::60000");
    }

    #[test]
    fn test_stored_scheduler_member() {
        let legacy = StoredScheduler::Legacy {
            key: "a::::1000".to_string(),
            next: 5,
        };
        assert_eq!(legacy.member(), "a::::1000");
        assert_eq!(legacy.next(), 5);
        assert_eq!(legacy.into_record().every, Some(1_000));

        let structured = StoredScheduler::Structured(sample());
        assert_eq!(structured.member(), "nightly");
    }
}
