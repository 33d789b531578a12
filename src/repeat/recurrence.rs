//! Next-occurrence computation for job schedulers.
//!
//! Two kinds of recurrence are supported:
//!
//! - **every**: fixed interval in milliseconds. Occurrences sit on slots
//!   `k * every + offset`, so callers computing "the next one" at nearly the
//!   same instant agree on the same slot.
//! - **pattern**: a cron expression with 5 (minute precision), 6 or 7 fields,
//!   evaluated in the scheduler's timezone. Pattern evaluation goes through a
//!   [`RepeatStrategy`]; [`CronStrategy`] is the default and custom strategies
//!   can be registered per job name.
//!
//! All functions are pure: the caller supplies the reference time.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// How a scheduler repeats.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron expression.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Interval in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<i64>,
    /// IANA timezone for `pattern`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tz: Option<String>,
    /// Evaluate `pattern` in UTC regardless of `tz`.
    #[serde(default)]
    pub utc: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<i64>,
    /// Maximum number of jobs to produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    /// Phase of `every` slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<i64>,
    /// The first occurrence is the reference time itself.
    #[serde(default)]
    pub immediately: bool,
    /// Jobs produced so far.
    #[serde(default)]
    pub count: u32,
}

impl RepeatOptions {
    /// Repeats every `millis` milliseconds.
    pub fn every(millis: i64) -> Self {
        Self {
            every: Some(millis),
            ..Default::default()
        }
    }

    /// Repeats on a cron pattern.
    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            pattern: Some(pattern.into()),
            ..Default::default()
        }
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = Some(tz.into());
        self
    }

    pub fn with_utc(mut self, utc: bool) -> Self {
        self.utc = utc;
        self
    }

    pub fn with_start_date(mut self, millis: i64) -> Self {
        self.start_date = Some(millis);
        self
    }

    pub fn with_end_date(mut self, millis: i64) -> Self {
        self.end_date = Some(millis);
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_immediately(mut self, immediately: bool) -> Self {
        self.immediately = immediately;
        self
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    /// Checks option combinations that no strategy can satisfy.
    ///
    /// # Errors
    ///
    /// - `PatternAndEvery` / `MissingPatternOrEvery` unless exactly one is set
    /// - `ImmediatelyAndStartDate` when both are set
    /// - `ZeroEvery` when the interval is not positive
    pub fn validate(&self) -> Result<(), SchedulerError> {
        match (&self.pattern, self.every) {
            (Some(_), Some(_)) => return Err(SchedulerError::PatternAndEvery),
            (None, None) => return Err(SchedulerError::MissingPatternOrEvery),
            (None, Some(every)) if every <= 0 => return Err(SchedulerError::ZeroEvery),
            _ => {}
        }
        if self.immediately && self.start_date.is_some() {
            return Err(SchedulerError::ImmediatelyAndStartDate);
        }
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.limit.is_some_and(|limit| self.count >= limit)
    }

    /// Whether an occurrence at `at` is still within `limit` and `end_date`.
    pub fn admits(&self, at: i64) -> bool {
        !self.limit_reached() && self.end_date.map_or(true, |end| at <= end)
    }
}

/// Computes the next occurrence of a pattern-based recurrence.
pub trait RepeatStrategy: Send + Sync + std::fmt::Debug {
    /// Returns the first occurrence strictly after `reference`, or `None`
    /// when the pattern has no further occurrence.
    fn next(
        &self,
        reference: i64,
        opts: &RepeatOptions,
        job_name: &str,
    ) -> Result<Option<i64>, SchedulerError>;

    /// Rejects options this strategy cannot evaluate.
    fn validate(&self, _opts: &RepeatOptions) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// Cron expressions via the `cron` crate.
///
/// Five-field expressions get a zero seconds field prepended. Day-of-week
/// numbering follows the `cron` crate (1 = Sunday); names (`MON`) are
/// unambiguous.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronStrategy;

impl CronStrategy {
    /// Parses a 5, 6 or 7 field cron expression.
    pub fn parse(pattern: &str) -> Result<Schedule, SchedulerError> {
        let normalized = if pattern.split_whitespace().count() == 5 {
            format!("0 {}", pattern.trim())
        } else {
            pattern.trim().to_string()
        };
        Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })
    }

    /// Timezone the pattern is evaluated in.
    pub fn timezone(opts: &RepeatOptions) -> Result<Tz, SchedulerError> {
        match opts.tz.as_deref() {
            Some(tz) if !opts.utc => parse_timezone(tz),
            _ => Ok(chrono_tz::UTC),
        }
    }
}

impl RepeatStrategy for CronStrategy {
    fn next(
        &self,
        reference: i64,
        opts: &RepeatOptions,
        _job_name: &str,
    ) -> Result<Option<i64>, SchedulerError> {
        let pattern = opts
            .pattern
            .as_deref()
            .ok_or(SchedulerError::MissingPatternOrEvery)?;
        let schedule = Self::parse(pattern)?;
        let tz = Self::timezone(opts)?;

        let from = opts.start_date.map_or(reference, |start| start.max(reference));
        let Some(from) = Utc.timestamp_millis_opt(from).single() else {
            return Ok(None);
        };

        Ok(schedule
            .after(&from.with_timezone(&tz))
            .next()
            .map(|at| at.timestamp_millis()))
    }

    fn validate(&self, opts: &RepeatOptions) -> Result<(), SchedulerError> {
        if let Some(ref pattern) = opts.pattern {
            Self::parse(pattern)?;
        }
        Self::timezone(opts)?;
        Ok(())
    }
}

fn parse_timezone(tz: &str) -> Result<Tz, SchedulerError> {
    tz.parse::<Tz>()
        .map_err(|_| SchedulerError::InvalidTimezone(tz.to_string()))
}

/// Computes scheduler occurrences.
#[derive(Debug, Clone)]
pub struct RecurrenceCalculator {
    default_strategy: Arc<dyn RepeatStrategy>,
    strategies: HashMap<String, Arc<dyn RepeatStrategy>>,
}

impl Default for RecurrenceCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl RecurrenceCalculator {
    /// Creates a calculator that evaluates every pattern with [`CronStrategy`].
    pub fn new() -> Self {
        Self {
            default_strategy: Arc::new(CronStrategy),
            strategies: HashMap::new(),
        }
    }

    /// Uses `strategy` for patterns of jobs named `job_name`.
    pub fn with_strategy(
        mut self,
        job_name: impl Into<String>,
        strategy: Arc<dyn RepeatStrategy>,
    ) -> Self {
        self.strategies.insert(job_name.into(), strategy);
        self
    }

    /// Replaces the strategy used for job names without a specific one.
    pub fn with_default_strategy(mut self, strategy: Arc<dyn RepeatStrategy>) -> Self {
        self.default_strategy = strategy;
        self
    }

    fn strategy_for(&self, job_name: &str) -> &dyn RepeatStrategy {
        self.strategies
            .get(job_name)
            .unwrap_or(&self.default_strategy)
            .as_ref()
    }

    /// Rejects invalid options before anything is stored.
    ///
    /// # Errors
    ///
    /// Any configuration variant of `SchedulerError`.
    pub fn validate(&self, opts: &RepeatOptions, job_name: &str) -> Result<(), SchedulerError> {
        opts.validate()?;
        if let Some(ref tz) = opts.tz {
            parse_timezone(tz)?;
        }
        if opts.pattern.is_some() {
            self.strategy_for(job_name).validate(opts)?;
        }
        Ok(())
    }

    /// Next occurrence after `reference`, or `None` once the recurrence is
    /// exhausted (`limit` reached or past `end_date`).
    pub fn next(
        &self,
        reference: i64,
        opts: &RepeatOptions,
        job_name: &str,
    ) -> Result<Option<i64>, SchedulerError> {
        opts.validate()?;
        if opts.limit_reached() {
            return Ok(None);
        }

        let next = match opts.every {
            Some(every) => next_every_slot(reference, every, opts),
            None if opts.immediately => Some(reference),
            None => self.strategy_for(job_name).next(reference, opts, job_name)?,
        };

        Ok(next.filter(|at| opts.end_date.map_or(true, |end| *at <= end)))
    }

    /// Occurrence of a new or restarted scheduler. Interval schedulers run at
    /// once unless `start_date` lies in the future.
    pub fn first_occurrence(
        &self,
        now: i64,
        opts: &RepeatOptions,
        job_name: &str,
    ) -> Result<Option<i64>, SchedulerError> {
        let mut opts = opts.clone();
        if opts.every.is_some() && opts.start_date.map_or(true, |start| start <= now) {
            opts.start_date = None;
            opts.immediately = true;
        }
        self.next(now, &opts, job_name)
    }

    /// Occurrence after the job at `slot` finished. Slots that are already
    /// in the past are skipped.
    pub fn following_occurrence(
        &self,
        now: i64,
        slot: i64,
        opts: &RepeatOptions,
        job_name: &str,
    ) -> Result<Option<i64>, SchedulerError> {
        let mut opts = opts.clone();
        opts.immediately = false;

        if opts.every.is_none() {
            return self.next(slot.max(now), &opts, job_name);
        }
        match self.next(slot, &opts, job_name)? {
            Some(at) if at < now => self.next(now - 1, &opts, job_name),
            other => Ok(other),
        }
    }
}

/// `None` when the slot is not representable in Unix milliseconds.
fn next_every_slot(reference: i64, every: i64, opts: &RepeatOptions) -> Option<i64> {
    if let Some(start) = opts.start_date.filter(|start| *start > reference) {
        return Some(start);
    }
    if opts.immediately {
        return Some(reference);
    }
    let offset = opts.offset.unwrap_or(0).rem_euclid(every);
    reference
        .checked_sub(offset)?
        .div_euclid(every)
        .checked_mul(every)?
        .checked_add(offset)?
        .checked_add(every)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2017-02-07T15:24:00Z
    const FEB_7_2017: i64 = 1_486_481_040_000;

    fn calc() -> RecurrenceCalculator {
        RecurrenceCalculator::new()
    }

    #[test]
    fn test_six_field_pattern_seconds() {
        let next = calc()
            .next(FEB_7_2017, &RepeatOptions::pattern("*/2 * * * * *"), "tick")
            .expect("valid pattern");
        assert_eq!(next, Some(1_486_481_042_000));
    }

    #[test]
    fn test_five_field_pattern_gets_seconds() {
        let next = calc()
            .next(FEB_7_2017, &RepeatOptions::pattern("*/5 * * * *"), "tick")
            .expect("valid pattern");
        assert_eq!(next, Some(1_486_481_100_000));
    }

    #[test]
    fn test_pattern_is_strictly_after_reference() {
        let opts = RepeatOptions::pattern("0 * * * * *");
        let next = calc().next(FEB_7_2017, &opts, "tick").expect("valid");
        assert_eq!(next, Some(FEB_7_2017 + 60_000));
    }

    #[test]
    fn test_pattern_in_timezone() {
        // 2024-01-15T12:00:00Z is 07:00 in New York (EST)
        let opts = RepeatOptions::pattern("0 0 9 * * *").with_tz("America/New_York");
        let next = calc().next(1_705_320_000_000, &opts, "report").expect("valid");
        assert_eq!(next, Some(1_705_327_200_000));

        // 2024-07-15T12:00:00Z is 08:00 in New York (EDT)
        let next = calc().next(1_721_044_800_000, &opts, "report").expect("valid");
        assert_eq!(next, Some(1_721_048_400_000));

        let utc = opts.clone().with_utc(true);
        let next = calc().next(1_705_320_000_000, &utc, "report").expect("valid");
        assert_eq!(next, Some(1_705_320_000_000 + 86_400_000 - 3 * 3_600_000));
    }

    #[test]
    fn test_pattern_respects_start_date() {
        let opts = RepeatOptions::pattern("0 * * * * *").with_start_date(FEB_7_2017 + 600_000);
        let next = calc().next(FEB_7_2017, &opts, "tick").expect("valid");
        assert_eq!(next, Some(FEB_7_2017 + 660_000));
    }

    #[test]
    fn test_every_aligns_to_slots() {
        let opts = RepeatOptions::every(1_000);
        assert_eq!(calc().next(1_500, &opts, "t").expect("valid"), Some(2_000));
        assert_eq!(calc().next(1_999, &opts, "t").expect("valid"), Some(2_000));
        assert_eq!(calc().next(2_000, &opts, "t").expect("valid"), Some(3_000));

        let shifted = opts.with_offset(250);
        assert_eq!(calc().next(1_500, &shifted, "t").expect("valid"), Some(2_250));
        assert_eq!(calc().next(1_100, &shifted, "t").expect("valid"), Some(1_250));
    }

    #[test]
    fn test_every_future_start_date_returned_as_is() {
        let opts = RepeatOptions::every(1_000).with_start_date(10_123);
        assert_eq!(calc().next(5_000, &opts, "t").expect("valid"), Some(10_123));
    }

    #[test]
    fn test_immediately_returns_reference() {
        let opts = RepeatOptions::every(1_000).with_immediately(true);
        assert_eq!(calc().next(1_234, &opts, "t").expect("valid"), Some(1_234));

        let opts = RepeatOptions::pattern("0 0 * * * *").with_immediately(true);
        assert_eq!(calc().next(1_234, &opts, "t").expect("valid"), Some(1_234));
    }

    #[test]
    fn test_end_date_and_limit_exhaust() {
        let opts = RepeatOptions::every(1_000).with_end_date(2_500);
        assert_eq!(calc().next(1_500, &opts, "t").expect("valid"), Some(2_000));
        assert_eq!(calc().next(2_000, &opts, "t").expect("valid"), None);

        let opts = RepeatOptions::every(1_000).with_limit(2).with_count(2);
        assert_eq!(calc().next(0, &opts, "t").expect("valid"), None);
        let opts = opts.with_count(1);
        assert_eq!(calc().next(0, &opts, "t").expect("valid"), Some(1_000));
    }

    #[test]
    fn test_every_slot_out_of_range_is_exhausted() {
        let opts = RepeatOptions::every(1_000);
        assert_eq!(calc().next(i64::MAX - 10, &opts, "t").expect("valid"), None);

        let huge = RepeatOptions::every(i64::MAX);
        assert_eq!(calc().next(1_000, &huge, "t").expect("valid"), Some(i64::MAX));
        assert_eq!(calc().next(i64::MAX, &huge, "t").expect("valid"), None);
    }

    #[test]
    fn test_configuration_errors() {
        let both = RepeatOptions {
            pattern: Some("* * * * * *".to_string()),
            every: Some(1_000),
            ..Default::default()
        };
        assert!(matches!(
            calc().validate(&both, "t"),
            Err(SchedulerError::PatternAndEvery)
        ));
        assert!(matches!(
            calc().validate(&RepeatOptions::default(), "t"),
            Err(SchedulerError::MissingPatternOrEvery)
        ));

        let immediate = RepeatOptions::every(1_000)
            .with_immediately(true)
            .with_start_date(5);
        assert!(matches!(
            calc().validate(&immediate, "t"),
            Err(SchedulerError::ImmediatelyAndStartDate)
        ));
        assert!(matches!(
            calc().validate(&RepeatOptions::pattern("not a cron"), "t"),
            Err(SchedulerError::InvalidPattern { .. })
        ));
        assert!(matches!(
            calc().validate(&RepeatOptions::pattern("* * * * *").with_tz("Mars/Olympus"), "t"),
            Err(SchedulerError::InvalidTimezone(_))
        ));
        assert!(matches!(
            calc().validate(&RepeatOptions::every(0), "t"),
            Err(SchedulerError::ZeroEvery)
        ));
    }

    #[test]
    fn test_first_occurrence() {
        let every = RepeatOptions::every(60_000);
        assert_eq!(
            calc().first_occurrence(1_234, &every, "t").expect("valid"),
            Some(1_234)
        );

        let later = RepeatOptions::every(60_000).with_start_date(100_000);
        assert_eq!(
            calc().first_occurrence(1_234, &later, "t").expect("valid"),
            Some(100_000)
        );

        let past = RepeatOptions::every(60_000).with_start_date(1_000);
        assert_eq!(
            calc().first_occurrence(1_234, &past, "t").expect("valid"),
            Some(1_234)
        );

        let pattern = RepeatOptions::pattern("0 * * * * *");
        assert_eq!(
            calc().first_occurrence(FEB_7_2017, &pattern, "t").expect("valid"),
            Some(FEB_7_2017 + 60_000)
        );
    }

    #[test]
    fn test_following_occurrence_catches_up() {
        let opts = RepeatOptions::every(1_000).with_offset(234);
        assert_eq!(
            calc()
                .following_occurrence(1_500, 1_234, &opts, "t")
                .expect("valid"),
            Some(2_234)
        );
        // Worker was down for a while: skip the slots that already passed.
        assert_eq!(
            calc()
                .following_occurrence(9_000, 1_234, &opts, "t")
                .expect("valid"),
            Some(9_234)
        );
        assert_eq!(
            calc()
                .following_occurrence(9_234, 1_234, &opts, "t")
                .expect("valid"),
            Some(9_234)
        );

        let pattern = RepeatOptions::pattern("0 * * * * *");
        assert_eq!(
            calc()
                .following_occurrence(FEB_7_2017 + 125_000, FEB_7_2017, &pattern, "t")
                .expect("valid"),
            Some(FEB_7_2017 + 180_000)
        );
    }

    #[derive(Debug)]
    struct FixedStep(i64);

    impl RepeatStrategy for FixedStep {
        fn next(
            &self,
            reference: i64,
            _opts: &RepeatOptions,
            _job_name: &str,
        ) -> Result<Option<i64>, SchedulerError> {
            Ok(Some(reference + self.0))
        }
    }

    #[test]
    fn test_custom_strategy_per_job_name() {
        let calc = RecurrenceCalculator::new().with_strategy("custom", Arc::new(FixedStep(7)));
        let opts = RepeatOptions::pattern("anything goes");

        assert_eq!(calc.next(100, &opts, "custom").expect("custom"), Some(107));
        assert!(calc.validate(&opts, "custom").is_ok());
        assert!(calc.next(100, &opts, "other").is_err());
    }
}
