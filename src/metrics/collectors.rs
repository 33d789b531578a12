//! High-level interface for recording queue metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so call sites only
//! pass the queue name and the values. Every method is a no-op until
//! `init_metrics()` has run.

use super::prometheus::{queue_metrics, QueueMetrics};

/// Metrics collector for recording recurq operational metrics.
///
/// # Example
///
/// ```ignore
/// use recurq::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_job_finished("mail", "completed", 0.25);
/// collector.record_stalled("mail", "requeued");
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    fn with(&self, record: impl FnOnce(&QueueMetrics)) {
        if let Some(metrics) = queue_metrics() {
            record(metrics);
        }
    }

    /// Record a job reaching a terminal state.
    ///
    /// # Arguments
    ///
    /// * `queue` - Queue name
    /// * `status` - `completed` or `failed`
    /// * `duration_secs` - Time the processor spent on the job
    pub fn record_job_finished(&self, queue: &str, status: &str, duration_secs: f64) {
        self.with(|m| {
            m.jobs_finished.with_label_values(&[queue, status]).inc();
            m.job_duration
                .with_label_values(&[queue])
                .observe(duration_secs);
        });

        tracing::trace!(
            queue = queue,
            status = status,
            duration_secs = duration_secs,
            "Recorded job finished metric"
        );
    }

    /// Record a stalled job and what the sweeper did with it.
    pub fn record_stalled(&self, queue: &str, action: &str) {
        self.with(|m| m.stalled_jobs.with_label_values(&[queue, action]).inc());
    }

    pub fn record_lock_renewal_failures(&self, queue: &str, count: usize) {
        if count == 0 {
            return;
        }
        self.with(|m| {
            m.lock_renewal_failures
                .with_label_values(&[queue])
                .inc_by(count as f64)
        });
    }

    pub fn record_continuation_failure(&self, queue: &str) {
        self.with(|m| m.continuation_failures.with_label_values(&[queue]).inc());
    }

    pub fn record_scheduler_upsert(&self, queue: &str) {
        self.with(|m| m.scheduler_upserts.with_label_values(&[queue]).inc());
    }

    /// Update the number of jobs this process is holding locks for.
    pub fn update_active_jobs(&self, queue: &str, count: usize) {
        self.with(|m| m.active_jobs.with_label_values(&[queue]).set(count as f64));

        tracing::trace!(queue = queue, count = count, "Updated active jobs metric");
    }

    /// Update the number of jobs in one state.
    pub fn update_queue_depth(&self, queue: &str, state: &str, depth: usize) {
        self.with(|m| {
            m.queue_depth
                .with_label_values(&[queue, state])
                .set(depth as f64)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_finished_jobs_are_counted_per_status() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();

        collector.record_job_finished("collector-test", "completed", 0.2);
        collector.record_job_finished("collector-test", "failed", 1.5);

        let failed = queue_metrics()
            .unwrap()
            .jobs_finished
            .with_label_values(&["collector-test", "failed"])
            .get();
        assert!(failed >= 1.0);
        assert!(export_metrics().contains("recurq_job_duration_seconds"));
    }

    #[test]
    fn test_lock_renewal_failures_skip_zero() {
        init_metrics().unwrap();
        let collector = MetricsCollector::new();
        let failures = || {
            queue_metrics()
                .unwrap()
                .lock_renewal_failures
                .with_label_values(&["renewal-test"])
                .get()
        };

        collector.record_lock_renewal_failures("renewal-test", 0);
        assert_eq!(failures(), 0.0);
        collector.record_lock_renewal_failures("renewal-test", 2);
        assert_eq!(failures(), 2.0);

        collector.update_active_jobs("renewal-test", 3);
        collector.update_queue_depth("renewal-test", "wait", 12);
        let depth = queue_metrics()
            .unwrap()
            .queue_depth
            .with_label_values(&["renewal-test", "wait"])
            .get();
        assert_eq!(depth, 12.0);
    }
}
