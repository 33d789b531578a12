//! Prometheus registry of the queue metrics.
//!
//! All metrics live in one [`QueueMetrics`] set, registered once per process
//! by [`init_metrics`]. Until then [`queue_metrics`] returns `None` and
//! recording is skipped.

use std::sync::OnceLock;

use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

static METRICS: OnceLock<QueueMetrics> = OnceLock::new();

/// Processing durations are mostly sub-second, with long-running outliers.
const DURATION_BUCKETS: [f64; 8] = [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0];

/// The registered metrics. Every family is labeled by `queue`.
pub struct QueueMetrics {
    registry: Registry,
    /// Terminal transitions, by `status`.
    pub jobs_finished: CounterVec,
    pub job_duration: HistogramVec,
    /// Stalled jobs, by the sweeper's `action` (`requeued` or `failed`).
    pub stalled_jobs: CounterVec,
    pub lock_renewal_failures: CounterVec,
    pub continuation_failures: CounterVec,
    pub scheduler_upserts: CounterVec,
    /// Jobs this process holds locks for.
    pub active_jobs: GaugeVec,
    /// Jobs per `state`, sampled by the `metrics` command.
    pub queue_depth: GaugeVec,
}

impl QueueMetrics {
    fn register() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str, labels: &[&str]| {
            register(&registry, CounterVec::new(Opts::new(name, help), labels)?)
        };
        let gauge = |name: &str, help: &str, labels: &[&str]| {
            register(&registry, GaugeVec::new(Opts::new(name, help), labels)?)
        };
        let queue: &[&str] = &["queue"];

        let job_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new("recurq_job_duration_seconds", "Job processing duration")
                    .buckets(DURATION_BUCKETS.to_vec()),
                queue,
            )?,
        )?;

        Ok(Self {
            jobs_finished: counter(
                "recurq_jobs_finished_total",
                "Jobs that reached a terminal state",
                &["queue", "status"][..],
            )?,
            job_duration,
            stalled_jobs: counter(
                "recurq_stalled_jobs_total",
                "Stalled jobs found by the sweeper",
                &["queue", "action"][..],
            )?,
            lock_renewal_failures: counter(
                "recurq_lock_renewal_failures_total",
                "Job locks that could not be renewed",
                queue,
            )?,
            continuation_failures: counter(
                "recurq_continuation_failures_total",
                "Scheduler continuations deferred after exhausting retries",
                queue,
            )?,
            scheduler_upserts: counter(
                "recurq_scheduler_upserts_total",
                "Job scheduler upserts",
                queue,
            )?,
            active_jobs: gauge(
                "recurq_active_jobs",
                "Jobs currently held by this process",
                queue,
            )?,
            queue_depth: gauge(
                "recurq_queue_depth",
                "Number of jobs per state",
                &["queue", "state"][..],
            )?,
            registry,
        })
    }
}

fn register<M>(registry: &Registry, metric: M) -> Result<M, prometheus::Error>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

/// Registers the metrics. Calls after the first successful one do nothing.
///
/// # Errors
///
/// Returns a `prometheus::Error` when a metric cannot be created or
/// registered.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let metrics = QueueMetrics::register()?;
    if METRICS.set(metrics).is_ok() {
        tracing::info!("Prometheus metrics registered");
    }
    Ok(())
}

/// The registered metrics, once [`init_metrics`] has run.
pub fn queue_metrics() -> Option<&'static QueueMetrics> {
    METRICS.get()
}

/// Renders the metrics in the Prometheus text format, or a comment line when
/// they are not registered or cannot be encoded.
pub fn export_metrics() -> String {
    let Some(metrics) = METRICS.get() else {
        return "# recurq metrics are not registered\n".to_string();
    };

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }
    String::from_utf8(buffer).unwrap_or_else(|e| format!("# Error encoding metrics: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_repeatable() {
        init_metrics().unwrap();
        init_metrics().unwrap();
        assert!(queue_metrics().is_some());
    }

    #[test]
    fn test_export_lists_registered_families() {
        init_metrics().unwrap();
        queue_metrics()
            .unwrap()
            .scheduler_upserts
            .with_label_values(&["export-test"])
            .inc();

        let text = export_metrics();
        assert!(text.contains("recurq_scheduler_upserts_total"));
        assert!(text.contains("export-test"));
    }
}
