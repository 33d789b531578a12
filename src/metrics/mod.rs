//! Metrics module for Prometheus-based monitoring.
//!
//! Records job completions, stalled-job handling, lock renewal failures,
//! scheduler continuation failures and scheduler upserts.
//!
//! # Example
//!
//! ```ignore
//! use recurq::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_scheduler_upsert("mail");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use self::collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics, queue_metrics, QueueMetrics};
