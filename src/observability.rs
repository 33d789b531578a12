//! Tracing spans around queue operations.

use std::future::Future;

use tracing::Instrument;

/// Role of the span in a messaging system, following OpenTelemetry naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Internal,
    Producer,
    Consumer,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Internal => "internal",
            SpanKind::Producer => "producer",
            SpanKind::Consumer => "consumer",
        }
    }
}

/// Runs `operation` inside a span naming the operation and the queue it
/// targets. The future is always polled to completion and its output,
/// including errors, is returned unchanged.
pub async fn trace_operation<F, T>(
    kind: SpanKind,
    operation: &str,
    destination: &str,
    future: F,
) -> T
where
    F: Future<Output = T>,
{
    let span = tracing::info_span!(
        "queue_operation",
        otel.kind = kind.as_str(),
        operation = operation,
        destination = destination,
    );
    future.instrument(span).await
}
