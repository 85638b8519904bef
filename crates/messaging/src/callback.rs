//! Per-outcome callbacks run by the listener's reconciler.

use std::time::Duration;

use async_trait::async_trait;
use common::RequestContext;

use crate::transport::{DeliveryFailure, DeliveryReport};
use crate::{Envelope, now_millis};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    Delivered { partition: i32, offset: i64 },
    Failed { error: String },
}

/// One broker verdict together with the envelope it is about.
#[derive(Debug, Clone)]
pub struct OutcomeEvent {
    pub envelope: Envelope,
    pub outcome: PublishOutcome,
}

impl OutcomeEvent {
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, PublishOutcome::Failed { .. })
    }

    /// Milliseconds between the publish stamp and now.
    pub fn produce_latency_ms(&self) -> Option<i64> {
        self.envelope
            .timestamp_millis()
            .map(|sent| (now_millis() - sent).max(0))
    }
}

impl From<DeliveryReport> for OutcomeEvent {
    fn from(report: DeliveryReport) -> Self {
        Self {
            envelope: report.envelope,
            outcome: PublishOutcome::Delivered {
                partition: report.partition,
                offset: report.offset,
            },
        }
    }
}

impl From<DeliveryFailure> for OutcomeEvent {
    fn from(failure: DeliveryFailure) -> Self {
        Self {
            envelope: failure.envelope,
            outcome: PublishOutcome::Failed {
                error: failure.error,
            },
        }
    }
}

/// A step of the reconciliation chain.
///
/// `ctx` is rebuilt from the envelope headers, so it carries the trace id of
/// the request that published the message.
#[async_trait]
pub trait PublishCallback: Send + Sync {
    async fn on_outcome(&self, ctx: &RequestContext, event: &OutcomeEvent);
}

/// Base step, always first: produced counters, in-flight gauge and latency.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsCallback;

#[async_trait]
impl PublishCallback for MetricsCallback {
    async fn on_outcome(&self, _ctx: &RequestContext, event: &OutcomeEvent) {
        let topic = event.envelope.topic.clone();
        let status = if event.is_failure() { "failure" } else { "success" };
        metrics::counter!(
            "messaging_messages_produced_total",
            "topic" => topic.clone(),
            "status" => status
        )
        .increment(1);
        metrics::gauge!("messaging_messages_in_flight", "topic" => topic.clone()).decrement(1.0);
        if let Some(latency) = event.produce_latency_ms() {
            metrics::histogram!("messaging_produce_duration_ms", "topic" => topic)
                .record(latency as f64);
        }
    }
}

/// Logs every outcome and flags publishes slower than `slow_threshold`.
#[derive(Debug, Clone)]
pub struct LoggingCallback {
    slow_threshold: Duration,
}

impl LoggingCallback {
    pub fn new(slow_threshold: Duration) -> Self {
        Self { slow_threshold }
    }
}

#[async_trait]
impl PublishCallback for LoggingCallback {
    async fn on_outcome(&self, ctx: &RequestContext, event: &OutcomeEvent) {
        let envelope = &event.envelope;
        let latency_ms = event.produce_latency_ms().unwrap_or_default();
        match &event.outcome {
            PublishOutcome::Delivered { partition, offset } => {
                let threshold_ms = self.slow_threshold.as_millis() as i64;
                if threshold_ms > 0 && latency_ms > threshold_ms {
                    tracing::warn!(
                        topic = %envelope.topic,
                        trace_id = %ctx.trace_id(),
                        event_id = envelope.event_id().unwrap_or_default(),
                        partition,
                        offset,
                        latency_ms,
                        threshold_ms,
                        "slow publish"
                    );
                } else {
                    tracing::debug!(
                        topic = %envelope.topic,
                        trace_id = %ctx.trace_id(),
                        event_id = envelope.event_id().unwrap_or_default(),
                        partition,
                        offset,
                        latency_ms,
                        "message delivered"
                    );
                }
            }
            PublishOutcome::Failed { error } => {
                tracing::error!(
                    topic = %envelope.topic,
                    trace_id = %ctx.trace_id(),
                    event_id = envelope.event_id().unwrap_or_default(),
                    key = envelope.partition_key().unwrap_or_default(),
                    latency_ms,
                    error = %error,
                    "message delivery failed"
                );
            }
        }
    }
}

/// Closes out the publish as a span carrying the broker verdict.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingCallback;

#[async_trait]
impl PublishCallback for TracingCallback {
    async fn on_outcome(&self, ctx: &RequestContext, event: &OutcomeEvent) {
        let span = tracing::info_span!(
            "publish",
            topic = %event.envelope.topic,
            trace_id = %ctx.trace_id(),
            event_id = event.envelope.event_id().unwrap_or_default(),
            partition = tracing::field::Empty,
            offset = tracing::field::Empty,
            otel.status_code = tracing::field::Empty,
        );
        match &event.outcome {
            PublishOutcome::Delivered { partition, offset } => {
                span.record("partition", partition);
                span.record("offset", offset);
                span.record("otel.status_code", "OK");
            }
            PublishOutcome::Failed { error } => {
                span.record("otel.status_code", "ERROR");
                span.in_scope(|| tracing::debug!(error = %error, "publish span closed with error"));
            }
        }
    }
}
