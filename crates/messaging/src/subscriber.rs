//! Consumer pipeline: handlers, the retry wrapper, and topic dispatch.

use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common::{ErrorClassification, ErrorKind, RequestContext};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::dead_letter::{DeadLetterHandler, DeadLetterRouter};
use crate::retry::{RetryNotify, RetryPolicy};
use crate::Envelope;

/// Failure returned by a [`MessageHandler`], reduced to its kind and text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn from_error<E: ErrorClassification + Display>(err: &E) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl ErrorClassification for HandlerError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError> {
        (**self).handle(ctx, envelope).await
    }
}

/// Runs the inner handler under a [`RetryPolicy`].
pub struct RetryHandler<H> {
    inner: H,
    policy: RetryPolicy,
    notify: RetryNotify,
}

impl<H> RetryHandler<H> {
    pub fn new(inner: H, policy: RetryPolicy, notify: RetryNotify) -> Self {
        Self {
            inner,
            policy,
            notify,
        }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for RetryHandler<H> {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError> {
        self.policy
            .run(ctx, &self.notify, &envelope.headers, |_| {
                self.inner.handle(ctx, envelope)
            })
            .await
    }
}

/// Wraps `handler` as dead-letter(retry(handler)).
pub fn resilient<H: MessageHandler>(
    handler: H,
    policy: RetryPolicy,
    notify: RetryNotify,
    router: DeadLetterRouter,
) -> DeadLetterHandler<RetryHandler<H>> {
    DeadLetterHandler::new(RetryHandler::new(handler, policy, notify), router)
}

/// Routes inbound envelopes to the handler registered for their topic.
pub struct SubscriptionDispatcher {
    consumer_group: String,
    routes: HashMap<String, Arc<dyn MessageHandler>>,
    slow_threshold: Duration,
    max_processing_time: Option<Duration>,
    redelivery_delay: Duration,
}

impl SubscriptionDispatcher {
    pub fn new(consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            routes: HashMap::new(),
            slow_threshold: Duration::ZERO,
            max_processing_time: None,
            redelivery_delay: Duration::from_secs(1),
        }
    }

    pub fn route(mut self, topic: impl Into<String>, handler: impl MessageHandler + 'static) -> Self {
        self.routes.insert(topic.into(), Arc::new(handler));
        self
    }

    /// Handlers slower than `threshold` are logged as warnings. Zero disables.
    pub fn slow_threshold(mut self, threshold: Duration) -> Self {
        self.slow_threshold = threshold;
        self
    }

    /// Deadline placed on each message's context, retries included.
    pub fn max_processing_time(mut self, limit: Duration) -> Self {
        self.max_processing_time = Some(limit);
        self
    }

    /// Pause before an unacknowledged message is offered again.
    pub fn redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    pub fn redelivery_backoff(&self) -> Duration {
        self.redelivery_delay
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.routes.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Handles one envelope. An `Err` means the message should be redelivered.
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let Some(handler) = self.routes.get(&envelope.topic) else {
            tracing::warn!(
                topic = %envelope.topic,
                consumer_group = %self.consumer_group,
                "no handler registered for topic; message skipped"
            );
            return Ok(());
        };

        let mut ctx = RequestContext::from_metadata(envelope.headers.clone());
        if let Some(limit) = self.max_processing_time {
            ctx = ctx.with_timeout(limit);
        }
        let started = Instant::now();
        let result = handler.handle(&ctx, envelope).await;
        let elapsed = started.elapsed();

        let outcome = if result.is_ok() { "success" } else { "failure" };
        metrics::counter!(
            "messaging_messages_consumed_total",
            "topic" => envelope.topic.clone(),
            "outcome" => outcome
        )
        .increment(1);
        metrics::histogram!(
            "messaging_consume_duration_ms",
            "topic" => envelope.topic.clone()
        )
        .record(elapsed.as_secs_f64() * 1000.0);

        if !self.slow_threshold.is_zero() && elapsed > self.slow_threshold {
            tracing::warn!(
                topic = %envelope.topic,
                consumer_group = %self.consumer_group,
                trace_id = %ctx.trace_id(),
                event_id = envelope.event_id().unwrap_or_default(),
                duration_ms = elapsed.as_millis() as u64,
                threshold_ms = self.slow_threshold.as_millis() as u64,
                "slow message handler"
            );
        }
        result
    }

    /// Consumes `inbox` until it closes or `shutdown` fires.
    ///
    /// A message whose handler asks for redelivery is pushed back through
    /// `redeliver` after the redelivery delay, which stands in for the
    /// broker not committing the offset.
    pub async fn run(
        self: Arc<Self>,
        mut inbox: mpsc::UnboundedReceiver<Envelope>,
        redeliver: Option<mpsc::UnboundedSender<Envelope>>,
        shutdown: CancellationToken,
    ) {
        tracing::info!(
            consumer_group = %self.consumer_group,
            topics = ?self.topics(),
            "subscription dispatcher started"
        );
        loop {
            let envelope = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = inbox.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            if let Err(err) = self.dispatch(&envelope).await {
                tracing::warn!(
                    topic = %envelope.topic,
                    error = %err,
                    "message left unacknowledged"
                );
                if let Some(tx) = &redeliver {
                    let tx = tx.clone();
                    let delay = self.redelivery_delay;
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        tokio::select! {
                            () = shutdown.cancelled() => {}
                            () = tokio::time::sleep(delay) => {
                                let _ = tx.send(envelope);
                            }
                        }
                    });
                }
            }
        }
        tracing::info!(consumer_group = %self.consumer_group, "subscription dispatcher stopped");
    }
}
