//! Dead-letter routing for publish failures and failed consumer handlers.
//!
//! A message is republished to `<topic>DLQ` with its original body and
//! headers, plus the failure reason and origin. A topic that already ends in
//! the suffix is never routed again.

use std::sync::Arc;

use async_trait::async_trait;
use common::{ErrorClassification, RequestContext, headers};

use crate::callback::{OutcomeEvent, PublishCallback, PublishOutcome};
use crate::subscriber::{HandlerError, MessageHandler};
use crate::{BrokerTransport, Envelope, Result, ServiceIdentity, now_millis};

pub const DEAD_LETTER_SUFFIX: &str = "DLQ";

pub fn is_dead_letter_topic(topic: &str) -> bool {
    topic.ends_with(DEAD_LETTER_SUFFIX)
}

pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}{DEAD_LETTER_SUFFIX}")
}

#[derive(Clone)]
pub struct DeadLetterRouter {
    transport: Arc<dyn BrokerTransport>,
    identity: ServiceIdentity,
}

impl DeadLetterRouter {
    pub fn new(transport: Arc<dyn BrokerTransport>, identity: ServiceIdentity) -> Self {
        Self {
            transport,
            identity,
        }
    }

    /// Builds the dead-letter copy of `original`, or `None` when `original`
    /// is itself a dead letter.
    pub fn build(&self, original: &Envelope, error: &str) -> Option<Envelope> {
        if is_dead_letter_topic(&original.topic) {
            return None;
        }
        let topic = dead_letter_topic(&original.topic);
        let mut meta = original.headers.clone();
        let origin_timestamp = meta.remove(headers::TIMESTAMP);
        meta.remove(headers::TRACEPARENT);
        meta.insert(headers::ORIGIN_TOPIC, original.topic.clone());
        meta.insert(headers::ERROR, error);
        if let Some(ts) = origin_timestamp {
            meta.insert(headers::ORIGIN_TIMESTAMP, ts);
        }
        meta.insert(headers::TIMESTAMP, now_millis().to_string());
        meta.insert(headers::TOPIC, topic.clone());
        meta.insert(headers::SOURCE, self.identity.name.clone());
        meta.insert(headers::SCHEMA_VERSION, self.identity.schema_version.clone());

        Some(Envelope {
            topic,
            body: original.body.clone(),
            headers: meta,
        })
    }

    /// Republishes `original` to its dead-letter topic.
    ///
    /// Returns the dead-letter topic, or `None` when loop prevention dropped
    /// the message. `side` labels the metric (`producer` or `consumer`).
    pub async fn route(
        &self,
        original: &Envelope,
        error: &str,
        side: &'static str,
    ) -> Result<Option<String>> {
        let Some(dead_letter) = self.build(original, error) else {
            tracing::warn!(
                topic = %original.topic,
                event_id = original.event_id().unwrap_or_default(),
                trace_id = original.trace_id().unwrap_or_default(),
                error,
                "dead letter failed again; dropping to avoid a routing loop"
            );
            metrics::counter!(
                "messaging_dead_letters_total",
                "topic" => original.topic.clone(),
                "side" => side,
                "outcome" => "dropped"
            )
            .increment(1);
            return Ok(None);
        };

        let topic = dead_letter.topic.clone();
        self.transport.send(dead_letter).await?;
        metrics::counter!(
            "messaging_dead_letters_total",
            "topic" => original.topic.clone(),
            "side" => side,
            "outcome" => "routed"
        )
        .increment(1);
        tracing::warn!(
            topic = %original.topic,
            dead_letter_topic = %topic,
            event_id = original.event_id().unwrap_or_default(),
            trace_id = original.trace_id().unwrap_or_default(),
            error,
            "message routed to dead-letter topic"
        );
        Ok(Some(topic))
    }
}

/// Last step of the publish chain: failed deliveries go to the dead-letter topic.
pub struct DeadLetterCallback {
    router: DeadLetterRouter,
}

impl DeadLetterCallback {
    pub fn new(router: DeadLetterRouter) -> Self {
        Self { router }
    }
}

#[async_trait]
impl PublishCallback for DeadLetterCallback {
    async fn on_outcome(&self, ctx: &RequestContext, event: &OutcomeEvent) {
        let PublishOutcome::Failed { error } = &event.outcome else {
            return;
        };
        if let Err(err) = self.router.route(&event.envelope, error, "producer").await {
            tracing::error!(
                topic = %event.envelope.topic,
                trace_id = %ctx.trace_id(),
                error = %err,
                "failed to route undelivered message to dead-letter topic"
            );
        }
    }
}

/// Consumer-side wrapper: acknowledges what retrying cannot fix.
///
/// Terminal failures are logged and acknowledged. Other failures are
/// dead-lettered and acknowledged. Only when the dead-letter send itself is
/// rejected does the error reach the broker, so the original is redelivered
/// rather than lost.
pub struct DeadLetterHandler<H> {
    inner: H,
    router: DeadLetterRouter,
}

impl<H> DeadLetterHandler<H> {
    pub fn new(inner: H, router: DeadLetterRouter) -> Self {
        Self { inner, router }
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for DeadLetterHandler<H> {
    async fn handle(
        &self,
        ctx: &RequestContext,
        envelope: &Envelope,
    ) -> std::result::Result<(), HandlerError> {
        let err = match self.inner.handle(ctx, envelope).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        if err.is_terminal() {
            tracing::warn!(
                topic = %envelope.topic,
                trace_id = %ctx.trace_id(),
                event_id = envelope.event_id().unwrap_or_default(),
                kind = %err.kind(),
                error = %err,
                "terminal handler failure acknowledged"
            );
            return Ok(());
        }

        match self.router.route(envelope, &err.to_string(), "consumer").await {
            Ok(_) => Ok(()),
            Err(route_err) => {
                tracing::error!(
                    topic = %envelope.topic,
                    trace_id = %ctx.trace_id(),
                    error = %err,
                    route_error = %route_err,
                    "dead-letter publish rejected; leaving message for redelivery"
                );
                Err(HandlerError::from_error(&route_err))
            }
        }
    }
}
