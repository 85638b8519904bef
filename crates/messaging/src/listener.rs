//! Event listener: topic registration, publishing and outcome reconciliation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use common::{RequestContext, headers};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::callback::{MetricsCallback, OutcomeEvent, PublishCallback};
use crate::dead_letter::{DeadLetterCallback, DeadLetterRouter};
use crate::transport::{BrokerTransport, OutcomeQueues};
use crate::{Envelope, MessagingError, Result, ServiceIdentity, now_millis};

type CallbackChain = Arc<[Arc<dyn PublishCallback>]>;

/// Publishing handle for one registered topic.
#[derive(Clone)]
pub struct TopicPublisher {
    topic: String,
    transport: Arc<dyn BrokerTransport>,
    identity: ServiceIdentity,
}

impl TopicPublisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        payload: &T,
        partition_key: Option<&str>,
    ) -> Result<String> {
        let body = serde_json::to_vec(payload).map_err(MessagingError::Encode)?;
        self.publish_raw(ctx, body, partition_key).await
    }

    /// Stamps the standard headers on `body` and hands it to the transport.
    ///
    /// Returns the generated event id once the transport accepts the send.
    pub async fn publish_raw(
        &self,
        ctx: &RequestContext,
        body: Vec<u8>,
        partition_key: Option<&str>,
    ) -> Result<String> {
        let event_id = Uuid::new_v4().to_string();
        let mut envelope = Envelope::new(self.topic.clone(), body)
            .with_header(headers::TRACE_ID, ctx.trace_id())
            .with_header(headers::EVENT_ID, event_id.clone())
            .with_header(headers::TIMESTAMP, now_millis().to_string())
            .with_header(headers::SOURCE, self.identity.name.clone())
            .with_header(headers::SCHEMA_VERSION, self.identity.schema_version.clone())
            .with_header(headers::TOPIC, self.topic.clone());
        if let Some(traceparent) = ctx.metadata().get_ignore_case(headers::TRACEPARENT) {
            envelope.headers.insert(headers::TRACEPARENT, traceparent);
        }
        if let Some(key) = partition_key {
            envelope.headers.insert(headers::PARTITION_KEY, key);
        }

        let in_flight = metrics::gauge!("messaging_messages_in_flight", "topic" => self.topic.clone());
        in_flight.increment(1.0);
        match ctx.run(self.transport.send(envelope)).await {
            Ok(Ok(())) => {
                tracing::debug!(
                    topic = %self.topic,
                    event_id = %event_id,
                    trace_id = %ctx.trace_id(),
                    "message handed to transport"
                );
                Ok(event_id)
            }
            Ok(Err(err)) => {
                in_flight.decrement(1.0);
                Err(err)
            }
            Err(interrupted) => {
                in_flight.decrement(1.0);
                Err(interrupted.into())
            }
        }
    }
}

enum Lifecycle {
    Idle(OutcomeQueues),
    Running {
        shutdown: CancellationToken,
        handle: JoinHandle<()>,
    },
    Closed,
}

/// Publishes to registered topics and reconciles broker outcomes in the background.
pub struct EventListener {
    transport: Arc<dyn BrokerTransport>,
    identity: ServiceIdentity,
    router: DeadLetterRouter,
    callbacks: CallbackChain,
    publishers: RwLock<HashMap<String, TopicPublisher>>,
    lifecycle: Mutex<Lifecycle>,
    closed: AtomicBool,
}

impl EventListener {
    pub fn builder(transport: Arc<dyn BrokerTransport>, queues: OutcomeQueues) -> EventListenerBuilder {
        EventListenerBuilder {
            transport,
            queues,
            identity: ServiceIdentity::default(),
            callbacks: Vec::new(),
            dead_letter: true,
        }
    }

    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    /// Router sharing this listener's transport and identity.
    pub fn dead_letter_router(&self) -> DeadLetterRouter {
        self.router.clone()
    }

    /// Registers `topic` for publishing. Returns `false` if it already was.
    pub fn register(&self, topic: impl Into<String>) -> bool {
        let topic = topic.into();
        let mut publishers = self.publishers.write().unwrap_or_else(PoisonError::into_inner);
        if publishers.contains_key(&topic) {
            return false;
        }
        tracing::info!(topic = %topic, "publisher registered");
        publishers.insert(
            topic.clone(),
            TopicPublisher {
                topic,
                transport: self.transport.clone(),
                identity: self.identity.clone(),
            },
        );
        true
    }

    pub fn unregister(&self, topic: &str) -> bool {
        self.publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(topic)
            .is_some()
    }

    pub fn is_registered(&self, topic: &str) -> bool {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(topic)
    }

    pub fn publisher(&self, topic: &str) -> Option<TopicPublisher> {
        self.publishers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(topic)
            .cloned()
    }

    /// Publishes `payload` as JSON to a registered topic.
    #[tracing::instrument(skip(self, ctx, payload), fields(trace_id = %ctx.trace_id()))]
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        ctx: &RequestContext,
        topic: &str,
        payload: &T,
        partition_key: Option<&str>,
    ) -> Result<String> {
        self.registered(topic)?
            .publish(ctx, payload, partition_key)
            .await
    }

    pub async fn publish_raw(
        &self,
        ctx: &RequestContext,
        topic: &str,
        body: Vec<u8>,
        partition_key: Option<&str>,
    ) -> Result<String> {
        self.registered(topic)?
            .publish_raw(ctx, body, partition_key)
            .await
    }

    fn registered(&self, topic: &str) -> Result<TopicPublisher> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(MessagingError::Closed);
        }
        self.publisher(topic)
            .ok_or_else(|| MessagingError::NotRegistered(topic.to_string()))
    }

    /// Spawns the reconciler. Calling it again while running is a no-op.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.lifecycle.lock().await;
        match std::mem::replace(&mut *state, Lifecycle::Closed) {
            Lifecycle::Idle(queues) => {
                let shutdown = CancellationToken::new();
                let handle = tokio::spawn(reconcile(
                    queues,
                    self.callbacks.clone(),
                    shutdown.clone(),
                ));
                *state = Lifecycle::Running { shutdown, handle };
                tracing::info!(source = %self.identity.name, "event listener started");
                Ok(())
            }
            running @ Lifecycle::Running { .. } => {
                *state = running;
                Ok(())
            }
            Lifecycle::Closed => Err(MessagingError::Closed),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().await, Lifecycle::Running { .. })
    }

    /// Stops publishing, flushes the transport and drains every outcome
    /// already queued before returning. Safe to call more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.publishers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.transport.close().await;

        let mut state = self.lifecycle.lock().await;
        match std::mem::replace(&mut *state, Lifecycle::Closed) {
            Lifecycle::Running { shutdown, handle } => {
                shutdown.cancel();
                if let Err(err) = handle.await {
                    tracing::error!(error = %err, "outcome reconciler panicked");
                }
            }
            Lifecycle::Idle(queues) => drain(queues, &self.callbacks).await,
            Lifecycle::Closed => {}
        }
        tracing::info!(source = %self.identity.name, "event listener closed");
    }
}

pub struct EventListenerBuilder {
    transport: Arc<dyn BrokerTransport>,
    queues: OutcomeQueues,
    identity: ServiceIdentity,
    callbacks: Vec<Arc<dyn PublishCallback>>,
    dead_letter: bool,
}

impl EventListenerBuilder {
    pub fn identity(mut self, identity: ServiceIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Appends a callback. Metrics always run first and dead-lettering last.
    pub fn callback(mut self, callback: impl PublishCallback + 'static) -> Self {
        self.callbacks.push(Arc::new(callback));
        self
    }

    /// Disables routing of failed publishes to dead-letter topics.
    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter = false;
        self
    }

    pub fn build(self) -> EventListener {
        let router = DeadLetterRouter::new(self.transport.clone(), self.identity.clone());
        let mut chain: Vec<Arc<dyn PublishCallback>> = Vec::with_capacity(self.callbacks.len() + 2);
        chain.push(Arc::new(MetricsCallback));
        chain.extend(self.callbacks);
        if self.dead_letter {
            chain.push(Arc::new(DeadLetterCallback::new(router.clone())));
        }

        EventListener {
            transport: self.transport,
            identity: self.identity,
            router,
            callbacks: chain.into(),
            publishers: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(Lifecycle::Idle(self.queues)),
            closed: AtomicBool::new(false),
        }
    }
}

async fn reconcile(mut queues: OutcomeQueues, callbacks: CallbackChain, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            Some(report) = queues.successes.recv() => dispatch(&callbacks, report.into()).await,
            Some(failure) = queues.errors.recv() => dispatch(&callbacks, failure.into()).await,
            () = shutdown.cancelled() => break,
            else => break,
        }
    }
    drain(queues, &callbacks).await;
}

/// Runs the chain over everything still queued, then returns.
async fn drain(mut queues: OutcomeQueues, callbacks: &CallbackChain) {
    queues.successes.close();
    queues.errors.close();
    let mut drained = 0usize;
    while let Some(report) = queues.successes.recv().await {
        dispatch(callbacks, report.into()).await;
        drained += 1;
    }
    while let Some(failure) = queues.errors.recv().await {
        dispatch(callbacks, failure.into()).await;
        drained += 1;
    }
    tracing::debug!(drained, "outcome queues drained");
}

async fn dispatch(callbacks: &CallbackChain, event: OutcomeEvent) {
    let ctx = RequestContext::from_metadata(event.envelope.headers.clone());
    for callback in callbacks.iter() {
        callback.on_outcome(&ctx, &event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBroker;

    fn listener() -> (EventListener, InMemoryBroker) {
        let (broker, queues) = InMemoryBroker::new(16);
        let listener = EventListener::builder(Arc::new(broker.clone()), queues).build();
        (listener, broker)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (listener, _) = listener();
        assert!(listener.register("OnInventoryDeductSuccess"));
        assert!(!listener.register("OnInventoryDeductSuccess"));
        assert!(listener.unregister("OnInventoryDeductSuccess"));
        assert!(!listener.is_registered("OnInventoryDeductSuccess"));
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_fails() {
        let (listener, broker) = listener();
        let err = listener
            .publish(&RequestContext::new(), "Nope", &serde_json::json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::NotRegistered(ref t) if t == "Nope"));
        assert!(broker.messages("Nope").await.is_empty());
    }

    #[tokio::test]
    async fn publish_stamps_headers() {
        let (listener, broker) = listener();
        listener.register("OnInventoryDeductSuccess");
        let ctx = RequestContext::new().with_header(headers::TRACE_ID, "trace-9");

        let event_id = listener
            .publish(&ctx, "OnInventoryDeductSuccess", &serde_json::json!({"order_id": 9}), Some("9"))
            .await
            .unwrap();

        let sent = broker.messages("OnInventoryDeductSuccess").await;
        let envelope = &sent[0];
        assert_eq!(envelope.event_id(), Some(event_id.as_str()));
        assert_eq!(envelope.trace_id(), Some("trace-9"));
        assert_eq!(envelope.partition_key(), Some("9"));
        assert_eq!(envelope.header(headers::SOURCE), Some("product"));
        assert_eq!(envelope.header(headers::SCHEMA_VERSION), Some("v1"));
        assert_eq!(envelope.header(headers::TOPIC), Some("OnInventoryDeductSuccess"));
        assert!(envelope.timestamp_millis().is_some());
    }

    #[tokio::test]
    async fn start_and_close_are_idempotent() {
        let (listener, _) = listener();
        listener.start().await.unwrap();
        listener.start().await.unwrap();
        assert!(listener.is_running().await);

        listener.close().await;
        listener.close().await;
        assert!(!listener.is_running().await);
        assert!(matches!(listener.start().await, Err(MessagingError::Closed)));
    }

    #[tokio::test]
    async fn publish_after_close_is_rejected() {
        let (listener, _) = listener();
        listener.register("T");
        listener.close().await;
        let err = listener
            .publish(&RequestContext::new(), "T", &1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MessagingError::Closed));
    }
}
