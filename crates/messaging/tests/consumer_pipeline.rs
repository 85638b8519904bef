//! dead-letter(retry(handler)) over a broker subscription.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::{ErrorKind, RequestContext, headers};
use messaging::{
    BrokerTransport, DeadLetterRouter, Envelope, HandlerError, InMemoryBroker, MessageHandler,
    RetryPolicy, ServiceIdentity, SubscriptionDispatcher, logging_notify, resilient,
};
use tokio_util::sync::CancellationToken;

struct AlwaysFails {
    kind: ErrorKind,
    calls: AtomicU32,
}

#[async_trait]
impl MessageHandler for AlwaysFails {
    async fn handle(&self, _ctx: &RequestContext, _envelope: &Envelope) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HandlerError::new(self.kind, "store unreachable"))
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(2)
        .initial_interval(Duration::from_millis(1))
        .max_interval(Duration::from_millis(2))
        .randomization_factor(0.0)
        .build()
}

async fn run_once(kind: ErrorKind) -> (InMemoryBroker, Arc<AlwaysFails>) {
    let (broker, _queues) = InMemoryBroker::new(64);
    let transport: Arc<dyn BrokerTransport> = Arc::new(broker.clone());
    let router = DeadLetterRouter::new(transport.clone(), ServiceIdentity::default());
    let handler = Arc::new(AlwaysFails {
        kind,
        calls: AtomicU32::new(0),
    });
    let dispatcher = Arc::new(
        SubscriptionDispatcher::new("product-consumer").route(
            "OnPaymentSuccess",
            resilient(handler.clone(), fast_retry(), logging_notify(), router),
        ),
    );

    let inbox = broker.subscribe(&dispatcher.topics()).await;
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(dispatcher.run(inbox, None, shutdown.clone()));

    transport
        .send(
            Envelope::new("OnPaymentSuccess", br#"{"order_id":4}"#.to_vec())
                .with_header(headers::TRACE_ID, "t-4"),
        )
        .await
        .unwrap();

    for _ in 0..200 {
        if handler.calls.load(Ordering::SeqCst) > 0
            && (kind.is_terminal() || !broker.messages("OnPaymentSuccessDLQ").await.is_empty())
        {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    shutdown.cancel();
    task.await.unwrap();
    (broker, handler)
}

#[tokio::test]
async fn transient_failure_is_retried_then_dead_lettered() {
    let (broker, handler) = run_once(ErrorKind::Transport).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    let dead = broker.messages("OnPaymentSuccessDLQ").await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].trace_id(), Some("t-4"));
    assert_eq!(dead[0].header(headers::ORIGIN_TOPIC), Some("OnPaymentSuccess"));
}

#[tokio::test]
async fn terminal_failure_is_acknowledged_once() {
    let (broker, handler) = run_once(ErrorKind::InsufficientStock).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert!(broker.messages("OnPaymentSuccessDLQ").await.is_empty());
}

#[tokio::test]
async fn rejected_dead_letter_leaves_message_for_redelivery() {
    let (broker, _queues) = InMemoryBroker::new(64);
    let transport: Arc<dyn BrokerTransport> = Arc::new(broker.clone());
    let router = DeadLetterRouter::new(transport, ServiceIdentity::default());
    let handler = Arc::new(AlwaysFails {
        kind: ErrorKind::Transport,
        calls: AtomicU32::new(0),
    });
    let dispatcher = Arc::new(
        SubscriptionDispatcher::new("product-consumer")
            .route(
                "OnPaymentSuccess",
                resilient(handler.clone(), fast_retry(), logging_notify(), router),
            )
            .redelivery_delay(Duration::from_millis(5)),
    );

    let (redeliver, inbox) = broker.subscribe_redeliverable(&dispatcher.topics()).await;
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(dispatcher.run(inbox, Some(redeliver.clone()), shutdown.clone()));

    broker.reject_sends(true);
    redeliver
        .send(Envelope::new("OnPaymentSuccess", br#"{"order_id":5}"#.to_vec()))
        .unwrap();
    for _ in 0..200 {
        if handler.calls.load(Ordering::SeqCst) >= 6 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(handler.calls.load(Ordering::SeqCst) >= 6);
    assert!(broker.messages("OnPaymentSuccessDLQ").await.is_empty());

    broker.reject_sends(false);
    for _ in 0..200 {
        if !broker.messages("OnPaymentSuccessDLQ").await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();
    task.await.unwrap();

    assert_eq!(broker.messages("OnPaymentSuccessDLQ").await.len(), 1);
}
