//! Payment notification to compensation over the in-memory broker.

mod support;

use std::sync::Arc;
use std::time::Duration;

use common::{OrderId, headers};
use inventory::{PaidItem, PaymentSucceeded, RequestPool, build_dispatcher, topics};
use messaging::{BrokerTransport, Envelope, RetryPolicy, logging_notify};
use support::Harness;
use tokio_util::sync::CancellationToken;

fn payment(order_id: i64, product: common::ProductId, quantity: i64) -> Envelope {
    let event = PaymentSucceeded {
        order_id: OrderId::new(order_id),
        products: vec![PaidItem {
            product_id: product,
            variant_id: None,
            quantity,
        }],
    };
    Envelope::json(topics::ON_PAYMENT_SUCCESS, &event)
        .unwrap()
        .with_header(headers::EVENT_ID, format!("evt-{order_id}"))
        .with_header(headers::TRACE_ID, format!("trace-{order_id}"))
}

async fn start_consumer(h: &Harness) -> (CancellationToken, tokio::task::JoinHandle<()>) {
    let policy = RetryPolicy::builder()
        .initial_interval(Duration::from_millis(1))
        .randomization_factor(0.0)
        .build();
    let dispatcher = Arc::new(build_dispatcher(
        "product-consumer",
        h.orchestrator.clone(),
        Arc::new(RequestPool::default()),
        policy,
        logging_notify(),
        h.listener.dead_letter_router(),
    ));
    let inbox = h.broker.subscribe(&dispatcher.topics()).await;
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(dispatcher.run(inbox, None, shutdown.clone()));
    (shutdown, handle)
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn redelivered_payment_deducts_once() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let (shutdown, handle) = start_consumer(&h).await;

    h.broker.send(payment(21, product, 3)).await.unwrap();
    h.broker.send(payment(21, product, 3)).await.unwrap();

    let storage = &h.storage;
    assert!(eventually(|| async move { storage.record_count().await == 1 }).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.storage.product_stock(product).await, Some(7));
    assert_eq!(h.confirmations().await, 1);

    shutdown.cancel();
    handle.await.unwrap();
    h.listener.close().await;
}

#[tokio::test]
async fn undeliverable_confirmation_is_compensated() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    h.broker.fail_topic(topics::ON_INVENTORY_DEDUCT_SUCCESS).await;
    let (shutdown, handle) = start_consumer(&h).await;

    h.broker.send(payment(22, product, 4)).await.unwrap();

    // deduct record, then the revert record written by the DLQ subscriber
    let storage = &h.storage;
    assert!(eventually(|| async move { storage.record_count().await == 2 }).await);
    assert_eq!(h.storage.product_stock(product).await, Some(10));
    let dead = h.broker.messages(topics::ON_INVENTORY_DEDUCT_SUCCESS_DLQ).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].trace_id(), Some("trace-22"));

    shutdown.cancel();
    handle.await.unwrap();
    h.listener.close().await;
}

#[tokio::test]
async fn malformed_payment_is_acknowledged_without_side_effects() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let (shutdown, handle) = start_consumer(&h).await;

    h.broker
        .send(Envelope::new(topics::ON_PAYMENT_SUCCESS, b"not json".to_vec()))
        .await
        .unwrap();
    h.broker.send(payment(23, product, 1)).await.unwrap();

    let storage = &h.storage;
    assert!(eventually(|| async move { storage.record_count().await == 1 }).await);
    assert_eq!(h.storage.product_stock(product).await, Some(9));
    assert!(h
        .broker
        .messages("OnPaymentSuccessDLQ")
        .await
        .is_empty());

    shutdown.cancel();
    handle.await.unwrap();
    h.listener.close().await;
}

#[tokio::test]
async fn overflowing_payment_is_rejected_and_consumer_keeps_running() {
    let h = Harness::new().await;
    let product = h.product(10).await;
    let (shutdown, handle) = start_consumer(&h).await;

    let line = PaidItem {
        product_id: product,
        variant_id: None,
        quantity: i64::MAX,
    };
    let overflowing = PaymentSucceeded {
        order_id: OrderId::new(500),
        products: vec![line.clone(), line.clone(), line],
    };
    h.broker
        .send(Envelope::json(topics::ON_PAYMENT_SUCCESS, &overflowing).unwrap())
        .await
        .unwrap();
    h.broker.send(payment(501, product, 3)).await.unwrap();

    let storage = &h.storage;
    assert!(eventually(|| async move { storage.record_count().await == 1 }).await);
    assert_eq!(h.storage.product_stock(product).await, Some(7));
    assert!(!handle.is_finished());
    assert!(h
        .broker
        .messages("OnPaymentSuccessDLQ")
        .await
        .is_empty());

    shutdown.cancel();
    handle.await.unwrap();
    h.listener.close().await;
}
