//! Kafka transport over `rdkafka`'s future producer.
//!
//! `send_result` enqueues into librdkafka without waiting for the broker,
//! which is exactly the accept-now, report-later contract of
//! [`BrokerTransport`]. A small task per message forwards the delivery
//! future's verdict to the outcome queues.
//!
//! [`run_consumer`] feeds the subscription dispatcher and stores offsets
//! only for records the dispatcher acknowledged; auto-commit then flushes
//! the stored offsets, including on close.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::Offset;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::subscriber::SubscriptionDispatcher;
use crate::transport::{BrokerTransport, DeliveryFailure, DeliveryReport, OutcomeSender};
use crate::{Envelope, MessagingError, Result};
use common::Metadata;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

pub struct KafkaTransport {
    producer: FutureProducer,
    outcomes: OutcomeSender,
    flush_timeout: Duration,
}

impl KafkaTransport {
    pub fn new(brokers: &str, outcomes: OutcomeSender) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| MessagingError::Config(format!("failed to create producer: {e}")))?;

        tracing::info!(brokers = %brokers, "kafka producer created");
        Ok(Self {
            producer,
            outcomes,
            flush_timeout: Duration::from_secs(10),
        })
    }
}

#[async_trait]
impl BrokerTransport for KafkaTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        let headers = envelope
            .headers
            .iter()
            .fold(OwnedHeaders::new(), |headers, (key, value)| {
                headers.insert(Header {
                    key,
                    value: Some(value),
                })
            });

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(&envelope.topic)
            .payload(envelope.body.as_slice())
            .headers(headers);
        if let Some(key) = envelope.partition_key() {
            record = record.key(key);
        }

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((err, _record)) => {
                return Err(MessagingError::Rejected {
                    topic: envelope.topic.clone(),
                    reason: err.to_string(),
                });
            }
        };

        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            match delivery.await {
                Ok(Ok((partition, offset))) => outcomes.delivered(DeliveryReport {
                    envelope,
                    partition,
                    offset,
                }),
                Ok(Err((err, _message))) => outcomes.failed(DeliveryFailure {
                    envelope,
                    error: err.to_string(),
                }),
                Err(_cancelled) => outcomes.failed(DeliveryFailure {
                    envelope,
                    error: "delivery cancelled: producer dropped".to_string(),
                }),
            }
        });
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.producer.flush(self.flush_timeout) {
            tracing::warn!(error = %err, "kafka producer flush failed");
        }
    }
}

/// Runs a consumer group over every topic `dispatcher` routes until
/// `shutdown` fires.
///
/// Records are dispatched inline, one at a time, so the consumer never
/// fetches ahead of what the handlers have finished. An offset is stored for
/// commit only once `dispatch` returns `Ok`. On `Err` the partition is
/// rewound to the failed record, which comes back after the dispatcher's
/// redelivery backoff.
pub fn run_consumer(
    brokers: &str,
    dispatcher: Arc<SubscriptionDispatcher>,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", dispatcher.consumer_group())
        .set("enable.auto.commit", "true")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .map_err(|e| MessagingError::Config(format!("failed to create consumer: {e}")))?;
    let topics = dispatcher.topics();
    let names: Vec<&str> = topics.iter().map(String::as_str).collect();
    consumer
        .subscribe(&names)
        .map_err(|e| MessagingError::Config(format!("failed to subscribe: {e}")))?;

    let handle = tokio::spawn(async move {
        tracing::info!(
            consumer_group = %dispatcher.consumer_group(),
            topics = ?topics,
            "kafka consumer started"
        );
        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = consumer.recv() => next,
            };
            let (envelope, partition, offset) = match next {
                Ok(message) => (to_envelope(&message), message.partition(), message.offset()),
                Err(err) => {
                    tracing::warn!(error = %err, "kafka consume failed");
                    continue;
                }
            };

            match dispatcher.dispatch(&envelope).await {
                Ok(()) => {
                    if let Err(err) = consumer.store_offset(&envelope.topic, partition, offset + 1) {
                        tracing::warn!(
                            topic = %envelope.topic,
                            partition,
                            offset,
                            error = %err,
                            "failed to store consumed offset"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(
                        topic = %envelope.topic,
                        partition,
                        offset,
                        error = %err,
                        "message left unacknowledged; rewinding partition"
                    );
                    if let Err(err) = consumer.seek(
                        &envelope.topic,
                        partition,
                        Offset::Offset(offset),
                        SEEK_TIMEOUT,
                    ) {
                        tracing::error!(
                            topic = %envelope.topic,
                            partition,
                            offset,
                            error = %err,
                            "failed to rewind partition"
                        );
                    }
                    tokio::select! {
                        () = shutdown.cancelled() => break,
                        () = tokio::time::sleep(dispatcher.redelivery_backoff()) => {}
                    }
                }
            }
        }
        tracing::info!("kafka consumer stopped");
    });
    Ok(handle)
}

fn to_envelope(message: &BorrowedMessage<'_>) -> Envelope {
    let mut headers = Metadata::new();
    if let Some(borrowed) = message.headers() {
        for header in borrowed.iter() {
            if let Some(value) = header.value {
                headers.insert(header.key, String::from_utf8_lossy(value).into_owned());
            }
        }
    }
    Envelope {
        topic: message.topic().to_string(),
        body: message.payload().unwrap_or_default().to_vec(),
        headers,
    }
}
