use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};

use crate::transport::{
    BrokerTransport, DeliveryFailure, DeliveryReport, OutcomeQueues, OutcomeSender,
    outcome_channel,
};
use crate::{Envelope, MessagingError, Result};

#[derive(Default)]
struct Topics {
    logs: HashMap<String, Vec<Envelope>>,
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>,
    failing: HashSet<String>,
}

/// Broker living inside the process.
///
/// Accepted sends are appended to a per-topic log, fanned out to
/// subscribers, and acknowledged on the outcome queues before `send`
/// returns. Topics can be switched to fail delivery, and sends can be
/// rejected outright, to exercise the failure paths.
#[derive(Clone)]
pub struct InMemoryBroker {
    topics: Arc<Mutex<Topics>>,
    outcomes: OutcomeSender,
    reject_sends: Arc<AtomicBool>,
    partitions: u64,
}

impl InMemoryBroker {
    /// Creates a broker and the outcome queues its listener must drain.
    pub fn new(queue_capacity: usize) -> (Self, OutcomeQueues) {
        let (outcomes, queues) = outcome_channel(queue_capacity);
        let broker = Self {
            topics: Arc::new(Mutex::new(Topics::default())),
            outcomes,
            reject_sends: Arc::new(AtomicBool::new(false)),
            partitions: 3,
        };
        (broker, queues)
    }

    /// Receives every envelope later delivered to any of `topics`.
    pub async fn subscribe(&self, topics: &[String]) -> mpsc::UnboundedReceiver<Envelope> {
        self.subscribe_redeliverable(topics).await.1
    }

    /// Like [`subscribe`](Self::subscribe), also returning the subscription's
    /// own sender so unacknowledged envelopes can be put back in line.
    pub async fn subscribe_redeliverable(
        &self,
        topics: &[String],
    ) -> (mpsc::UnboundedSender<Envelope>, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.topics.lock().await;
        for topic in topics {
            state
                .subscribers
                .entry(topic.clone())
                .or_default()
                .push(tx.clone());
        }
        (tx, rx)
    }

    /// Envelopes delivered to `topic` so far.
    pub async fn messages(&self, topic: &str) -> Vec<Envelope> {
        self.topics
            .lock()
            .await
            .logs
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Makes deliveries to `topic` fail asynchronously.
    pub async fn fail_topic(&self, topic: &str) {
        self.topics.lock().await.failing.insert(topic.to_string());
    }

    pub async fn heal_topic(&self, topic: &str) {
        self.topics.lock().await.failing.remove(topic);
    }

    /// Makes `send` fail immediately.
    pub fn reject_sends(&self, reject: bool) {
        self.reject_sends.store(reject, Ordering::SeqCst);
    }

    fn partition_for(&self, envelope: &Envelope) -> i32 {
        let Some(key) = envelope.partition_key() else {
            return 0;
        };
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        // partitions is small; the modulo always fits.
        (hasher.finish() % self.partitions) as i32
    }
}

#[async_trait]
impl BrokerTransport for InMemoryBroker {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.reject_sends.load(Ordering::SeqCst) {
            return Err(MessagingError::Rejected {
                topic: envelope.topic,
                reason: "in-memory broker is rejecting sends".into(),
            });
        }

        let partition = self.partition_for(&envelope);
        let delivered = {
            let mut state = self.topics.lock().await;
            if state.failing.contains(&envelope.topic) {
                None
            } else {
                let log = state.logs.entry(envelope.topic.clone()).or_default();
                log.push(envelope.clone());
                let offset = (log.len() - 1) as i64;
                if let Some(subscribers) = state.subscribers.get_mut(&envelope.topic) {
                    subscribers.retain(|tx| tx.send(envelope.clone()).is_ok());
                }
                Some(offset)
            }
        };

        match delivered {
            Some(offset) => self.outcomes.delivered(DeliveryReport {
                envelope,
                partition,
                offset,
            }),
            None => self.outcomes.failed(DeliveryFailure {
                error: format!("topic '{}' is unavailable", envelope.topic),
                envelope,
            }),
        }
        Ok(())
    }
}
