use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::{Envelope, Result};

/// Broker acknowledgement for one envelope.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    pub envelope: Envelope,
    pub partition: i32,
    pub offset: i64,
}

/// Broker rejection for one envelope.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub envelope: Envelope,
    pub error: String,
}

/// Producer half of the outcome queues, held by the transport.
#[derive(Clone)]
pub struct OutcomeSender {
    successes: mpsc::Sender<DeliveryReport>,
    errors: mpsc::Sender<DeliveryFailure>,
}

impl OutcomeSender {
    /// Queues a delivery report without blocking the caller.
    ///
    /// A full queue hands the report to a task that waits for space, so a
    /// send made from inside the reconciler cannot wait on itself.
    pub fn delivered(&self, report: DeliveryReport) {
        match self.successes.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(report)) => {
                let successes = self.successes.clone();
                tokio::spawn(async move {
                    if successes.send(report).await.is_err() {
                        tracing::debug!("success queue closed; delivery report dropped");
                    }
                });
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("success queue closed; delivery report dropped");
            }
        }
    }

    pub fn failed(&self, failure: DeliveryFailure) {
        match self.errors.try_send(failure) {
            Ok(()) => {}
            Err(TrySendError::Full(failure)) => {
                let errors = self.errors.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(failure)) = errors.send(failure).await {
                        dropped_failure(&failure);
                    }
                });
            }
            Err(TrySendError::Closed(failure)) => dropped_failure(&failure),
        }
    }
}

fn dropped_failure(failure: &DeliveryFailure) {
    tracing::warn!(
        topic = %failure.envelope.topic,
        error = %failure.error,
        "error queue closed; delivery failure dropped"
    );
}

/// Consumer half of the outcome queues, drained by the listener.
pub struct OutcomeQueues {
    pub successes: mpsc::Receiver<DeliveryReport>,
    pub errors: mpsc::Receiver<DeliveryFailure>,
}

/// Creates the two bounded outcome queues, each holding up to `capacity`.
pub fn outcome_channel(capacity: usize) -> (OutcomeSender, OutcomeQueues) {
    let (success_tx, success_rx) = mpsc::channel(capacity.max(1));
    let (error_tx, error_rx) = mpsc::channel(capacity.max(1));
    (
        OutcomeSender {
            successes: success_tx,
            errors: error_tx,
        },
        OutcomeQueues {
            successes: success_rx,
            errors: error_rx,
        },
    )
}

/// Connection to a message broker.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Hands the envelope over for delivery.
    ///
    /// `Ok` means accepted, not delivered: the broker's verdict is reported
    /// later on the outcome queues. `Err` means the envelope never left.
    async fn send(&self, envelope: Envelope) -> Result<()>;

    /// Flushes in-flight sends so their outcomes reach the queues.
    async fn close(&self) {}
}
