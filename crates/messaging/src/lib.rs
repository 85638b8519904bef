//! Messaging backbone.
//!
//! Publishing is fire-and-forget: [`EventListener::publish`] returns once the
//! transport accepts the envelope, and the broker's verdict arrives later on
//! two bounded outcome queues drained by the listener's reconciler task. Each
//! outcome runs through an ordered [`PublishCallback`] chain; failed publishes
//! end in the [`DeadLetterRouter`].
//!
//! Consumption goes through [`MessageHandler`]s wrapped as
//! dead-letter(retry(handler)).

pub mod callback;
pub mod dead_letter;
pub mod envelope;
pub mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod listener;
pub mod memory;
pub mod retry;
pub mod subscriber;
pub mod transport;

pub use callback::{
    LoggingCallback, MetricsCallback, OutcomeEvent, PublishCallback, PublishOutcome,
    TracingCallback,
};
pub use dead_letter::{
    DEAD_LETTER_SUFFIX, DeadLetterCallback, DeadLetterHandler, DeadLetterRouter,
    dead_letter_topic, is_dead_letter_topic,
};
pub use envelope::{Envelope, ServiceIdentity, now_millis};
pub use error::{MessagingError, Result};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaTransport, run_consumer as run_kafka_consumer};
pub use listener::{EventListener, EventListenerBuilder, TopicPublisher};
pub use memory::InMemoryBroker;
pub use retry::{
    RetryNotification, RetryNotify, RetryPolicy, RetryPolicyBuilder, RetryStatus, logging_notify,
};
pub use subscriber::{
    HandlerError, MessageHandler, RetryHandler, SubscriptionDispatcher, resilient,
};
pub use transport::{
    BrokerTransport, DeliveryFailure, DeliveryReport, OutcomeQueues, OutcomeSender,
    outcome_channel,
};
