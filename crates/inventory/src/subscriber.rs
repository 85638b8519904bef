//! Broker subscriptions feeding the orchestrator.

use std::sync::Arc;

use async_trait::async_trait;
use common::RequestContext;
use messaging::{
    DeadLetterRouter, Envelope, HandlerError, MessageHandler, RetryNotify, RetryPolicy,
    SubscriptionDispatcher, resilient,
};
use storage::Storage;

use crate::events::{InventoryDeducted, PaymentSucceeded, topics};
use crate::{InventoryOrchestrator, RequestPool};

/// Deducts stock for `OnPaymentSuccess`.
pub struct PaymentEventHandler<S> {
    orchestrator: Arc<InventoryOrchestrator<S>>,
    pool: Arc<RequestPool>,
}

impl<S> PaymentEventHandler<S> {
    pub fn new(orchestrator: Arc<InventoryOrchestrator<S>>, pool: Arc<RequestPool>) -> Self {
        Self { orchestrator, pool }
    }
}

#[async_trait]
impl<S: Storage + Clone> MessageHandler for PaymentEventHandler<S> {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError> {
        let event: PaymentSucceeded = envelope
            .decode()
            .map_err(|err| HandlerError::from_error(&err))?;
        if !event.order_id.is_valid() || event.products.is_empty() {
            return Err(HandlerError::validation("order id or products cannot be empty"));
        }

        let mut request = self.pool.acquire();
        request
            .fill_from_payment(&event)
            .map_err(|err| HandlerError::from_error(&err))?;
        self.orchestrator
            .deduct_inventory(ctx, &request)
            .await
            .map(|_| ())
            .map_err(|err| HandlerError::from_error(&err))
    }
}

/// Restores stock for confirmations that ended on the dead-letter topic.
pub struct DeductionCompensationHandler<S> {
    orchestrator: Arc<InventoryOrchestrator<S>>,
    pool: Arc<RequestPool>,
}

impl<S> DeductionCompensationHandler<S> {
    pub fn new(orchestrator: Arc<InventoryOrchestrator<S>>, pool: Arc<RequestPool>) -> Self {
        Self { orchestrator, pool }
    }
}

#[async_trait]
impl<S: Storage + Clone> MessageHandler for DeductionCompensationHandler<S> {
    async fn handle(&self, ctx: &RequestContext, envelope: &Envelope) -> Result<(), HandlerError> {
        let event: InventoryDeducted = envelope
            .decode()
            .map_err(|err| HandlerError::from_error(&err))?;

        let mut request = self.pool.acquire();
        request
            .fill_from_deducted(&event)
            .map_err(|err| HandlerError::from_error(&err))?;
        self.orchestrator
            .deduct_inventory_revert(ctx, &request)
            .await
            .map(|_| ())
            .map_err(|err| HandlerError::from_error(&err))
    }
}

/// Subscribes both handlers, each wrapped as dead-letter(retry(handler)).
pub fn build_dispatcher<S: Storage + Clone>(
    consumer_group: &str,
    orchestrator: Arc<InventoryOrchestrator<S>>,
    pool: Arc<RequestPool>,
    policy: RetryPolicy,
    notify: RetryNotify,
    router: DeadLetterRouter,
) -> SubscriptionDispatcher {
    SubscriptionDispatcher::new(consumer_group)
        .route(
            topics::ON_PAYMENT_SUCCESS,
            resilient(
                PaymentEventHandler::new(orchestrator.clone(), pool.clone()),
                policy.clone(),
                notify.clone(),
                router.clone(),
            ),
        )
        .route(
            topics::ON_INVENTORY_DEDUCT_SUCCESS_DLQ,
            resilient(
                DeductionCompensationHandler::new(orchestrator, pool),
                policy,
                notify,
                router,
            ),
        )
}
