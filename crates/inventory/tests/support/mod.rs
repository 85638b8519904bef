#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use common::{ProductId, VariantId};
use inventory::{InventoryOrchestrator, OrchestratorSettings, topics};
use lock::{InMemoryLockManager, LockSettings};
use messaging::{EventListener, InMemoryBroker};
use storage::{InMemoryStorage, NewProduct, NewVariant};

pub struct Harness {
    pub storage: InMemoryStorage,
    pub locks: InMemoryLockManager,
    pub broker: InMemoryBroker,
    pub listener: Arc<EventListener>,
    pub orchestrator: Arc<InventoryOrchestrator<InMemoryStorage>>,
}

impl Harness {
    /// Wires the orchestrator over in-memory backings with the confirmation
    /// topic registered and the reconciler running.
    pub async fn new() -> Self {
        Self::build(true).await
    }

    /// Same as [`Harness::new`] but leaves the confirmation topic unregistered.
    pub async fn without_confirmation_topic() -> Self {
        Self::build(false).await
    }

    async fn build(register: bool) -> Self {
        let storage = InMemoryStorage::new();
        let locks = InMemoryLockManager::new(LockSettings {
            retry_delay: Duration::from_millis(5),
            ..LockSettings::default()
        });
        let (broker, queues) = InMemoryBroker::new(64);
        let listener = Arc::new(EventListener::builder(Arc::new(broker.clone()), queues).build());
        if register {
            listener.register(topics::ON_INVENTORY_DEDUCT_SUCCESS);
        }
        listener.start().await.unwrap();

        let orchestrator = Arc::new(InventoryOrchestrator::new(
            storage.clone(),
            Arc::new(locks.clone()),
            listener.clone(),
            OrchestratorSettings::default(),
        ));
        Self {
            storage,
            locks,
            broker,
            listener,
            orchestrator,
        }
    }

    pub async fn product(&self, stock: i64) -> ProductId {
        self.storage
            .insert_product(NewProduct::new(format!("SKU-{stock}-{}", uuid_suffix()), stock))
            .await
            .id
    }

    pub async fn variant(&self, product: ProductId, stock: i64) -> VariantId {
        self.storage
            .insert_variant(NewVariant::new(product, format!("SZ-{}", uuid_suffix()), stock))
            .await
            .id
    }

    pub async fn confirmations(&self) -> usize {
        self.broker
            .messages(topics::ON_INVENTORY_DEDUCT_SUCCESS)
            .await
            .len()
    }
}

fn uuid_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
