//! Inventory deduction for paid orders.
//!
//! The [`InventoryOrchestrator`] turns at-least-once payment notifications
//! into exactly-once stock deductions: an order-scoped distributed lock keeps
//! replicas from racing, the idempotency ledger remembers what was applied,
//! and the ledger record commits in the same transaction as the stock change.
//! A confirmation that cannot be delivered ends up on the dead-letter topic,
//! whose subscriber restores the stock through the same machinery.

pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pool;
pub mod request;
pub mod subscriber;

pub use error::{InventoryError, Result};
pub use events::{InventoryDeducted, PaidItem, PaymentSucceeded, topics};
pub use orchestrator::{
    DeductionOutcome, InventoryOrchestrator, OrchestratorSettings, deduct_lock_key,
    revert_lock_key,
};
pub use pool::{PooledRequest, RequestPool};
pub use request::{InventoryDeductionRequest, ProductLine, VariantLine};
pub use subscriber::{DeductionCompensationHandler, PaymentEventHandler, build_dispatcher};
