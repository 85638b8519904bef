//! Stock storage for the inventory deduction service.
//!
//! Provides the storage abstraction with Postgres and in-memory backends, the
//! idempotency ledger, and the transaction manager with its saga barrier mode.

pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod postgres;
pub mod store;
pub mod transaction;

pub use error::{Result, StorageError};
pub use ledger::IdempotencyLedger;
pub use memory::InMemoryStorage;
pub use models::{
    IdempotencyRecord, LedgerKind, NewIdempotencyRecord, NewProduct, NewVariant, Product,
    ProductVariant, StockTarget,
};
pub use postgres::{PoolSettings, PostgresStorage};
pub use store::{Storage, StorageTx};
pub use transaction::{BarrierOutcome, TransactionManager, TxFuture};
