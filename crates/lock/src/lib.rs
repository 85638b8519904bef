//! Cross-replica mutual exclusion.
//!
//! A [`LockManager`] hands out [`DistributedLock`] handles bound to a key and
//! a TTL lease. The lease is the crash-recovery path: a holder that dies
//! without unlocking loses the lock when the lease expires.

pub mod error;
pub mod lease;
pub mod manager;
pub mod memory;
pub mod redlock;

pub use error::{LockError, Result};
pub use lease::PostgresLeaseLockManager;
pub use manager::{DistributedLock, LockManager, LockSettings, acquire_with_retry};
pub use memory::InMemoryLockManager;
pub use redlock::RedisLockManager;
