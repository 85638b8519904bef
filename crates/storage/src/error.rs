use common::{ErrorClassification, ErrorKind, Interrupted, OrderId};
use thiserror::Error;

use crate::models::{LedgerKind, StockTarget};

/// Errors that can occur when interacting with stock storage.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The product or variant row does not exist.
    #[error("{0} not found")]
    NotFound(StockTarget),

    /// A deduction would drive stock below zero.
    #[error("insufficient stock for {target}: requested {requested}, available {available}")]
    InsufficientStock {
        target: StockTarget,
        requested: i64,
        available: i64,
    },

    #[error("invalid quantity {quantity} for {target}")]
    InvalidQuantity { target: StockTarget, quantity: i64 },

    /// The unique (order, kind) constraint rejected a second ledger record.
    #[error("order {order_id} already has a {kind} record")]
    DuplicateRecord { order_id: OrderId, kind: LedgerKind },

    /// A barrier transaction was requested without saga branch information.
    #[error("request context carries no saga branch")]
    MissingSagaBranch,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    CorruptRecord(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl ErrorClassification for StorageError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            Self::InvalidQuantity { .. } | Self::MissingSagaBranch => ErrorKind::Validation,
            Self::DuplicateRecord { .. } => ErrorKind::AlreadyExists,
            Self::Unavailable(_) => ErrorKind::Transport,
            Self::Interrupted(_) => ErrorKind::Timeout,
            Self::Database(err) => classify_sqlx(err),
            Self::CorruptRecord(_) | Self::Migration(_) => ErrorKind::Internal,
        }
    }
}

/// Connectivity problems and serialization conflicts are worth retrying;
/// everything else the database reports is a bug or a data problem.
fn classify_sqlx(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ErrorKind::Transport,
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            // serialization_failure, deadlock_detected, lock_not_available
            Some("40001" | "40P01" | "55P03") => ErrorKind::Transport,
            _ => ErrorKind::Internal,
        },
        _ => ErrorKind::Internal,
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
