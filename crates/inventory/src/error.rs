use common::{ErrorClassification, ErrorKind, OrderId};
use lock::LockError;
use messaging::MessagingError;
use storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("invalid deduction request: {0}")]
    Validation(String),

    /// Another worker holds the order's lock; the notification is a duplicate.
    #[error("duplicate notification for order {0}")]
    DuplicateNotification(OrderId),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),
}

impl ErrorClassification for InventoryError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::DuplicateNotification(_) => ErrorKind::Concurrency,
            Self::Storage(err) => err.kind(),
            Self::Lock(err) => err.kind(),
            Self::Messaging(err) => err.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, InventoryError>;

#[cfg(test)]
mod tests {
    use common::ProductId;
    use storage::StockTarget;

    use super::*;

    #[test]
    fn kinds_follow_the_source_error() {
        assert_eq!(
            InventoryError::DuplicateNotification(OrderId::new(1)).kind(),
            ErrorKind::Concurrency
        );
        let insufficient = InventoryError::from(StorageError::InsufficientStock {
            target: StockTarget::Product(ProductId::new(1)),
            requested: 5,
            available: 2,
        });
        assert_eq!(insufficient.kind(), ErrorKind::InsufficientStock);
        assert!(insufficient.is_terminal());
        assert!(InventoryError::from(StorageError::Unavailable("down".into())).is_retryable());
    }
}
