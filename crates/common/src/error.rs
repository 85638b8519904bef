//! Error-kind taxonomy shared by every layer.
//!
//! Crate-local error enums stay rich; they only need to say which [`ErrorKind`]
//! they belong to. Retry and dead-letter policy is decided on the kind alone.

use serde::{Deserialize, Serialize};

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or empty request.
    Validation,
    /// Referenced product or variant does not exist.
    NotFound,
    PermissionDenied,
    Unauthenticated,
    /// Operation rejected because of the current state of the system.
    FailedPrecondition,
    /// Not enough stock to satisfy a line item.
    InsufficientStock,
    AlreadyExists,
    /// Lock not acquired: another replica is handling the same notification.
    Concurrency,
    /// Cancelled or deadline exceeded.
    Timeout,
    /// Broker or storage connectivity failure.
    Transport,
    Internal,
}

impl ErrorKind {
    /// Terminal kinds are never retried and never dead-lettered: redelivering
    /// the same input cannot change the outcome.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Validation
                | Self::NotFound
                | Self::PermissionDenied
                | Self::Unauthenticated
                | Self::FailedPrecondition
                | Self::InsufficientStock
                | Self::AlreadyExists
                | Self::Concurrency
        )
    }

    /// Everything that is not terminal is worth another attempt after a backoff.
    pub const fn is_retryable(self) -> bool {
        !self.is_terminal()
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::PermissionDenied => "permission_denied",
            Self::Unauthenticated => "unauthenticated",
            Self::FailedPrecondition => "failed_precondition",
            Self::InsufficientStock => "insufficient_stock",
            Self::AlreadyExists => "already_exists",
            Self::Concurrency => "concurrency",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implemented by every error type that can reach the retry or dead-letter layer.
pub trait ErrorClassification {
    fn kind(&self) -> ErrorKind;

    fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}
