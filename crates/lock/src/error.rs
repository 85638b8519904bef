use common::{ErrorClassification, ErrorKind, Interrupted};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock manager is closed")]
    Closed,

    /// `lock` gave up after the configured number of tries.
    #[error("lock '{key}' not acquired after {attempts} attempts")]
    NotAcquired { key: String, attempts: u32 },

    /// Not enough backing nodes answered to reach a decision.
    #[error("lock backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid lock configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl ErrorClassification for LockError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Closed => ErrorKind::FailedPrecondition,
            Self::NotAcquired { .. } => ErrorKind::Concurrency,
            Self::Config(_) => ErrorKind::Validation,
            Self::Interrupted(_) => ErrorKind::Timeout,
            Self::Unavailable(_) | Self::Redis(_) | Self::Database(_) => ErrorKind::Transport,
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
