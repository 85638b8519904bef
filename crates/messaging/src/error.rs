use common::{ErrorClassification, ErrorKind, Interrupted};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    /// Publish to a topic nobody registered.
    #[error("event not found: topic '{0}' is not registered")]
    NotRegistered(String),

    #[error("event listener is closed")]
    Closed,

    /// The transport refused the envelope before it left the process.
    #[error("transport rejected message for '{topic}': {reason}")]
    Rejected { topic: String, reason: String },

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode payload from '{topic}': {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid messaging configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Interrupted(#[from] Interrupted),
}

impl ErrorClassification for MessagingError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::NotRegistered(_) | Self::Closed => ErrorKind::FailedPrecondition,
            Self::Rejected { .. } => ErrorKind::Transport,
            Self::Decode { .. } | Self::Config(_) => ErrorKind::Validation,
            Self::Encode(_) => ErrorKind::Internal,
            Self::Interrupted(_) => ErrorKind::Timeout,
        }
    }
}

pub type Result<T> = std::result::Result<T, MessagingError>;
