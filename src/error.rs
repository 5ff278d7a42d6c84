//! Error taxonomy shared by the facades, the sync engine and the remote client.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// A local precondition failed. Never retried, never enqueued.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Connectivity problem or timeout talking to the remote store.
    #[error("network error: {0}")]
    Network(String),

    /// The remote store rejected the write (constraint violation, bad request, auth).
    #[error("remote rejected write: {0}")]
    Conflict(String),

    #[error("unsupported mutation {entity_type}/{operation}")]
    Unsupported {
        entity_type: String,
        operation: String,
    },

    /// Queue payload does not match the schema of its entity type.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// The mutation references a record that has not reached the server yet.
    #[error("waiting on unsynced record {0}")]
    Dependency(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    /// Network-class errors trigger the offline fallback in the facades.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Payload(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
