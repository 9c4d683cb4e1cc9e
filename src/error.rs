use thiserror::Error;

/// Errors reported by the remote resource store.
///
/// The variant decides what the reconciler does with the failed action.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("Transient network error: {0}")]
    Transient(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl RemoteError {
    /// Permission, validation and conflict errors are never retried.
    pub fn is_terminal(&self) -> bool {
        !self.is_retryable()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Errors from the durable key-value storage.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Queue corruption: {0}")]
    QueueCorruption(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Action '{0}' not found")]
    UnknownAction(String),

    #[error("Sync engine is not running")]
    EngineStopped,
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_classification() {
        assert!(RemoteError::Transient("timeout".into()).is_retryable());
        assert!(RemoteError::PermissionDenied("nope".into()).is_terminal());
        assert!(RemoteError::Validation("bad".into()).is_terminal());
        assert!(RemoteError::Conflict("gone".into()).is_terminal());
    }

    #[test]
    fn test_error_display() {
        let err = SyncError::from(RemoteError::Conflict("document deleted".into()));
        assert_eq!(err.to_string(), "Remote error: Conflict: document deleted");
    }
}
