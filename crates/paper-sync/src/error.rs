use thiserror::Error;

/// Result type for paper-sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while editing, rebasing or relaying documents
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid step: {message}")]
    InvalidStep { message: String },

    #[error("Schema violation: {message}")]
    SchemaViolation { message: String },

    #[error("Out of date: submitted against version {base_version}, relay is at {current_version}")]
    OutOfDate {
        base_version: u64,
        current_version: u64,
    },

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("Not authorized to join document: {document_id}")]
    Unauthorized { document_id: String },

    #[error("Client is not attached to a document")]
    NotAttached,

    #[error("A cold resync is waiting for a policy decision")]
    ResyncPending,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[cfg(feature = "persistence")]
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub(crate) fn invalid_step(message: impl Into<String>) -> Self {
        SyncError::InvalidStep {
            message: message.into(),
        }
    }

    pub(crate) fn schema(message: impl Into<String>) -> Self {
        SyncError::SchemaViolation {
            message: message.into(),
        }
    }

    /// Whether the error is expected steady-state traffic rather than a defect.
    ///
    /// `OutOfDate` is resolved by rebasing and resubmitting, `TransportFailure`
    /// by reconnecting. Everything else means the input itself was wrong.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SyncError::OutOfDate { .. } | SyncError::TransportFailure(_)
        )
    }

    /// Whether the error is a local structural failure that must never reach the relay
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidStep { .. } | SyncError::SchemaViolation { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let out_of_date = SyncError::OutOfDate {
            base_version: 5,
            current_version: 7,
        };
        assert!(out_of_date.is_recoverable());
        assert!(!out_of_date.is_structural());

        let invalid = SyncError::invalid_step("position 40 out of range");
        assert!(invalid.is_structural());
        assert!(!invalid.is_recoverable());
        assert_eq!(invalid.to_string(), "Invalid step: position 40 out of range");

        assert!(SyncError::TransportFailure("closed".into()).is_recoverable());
        assert!(SyncError::schema("bad content").is_structural());
    }
}
