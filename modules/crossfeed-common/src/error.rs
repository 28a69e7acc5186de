use thiserror::Error;

/// Result type alias for indexing operations.
pub type Result<T> = std::result::Result<T, IndexerError>;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Source unreachable: {source_id}: {reason}")]
    SourceUnreachable { source_id: String, reason: String },

    #[error("Source protocol error: {source_id}: {reason}")]
    SourceProtocol { source_id: String, reason: String },

    #[error("Malformed identifier: {0}")]
    MalformedId(String),

    #[error("Unrecognized resource kind: {0}")]
    UnrecognizedResourceKind(String),

    #[error("Path {path} is outside the requested prefix {prefix}")]
    OutsidePrefix { path: String, prefix: String },

    #[error("Malformed payload for {uri}: {reason}")]
    MalformedPayload { uri: String, reason: String },

    #[error("Resource no longer served by its source: {uri}")]
    ResourceGone { uri: String },

    #[error("Apply failure: {0}")]
    ApplyFailure(String),

    #[error("Cursor store error: {0}")]
    CursorStore(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IndexerError {
    /// Errors that abort the whole batch for a source. The batch is re-fetched
    /// next cycle from the stored cursors.
    ///
    /// Everything else is a per-event skip: the content that caused it will not
    /// change on retry, so the event is consumed and the cursor moves past it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            IndexerError::SourceUnreachable { .. }
                | IndexerError::SourceProtocol { .. }
                | IndexerError::ApplyFailure(_)
                | IndexerError::CursorStore(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_aborting_errors_are_transient() {
        let unreachable = IndexerError::SourceUnreachable {
            source_id: "a".into(),
            reason: "connection refused".into(),
        };
        assert!(unreachable.is_transient());
        assert!(IndexerError::ApplyFailure("disk full".into()).is_transient());
    }

    #[test]
    fn per_event_errors_are_skipped() {
        assert!(!IndexerError::MalformedId("x".into()).is_transient());
        assert!(!IndexerError::UnrecognizedResourceKind("/pub/app/x".into()).is_transient());
        assert!(!IndexerError::ResourceGone { uri: "u".into() }.is_transient());
    }
}
