//! Error taxonomy for ctxwarden core.

use ctxwarden_state::StorageError;

/// ctxwarden core errors.
#[derive(Debug, thiserror::Error)]
pub enum CtxwardenError {
    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("window not found: {0}")]
    WindowNotFound(String),

    #[error("item not found: {0}")]
    ItemNotFound(String),

    /// Cached `current_tokens` disagrees with the sum over included items.
    #[error("token sum mismatch: cached {cached}, actual {actual}")]
    InvariantViolation { cached: u64, actual: u64 },

    #[error("strategy {strategy} failed: {reason}")]
    StrategyFailure { strategy: String, reason: String },

    #[error("unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("invalid segmentation: {0}")]
    InvalidSegmentation(String),

    #[error("relevance score must be within [0, 1], got {0}")]
    InvalidRelevance(f64),

    #[error("collaborator {collaborator} timed out after {timeout_ms}ms")]
    CollaboratorTimeout {
        collaborator: String,
        timeout_ms: u64,
    },

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[source] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CtxwardenError {
    /// Typed absence of a directly looked-up object.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CtxwardenError::ConversationNotFound(_)
                | CtxwardenError::WindowNotFound(_)
                | CtxwardenError::ItemNotFound(_)
        )
    }
}

impl From<StorageError> for CtxwardenError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ConversationNotFound { conversation_id } => {
                CtxwardenError::ConversationNotFound(conversation_id)
            }
            StorageError::WindowNotFound { window_id } => CtxwardenError::WindowNotFound(window_id),
            StorageError::ItemNotFound { item_id } => CtxwardenError::ItemNotFound(item_id),
            other => CtxwardenError::Storage(other),
        }
    }
}

/// Result type for ctxwarden core operations.
pub type Result<T> = std::result::Result<T, CtxwardenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_not_found_maps_to_typed_absence() {
        let err: CtxwardenError = StorageError::WindowNotFound {
            window_id: "w1".into(),
        }
        .into();
        assert!(matches!(err, CtxwardenError::WindowNotFound(ref id) if id == "w1"));
        assert!(err.is_not_found());

        let err: CtxwardenError = StorageError::Backend("disk full".into()).into();
        assert!(matches!(err, CtxwardenError::Storage(_)));
        assert!(!err.is_not_found());
    }

    #[test]
    fn invariant_violation_display() {
        let err = CtxwardenError::InvariantViolation {
            cached: 120,
            actual: 100,
        };
        let msg = err.to_string();
        assert!(msg.contains("cached 120"));
        assert!(msg.contains("actual 100"));
    }
}
