//! Error types for ctxwarden-state

use thiserror::Error;

/// Errors raised while connecting to or preparing a backend
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by the storage traits ([`crate::WindowRepository`],
/// [`crate::CounterCache`]).
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    #[error("window not found: {window_id}")]
    WindowNotFound { window_id: String },

    #[error("item not found: {item_id}")]
    ItemNotFound { item_id: String },

    /// A counter-cache key holds a value of a different shape
    /// (e.g. `incr` against a list).
    #[error("key {key} holds the wrong kind of value, expected {expected}")]
    WrongType { key: String, expected: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// True for the three typed-absence variants.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StorageError::ConversationNotFound { .. }
                | StorageError::WindowNotFound { .. }
                | StorageError::ItemNotFound { .. }
        )
    }
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
