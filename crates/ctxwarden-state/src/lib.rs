//! ctxwarden-state: persistence layer for ctxwarden
//!
//! This crate provides the storage collaborators the context-window core
//! depends on. It handles all I/O with SurrealDB and ships in-memory fakes
//! with identical semantics for tests.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: token-accounting integrity and transactionality.
//!
//! ## Key Components
//!
//! - `WindowRepository`: conversations, windows and items
//! - `CounterCache`: counters and bounded lists with expiry
//! - `SurrealWindowRepository`: SurrealDB implementation of the repository
//! - `SurrealConfig`: endpoint resolution (memory, local surrealkv, remote ws)

mod error;
pub mod fakes;
mod handle;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use error::{StateError, StorageError};
pub use handle::{connect, Credentials, SurrealConfig, DEFAULT_LOCAL_PATH};
pub use schema::{ConversationRow, ItemRow, WindowRow};
pub use storage_traits::{
    ContextItem, ContextWindow, ConversationId, CounterCache, InclusionUpdate, ItemId, ItemType,
    NewItem, Priority, StorageResult, StoreCounts, WindowId, WindowRepository,
};
pub use surreal_store::SurrealWindowRepository;

/// Result type for ctxwarden-state connection and setup operations
pub type Result<T> = std::result::Result<T, StateError>;
