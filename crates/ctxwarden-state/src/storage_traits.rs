//! Storage trait definitions for ctxwarden
//!
//! These traits define the two collaborators the core depends on:
//! - `WindowRepository`: conversation / window / item persistence with the
//!   token-accounting invariant maintained on every mutation
//! - `CounterCache`: key / counter / bounded-list store with expiry, used for
//!   best-effort pruning telemetry
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id
            pub fn new() -> Self {
                $name(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

id_newtype!(
    /// Identifier of a conversation (the owner of context windows)
    ConversationId
);
id_newtype!(
    /// Identifier of a context window
    WindowId
);
id_newtype!(
    /// Identifier of a context item
    ItemId
);

// ---------------------------------------------------------------------------
// Item classification
// ---------------------------------------------------------------------------

/// What kind of context an item carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Message,
    Summary,
    Preference,
    System,
    Metadata,
}

impl ItemType {
    pub const ALL: [ItemType; 5] = [
        ItemType::Message,
        ItemType::Summary,
        ItemType::Preference,
        ItemType::System,
        ItemType::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::Message => "message",
            ItemType::Summary => "summary",
            ItemType::Preference => "preference",
            ItemType::System => "system",
            ItemType::Metadata => "metadata",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "message" => Ok(ItemType::Message),
            "summary" => Ok(ItemType::Summary),
            "preference" => Ok(ItemType::Preference),
            "system" => Ok(ItemType::System),
            "metadata" => Ok(ItemType::Metadata),
            other => Err(format!("unknown item type: {other}")),
        }
    }
}

/// Retention priority of an item. Declaration order is rank order:
/// `Critical` (0) sorts before `Low` (3).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Critical=0 .. Low=3
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A token-budgeted container of items for one conversation.
///
/// `current_tokens` is a cached sum over the included items; only the
/// repository mutations below may change it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub id: WindowId,
    pub conversation_id: ConversationId,
    pub max_tokens: u64,
    pub current_tokens: u64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ContextWindow {
    /// `current_tokens` as a percentage of `max_tokens` (100.0 when the
    /// budget is zero and anything is included).
    pub fn usage_percent(&self) -> f64 {
        if self.max_tokens == 0 {
            return if self.current_tokens == 0 { 0.0 } else { 100.0 };
        }
        self.current_tokens as f64 * 100.0 / self.max_tokens as f64
    }
}

/// One unit of context attached to a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: ItemId,
    pub window_id: WindowId,
    /// Weak back-reference to an originating message
    pub source_ref: Option<String>,
    /// Present only when the item is not message-backed
    pub content: Option<String>,
    pub item_type: ItemType,
    pub priority: Priority,
    pub relevance_score: f64,
    /// Insertion index, strictly increasing and never reused within a window
    pub position: u64,
    pub token_count: u64,
    pub is_included: bool,
    pub created_at: DateTime<Utc>,
}

/// Everything the repository needs to persist a new item. Position and
/// inclusion are assigned by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewItem {
    pub window_id: WindowId,
    pub source_ref: Option<String>,
    pub content: Option<String>,
    pub item_type: ItemType,
    pub priority: Priority,
    pub relevance_score: f64,
    pub token_count: u64,
}

/// Outcome of an inclusion toggle.
#[derive(Debug, Clone, PartialEq)]
pub struct InclusionUpdate {
    pub item: ContextItem,
    /// False when the item was already in the requested state
    pub changed: bool,
    /// The owning window's `current_tokens` after the update
    pub window_tokens: u64,
}

/// Store-wide record counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCounts {
    pub conversations: u64,
    pub windows: u64,
    pub active_windows: u64,
    pub items: u64,
    pub included_items: u64,
}

// ---------------------------------------------------------------------------
// WindowRepository: persistence collaborator
// ---------------------------------------------------------------------------

/// Window / item persistence.
///
/// Guarantees:
/// - `window.current_tokens` equals the sum of `token_count` over the
///   window's included items after every call (`insert_item`,
///   `set_item_included` and `recompute_window_tokens` update it in the same
///   step as the item change).
/// - Item positions are strictly increasing per window and never reused.
/// - At most one active window per conversation; `create_window` deactivates
///   the previous one without deleting it.
/// - Items are only physically removed by `delete_conversation`.
///
/// Callers are expected to serialise mutations of any single window.
#[async_trait]
pub trait WindowRepository: Send + Sync {
    /// Register a new conversation.
    async fn create_conversation(&self) -> StorageResult<ConversationId>;

    /// Whether a conversation reference is valid.
    async fn conversation_exists(&self, conversation_id: &ConversationId) -> StorageResult<bool>;

    /// Remove a conversation with all of its windows and items.
    async fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()>;

    /// The active window of a conversation, if any.
    async fn active_window(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ContextWindow>>;

    /// Create a new active window, deactivating the current one.
    /// Fails with `ConversationNotFound` for an unknown conversation.
    async fn create_window(
        &self,
        conversation_id: &ConversationId,
        max_tokens: u64,
    ) -> StorageResult<ContextWindow>;

    /// Fetch a window by ID. Returns `WindowNotFound` if absent.
    async fn get_window(&self, window_id: &WindowId) -> StorageResult<ContextWindow>;

    /// List windows, optionally only active ones.
    async fn list_windows(&self, active_only: bool) -> StorageResult<Vec<ContextWindow>>;

    /// Persist an item at the next position, included, and add its tokens to
    /// the window.
    async fn insert_item(&self, item: NewItem) -> StorageResult<ContextItem>;

    /// Toggle inclusion, adjusting the window's token sum. No-op when the
    /// item is already in the requested state.
    async fn set_item_included(
        &self,
        item_id: &ItemId,
        included: bool,
    ) -> StorageResult<InclusionUpdate>;

    async fn set_item_priority(
        &self,
        item_id: &ItemId,
        priority: Priority,
    ) -> StorageResult<ContextItem>;

    async fn set_item_relevance(&self, item_id: &ItemId, score: f64)
        -> StorageResult<ContextItem>;

    /// Fetch an item by ID. Returns `ItemNotFound` if absent.
    async fn get_item(&self, item_id: &ItemId) -> StorageResult<ContextItem>;

    /// Items of a window ordered by position ascending.
    async fn list_items(
        &self,
        window_id: &WindowId,
        included_only: bool,
    ) -> StorageResult<Vec<ContextItem>>;

    /// Recompute `current_tokens` from the included items and store it.
    /// Returns the window after the repair.
    async fn recompute_window_tokens(&self, window_id: &WindowId) -> StorageResult<ContextWindow>;

    async fn counts(&self) -> StorageResult<StoreCounts>;
}

// ---------------------------------------------------------------------------
// CounterCache: telemetry collaborator
// ---------------------------------------------------------------------------

/// Key / counter / small-list store with expiry.
///
/// Semantics follow the usual key-value cache conventions:
/// - counters are signed 64-bit integers stored under plain keys; `incr` on a
///   missing key starts from zero
/// - `push` prepends to a list (newest first); `trim` keeps the inclusive
///   index range `[start, stop]`; `range` reads an inclusive range
/// - an expired key behaves as absent
#[async_trait]
pub trait CounterCache: Send + Sync {
    async fn incr(&self, key: &str) -> StorageResult<i64>;

    async fn incr_by(&self, key: &str, delta: i64) -> StorageResult<i64>;

    async fn get(&self, key: &str) -> StorageResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Set a time-to-live on a key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool>;

    /// Prepend to a list, returning its new length.
    async fn push(&self, key: &str, value: &str) -> StorageResult<u64>;

    async fn trim(&self, key: &str, start: usize, stop: usize) -> StorageResult<()>;

    async fn range(&self, key: &str, start: usize, stop: usize) -> StorageResult<Vec<String>>;
}
