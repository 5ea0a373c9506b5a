//! Row definitions for the ctxwarden SurrealDB tables
//!
//! Tables:
//! - conversations: registered conversation ids
//! - windows: context windows with their cached token sum
//! - items: context items, ordered per window by `position`
//!
//! Rows are converted to/from the `storage_traits` records at the
//! repository boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{
    ContextItem, ContextWindow, ConversationId, ItemId, NewItem, WindowId,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Row in `conversations`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRow {
    pub conversation_id: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl ConversationRow {
    pub fn new(conversation_id: &ConversationId) -> Self {
        Self {
            conversation_id: conversation_id.0.clone(),
            created_at: Utc::now(),
        }
    }
}

/// Row in `windows`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRow {
    pub window_id: String,
    pub conversation_id: String,
    pub max_tokens: u64,
    pub current_tokens: u64,
    pub next_position: u64,
    pub is_active: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl WindowRow {
    /// A fresh, active, empty window
    pub fn new(conversation_id: &ConversationId, max_tokens: u64) -> Self {
        Self {
            window_id: WindowId::new().0,
            conversation_id: conversation_id.0.clone(),
            max_tokens,
            current_tokens: 0,
            next_position: 0,
            is_active: true,
            created_at: Utc::now(),
        }
    }

    pub fn into_record(self) -> ContextWindow {
        ContextWindow {
            id: WindowId(self.window_id),
            conversation_id: ConversationId(self.conversation_id),
            max_tokens: self.max_tokens,
            current_tokens: self.current_tokens,
            is_active: self.is_active,
            created_at: self.created_at,
        }
    }
}

/// Row in `items`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemRow {
    pub item_id: String,
    pub window_id: String,
    pub position: u64,
    pub source_ref: Option<String>,
    pub content: Option<String>,
    /// "message" | "summary" | "preference" | "system" | "metadata"
    pub item_type: String,
    /// "critical" | "high" | "medium" | "low"
    pub priority: String,
    pub relevance_score: f64,
    pub token_count: u64,
    pub is_included: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
}

impl ItemRow {
    /// Row for a newly inserted item at `position`
    pub fn new(item: NewItem, position: u64) -> Self {
        Self {
            item_id: ItemId::new().0,
            window_id: item.window_id.0,
            position,
            source_ref: item.source_ref,
            content: item.content,
            item_type: item.item_type.as_str().to_string(),
            priority: item.priority.as_str().to_string(),
            relevance_score: item.relevance_score,
            token_count: item.token_count,
            is_included: true,
            created_at: Utc::now(),
        }
    }

    pub fn into_record(self) -> Result<ContextItem, StorageError> {
        let item_type = self.item_type.parse().map_err(StorageError::Serialization)?;
        let priority = self.priority.parse().map_err(StorageError::Serialization)?;
        Ok(ContextItem {
            id: ItemId(self.item_id),
            window_id: WindowId(self.window_id),
            source_ref: self.source_ref,
            content: self.content,
            item_type,
            priority,
            relevance_score: self.relevance_score,
            position: self.position,
            token_count: self.token_count,
            is_included: self.is_included,
            created_at: self.created_at,
        })
    }
}

/// Single-column `count()` result
#[derive(Debug, Clone, Deserialize)]
pub struct CountRow {
    pub n: u64,
}
