//! SurrealDB-backed WindowRepository implementation
//!
//! Uses `schema::{ConversationRow, WindowRow, ItemRow}` for persistence,
//! converting to/from `storage_traits` types at the boundary. Every mutation
//! that touches token accounting runs the item change and the window update
//! inside one SurrealQL transaction.

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::handle::{self, SurrealConfig};
use crate::schema::{ConversationRow, CountRow, ItemRow, WindowRow};
use crate::storage_traits::{
    ContextItem, ContextWindow, ConversationId, InclusionUpdate, ItemId, NewItem, Priority,
    StorageResult, StoreCounts, WindowId, WindowRepository,
};

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// SurrealDB-backed implementation of [`WindowRepository`].
pub struct SurrealWindowRepository {
    db: Surreal<Any>,
}

impl SurrealWindowRepository {
    /// Create an in-memory instance (`mem://`) for tests and demos.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&SurrealConfig::in_memory()).await
    }

    /// Connect using an explicit configuration.
    pub async fn connect(config: &SurrealConfig) -> crate::Result<Self> {
        let db = handle::connect(config).await?;
        Ok(Self { db })
    }

    /// Connect using [`SurrealConfig::from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        Self::connect(&SurrealConfig::from_env()).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_window(&self, window_id: &WindowId) -> StorageResult<WindowRow> {
        let mut res = self
            .db
            .query("SELECT * FROM windows WHERE window_id = $wid")
            .bind(("wid", window_id.0.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<WindowRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::WindowNotFound {
                window_id: window_id.0.clone(),
            })
    }

    async fn fetch_item(&self, item_id: &ItemId) -> StorageResult<ItemRow> {
        let mut res = self
            .db
            .query("SELECT * FROM items WHERE item_id = $iid")
            .bind(("iid", item_id.0.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<ItemRow> = res.take(0).map_err(backend)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::ItemNotFound {
                item_id: item_id.0.clone(),
            })
    }

    async fn ensure_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        if self.conversation_exists(conversation_id).await? {
            Ok(())
        } else {
            Err(StorageError::ConversationNotFound {
                conversation_id: conversation_id.0.clone(),
            })
        }
    }

    async fn count(&self, sql: &'static str) -> StorageResult<u64> {
        let mut res = self.db.query(sql).await.map_err(backend)?;
        let rows: Vec<CountRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(|r| r.n).unwrap_or(0))
    }
}

#[async_trait]
impl WindowRepository for SurrealWindowRepository {
    async fn create_conversation(&self) -> StorageResult<ConversationId> {
        let conversation_id = ConversationId::new();
        self.db
            .query("CREATE conversations CONTENT $row")
            .bind(("row", ConversationRow::new(&conversation_id)))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        debug!(conversation_id = %conversation_id, "conversation created");
        Ok(conversation_id)
    }

    async fn conversation_exists(&self, conversation_id: &ConversationId) -> StorageResult<bool> {
        let mut res = self
            .db
            .query("SELECT * FROM conversations WHERE conversation_id = $cid")
            .bind(("cid", conversation_id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<ConversationRow> = res.take(0).map_err(backend)?;
        Ok(!rows.is_empty())
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    async fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        self.ensure_conversation(conversation_id).await?;

        let mut res = self
            .db
            .query("SELECT VALUE window_id FROM windows WHERE conversation_id = $cid")
            .bind(("cid", conversation_id.0.clone()))
            .await
            .map_err(backend)?;
        let window_ids: Vec<String> = res.take(0).map_err(backend)?;

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                DELETE items WHERE window_id IN $wids;
                DELETE windows WHERE conversation_id = $cid;
                DELETE conversations WHERE conversation_id = $cid;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("wids", window_ids))
            .bind(("cid", conversation_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(())
    }

    async fn active_window(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ContextWindow>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM windows WHERE conversation_id = $cid AND is_active = true \
                 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(("cid", conversation_id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<WindowRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().next().map(WindowRow::into_record))
    }

    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    async fn create_window(
        &self,
        conversation_id: &ConversationId,
        max_tokens: u64,
    ) -> StorageResult<ContextWindow> {
        self.ensure_conversation(conversation_id).await?;

        let row = WindowRow::new(conversation_id, max_tokens);
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                UPDATE windows SET is_active = false WHERE conversation_id = $cid AND is_active = true;
                CREATE windows CONTENT $row;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("cid", conversation_id.0.clone()))
            .bind(("row", row.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        Ok(row.into_record())
    }

    async fn get_window(&self, window_id: &WindowId) -> StorageResult<ContextWindow> {
        Ok(self.fetch_window(window_id).await?.into_record())
    }

    async fn list_windows(&self, active_only: bool) -> StorageResult<Vec<ContextWindow>> {
        let sql = if active_only {
            "SELECT * FROM windows WHERE is_active = true ORDER BY created_at ASC"
        } else {
            "SELECT * FROM windows ORDER BY created_at ASC"
        };
        let mut res = self.db.query(sql).await.map_err(backend)?;
        let rows: Vec<WindowRow> = res.take(0).map_err(backend)?;
        Ok(rows.into_iter().map(WindowRow::into_record).collect())
    }

    #[instrument(skip(self, item), fields(window_id = %item.window_id))]
    async fn insert_item(&self, item: NewItem) -> StorageResult<ContextItem> {
        let window = self.fetch_window(&item.window_id).await?;
        let row = ItemRow::new(item, window.next_position);

        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                CREATE items CONTENT $item;
                UPDATE windows SET current_tokens += $tokens, next_position += 1 WHERE window_id = $wid;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("item", row.clone()))
            .bind(("tokens", row.token_count))
            .bind(("wid", window.window_id))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;

        row.into_record()
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    async fn set_item_included(
        &self,
        item_id: &ItemId,
        included: bool,
    ) -> StorageResult<InclusionUpdate> {
        let mut row = self.fetch_item(item_id).await?;
        let window_id = WindowId(row.window_id.clone());

        if row.is_included == included {
            let window = self.fetch_window(&window_id).await?;
            return Ok(InclusionUpdate {
                item: row.into_record()?,
                changed: false,
                window_tokens: window.current_tokens,
            });
        }

        let delta = if included {
            row.token_count as i64
        } else {
            -(row.token_count as i64)
        };
        self.db
            .query(
                r#"
                BEGIN TRANSACTION;
                UPDATE items SET is_included = $included WHERE item_id = $iid;
                UPDATE windows SET current_tokens += $delta WHERE window_id = $wid;
                COMMIT TRANSACTION;
                "#,
            )
            .bind(("included", included))
            .bind(("iid", item_id.0.clone()))
            .bind(("delta", delta))
            .bind(("wid", window_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;

        row.is_included = included;
        let window = self.fetch_window(&window_id).await?;
        Ok(InclusionUpdate {
            item: row.into_record()?,
            changed: true,
            window_tokens: window.current_tokens,
        })
    }

    async fn set_item_priority(
        &self,
        item_id: &ItemId,
        priority: Priority,
    ) -> StorageResult<ContextItem> {
        let mut row = self.fetch_item(item_id).await?;
        self.db
            .query("UPDATE items SET priority = $priority WHERE item_id = $iid")
            .bind(("priority", priority.as_str().to_string()))
            .bind(("iid", item_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        row.priority = priority.as_str().to_string();
        row.into_record()
    }

    async fn set_item_relevance(
        &self,
        item_id: &ItemId,
        score: f64,
    ) -> StorageResult<ContextItem> {
        let mut row = self.fetch_item(item_id).await?;
        self.db
            .query("UPDATE items SET relevance_score = $score WHERE item_id = $iid")
            .bind(("score", score))
            .bind(("iid", item_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;
        row.relevance_score = score;
        row.into_record()
    }

    async fn get_item(&self, item_id: &ItemId) -> StorageResult<ContextItem> {
        self.fetch_item(item_id).await?.into_record()
    }

    async fn list_items(
        &self,
        window_id: &WindowId,
        included_only: bool,
    ) -> StorageResult<Vec<ContextItem>> {
        // Verify window exists
        self.fetch_window(window_id).await?;

        let sql = if included_only {
            "SELECT * FROM items WHERE window_id = $wid AND is_included = true ORDER BY position ASC"
        } else {
            "SELECT * FROM items WHERE window_id = $wid ORDER BY position ASC"
        };
        let mut res = self
            .db
            .query(sql)
            .bind(("wid", window_id.0.clone()))
            .await
            .map_err(backend)?;
        let rows: Vec<ItemRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(ItemRow::into_record).collect()
    }

    async fn recompute_window_tokens(&self, window_id: &WindowId) -> StorageResult<ContextWindow> {
        let included = self.list_items(window_id, true).await?;
        let total: u64 = included.iter().map(|i| i.token_count).sum();

        self.db
            .query("UPDATE windows SET current_tokens = $total WHERE window_id = $wid")
            .bind(("total", total))
            .bind(("wid", window_id.0.clone()))
            .await
            .map_err(backend)?
            .check()
            .map_err(backend)?;

        self.get_window(window_id).await
    }

    async fn counts(&self) -> StorageResult<StoreCounts> {
        Ok(StoreCounts {
            conversations: self
                .count("SELECT count() AS n FROM conversations GROUP ALL")
                .await?,
            windows: self.count("SELECT count() AS n FROM windows GROUP ALL").await?,
            active_windows: self
                .count("SELECT count() AS n FROM windows WHERE is_active = true GROUP ALL")
                .await?,
            items: self.count("SELECT count() AS n FROM items GROUP ALL").await?,
            included_items: self
                .count("SELECT count() AS n FROM items WHERE is_included = true GROUP ALL")
                .await?,
        })
    }
}
