//! SurrealDB schema migrations and initialization
//!
//! Defines the `conversations`, `windows` and `items` tables with the
//! indexes the repository queries rely on.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all ctxwarden tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing ctxwarden SurrealDB schema");

    init_conversations_table(db).await?;
    init_windows_table(db).await?;
    init_items_table(db).await?;

    info!("ctxwarden schema initialization complete");
    Ok(())
}

/// Initialize `conversations` table
///
/// Schema:
/// ```text
/// TABLE conversations {
///   conversation_id: STRING (unique)
///   created_at:      DATETIME
/// }
/// ```
async fn init_conversations_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing conversations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS conversations SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_conversation_id ON TABLE conversations COLUMNS conversation_id UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    debug!("conversations table initialized");
    Ok(())
}

/// Initialize `windows` table
///
/// Schema:
/// ```text
/// TABLE windows {
///   window_id:       STRING (unique)
///   conversation_id: STRING (indexed)
///   max_tokens:      INT
///   current_tokens:  INT  (cached sum over included items)
///   next_position:   INT  (next item position, never decremented)
///   is_active:       BOOL
///   created_at:      DATETIME
/// }
/// ```
///
/// At most one active window per conversation is enforced by the
/// repository, which deactivates and creates in one transaction.
async fn init_windows_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing windows table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS windows SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_window_id ON TABLE windows COLUMNS window_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_window_conversation ON TABLE windows COLUMNS conversation_id, is_active;
    "#;

    db.query(sql).await?.check()?;
    debug!("windows table initialized");
    Ok(())
}

/// Initialize `items` table
///
/// Schema:
/// ```text
/// TABLE items {
///   item_id:         STRING (unique)
///   window_id:       STRING
///   position:        INT    ((window_id, position) unique)
///   source_ref:      STRING?
///   content:         STRING?
///   item_type:       STRING (message | summary | preference | system | metadata)
///   priority:        STRING (critical | high | medium | low)
///   relevance_score: FLOAT
///   token_count:     INT
///   is_included:     BOOL
///   created_at:      DATETIME
/// }
/// ```
async fn init_items_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing items table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS items SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_item_id ON TABLE items COLUMNS item_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_item_window_position ON TABLE items COLUMNS window_id, position UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_item_window_included ON TABLE items COLUMNS window_id, is_included;
    "#;

    db.query(sql).await?.check()?;
    debug!("items table initialized");
    Ok(())
}
