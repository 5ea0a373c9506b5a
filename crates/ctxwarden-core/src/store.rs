//! ContextStore: the window/item data model and its token accounting.
//!
//! Every mutation of a window runs under that window's async lock, so
//! accounting updates of one window never interleave. Different windows
//! proceed independently. Token accounting itself is delegated to the
//! repository, which updates `current_tokens` in the same step as the item
//! change.

use std::sync::Arc;

use ctxwarden_state::{
    ContextItem, ContextWindow, ConversationId, ItemId, ItemType, NewItem, Priority, StoreCounts,
    WindowId, WindowRepository,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::error::{CtxwardenError, Result};
use crate::locks::LockMap;
use crate::metrics::METRICS;
use crate::obs;
use crate::tokens::{CharRatioTokenCounter, TokenCounter};

/// Where an item's text comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemSource {
    /// Backed by a stored message: only the reference is kept on the item,
    /// the text is used to compute the token cost.
    Message { message_id: String, text: String },
    /// Free-standing content carried on the item itself.
    Inline(String),
}

/// Description of an item to attach to a window.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemSpec {
    pub item_type: ItemType,
    pub source: ItemSource,
    pub source_ref: Option<String>,
    pub priority: Priority,
    pub relevance_score: f64,
}

impl ItemSpec {
    pub fn new(item_type: ItemType, source: ItemSource) -> Self {
        let source_ref = match &source {
            ItemSource::Message { message_id, .. } => Some(message_id.clone()),
            ItemSource::Inline(_) => None,
        };
        Self {
            item_type,
            source,
            source_ref,
            priority: Priority::default(),
            relevance_score: 1.0,
        }
    }

    /// A message-backed conversation turn.
    pub fn message(message_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(
            ItemType::Message,
            ItemSource::Message {
                message_id: message_id.into(),
                text: text.into(),
            },
        )
    }

    pub fn inline(item_type: ItemType, content: impl Into<String>) -> Self {
        Self::new(item_type, ItemSource::Inline(content.into()))
    }

    pub fn summary(content: impl Into<String>) -> Self {
        Self::inline(ItemType::Summary, content)
    }

    pub fn preference(content: impl Into<String>) -> Self {
        Self::inline(ItemType::Preference, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::inline(ItemType::System, content)
    }

    pub fn metadata(content: impl Into<String>) -> Self {
        Self::inline(ItemType::Metadata, content)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_relevance(mut self, score: f64) -> Self {
        self.relevance_score = score;
        self
    }

    pub fn with_source_ref(mut self, source_ref: impl Into<String>) -> Self {
        self.source_ref = Some(source_ref.into());
        self
    }

    fn text(&self) -> &str {
        match &self.source {
            ItemSource::Message { text, .. } => text,
            ItemSource::Inline(content) => content,
        }
    }
}

/// Reject scores outside `[0, 1]` (NaN included).
pub fn validate_relevance(score: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(CtxwardenError::InvalidRelevance(score))
    }
}

/// Outcome of [`ContextStore::verify_window`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsistencyReport {
    pub window_id: WindowId,
    pub cached_tokens: u64,
    pub actual_tokens: u64,
    pub repaired: bool,
}

fn window_key(id: &WindowId) -> String {
    format!("window:{id}")
}

fn conversation_key(id: &ConversationId) -> String {
    format!("conversation:{id}")
}

/// Owner of the window/item model. Cheap to clone; clones share the
/// repository and the lock table.
#[derive(Clone)]
pub struct ContextStore {
    repo: Arc<dyn WindowRepository>,
    counter: Arc<dyn TokenCounter>,
    locks: Arc<LockMap>,
}

impl ContextStore {
    /// Store with the default character-ratio token counter.
    pub fn new(repo: Arc<dyn WindowRepository>) -> Self {
        Self::with_counter(repo, Arc::new(CharRatioTokenCounter::default()))
    }

    pub fn with_counter(repo: Arc<dyn WindowRepository>, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            repo,
            counter,
            locks: Arc::new(LockMap::default()),
        }
    }

    pub fn token_counter(&self) -> &dyn TokenCounter {
        self.counter.as_ref()
    }

    // -- conversations -------------------------------------------------------

    pub async fn create_conversation(&self) -> Result<ConversationId> {
        let id = self.repo.create_conversation().await?;
        debug!(conversation_id = %id, "conversation registered");
        Ok(id)
    }

    /// Tear down a conversation with every window and item it owns.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn delete_conversation(&self, conversation_id: &ConversationId) -> Result<()> {
        let _guard = self.locks.acquire(conversation_key(conversation_id)).await;
        let windows: Vec<WindowId> = self
            .repo
            .list_windows(false)
            .await?
            .into_iter()
            .filter(|w| &w.conversation_id == conversation_id)
            .map(|w| w.id)
            .collect();

        // Wait out in-flight mutations of the doomed windows.
        let mut guards = Vec::with_capacity(windows.len());
        for id in &windows {
            guards.push(self.locks.acquire(window_key(id)).await);
        }
        self.repo.delete_conversation(conversation_id).await?;
        drop(guards);

        self.locks.forget(windows.iter().map(window_key));
        obs::emit_conversation_deleted(conversation_id.as_str(), windows.len());
        Ok(())
    }

    // -- windows -------------------------------------------------------------

    /// The active window of a conversation, created with `default_max_tokens`
    /// when there is none.
    pub async fn get_or_create_active_window(
        &self,
        conversation_id: &ConversationId,
        default_max_tokens: u64,
    ) -> Result<ContextWindow> {
        let _guard = self.locks.acquire(conversation_key(conversation_id)).await;
        if !self.repo.conversation_exists(conversation_id).await? {
            return Err(CtxwardenError::ConversationNotFound(
                conversation_id.to_string(),
            ));
        }
        if let Some(window) = self.repo.active_window(conversation_id).await? {
            return Ok(window);
        }
        let window = self
            .repo
            .create_window(conversation_id, default_max_tokens)
            .await?;
        obs::emit_window_created(window.id.as_str(), conversation_id.as_str(), window.max_tokens);
        Ok(window)
    }

    /// Deactivate the current window (kept for audit) and open a new one.
    #[instrument(skip(self), fields(conversation_id = %conversation_id))]
    pub async fn rotate_window(
        &self,
        conversation_id: &ConversationId,
        new_max_tokens: u64,
    ) -> Result<ContextWindow> {
        let _guard = self.locks.acquire(conversation_key(conversation_id)).await;
        let previous = self.repo.active_window(conversation_id).await?;
        let window = self
            .repo
            .create_window(conversation_id, new_max_tokens)
            .await?;
        obs::emit_window_rotated(
            conversation_id.as_str(),
            previous.as_ref().map(|w| w.id.as_str()),
            window.id.as_str(),
            new_max_tokens,
        );
        Ok(window)
    }

    pub async fn window(&self, window_id: &WindowId) -> Result<ContextWindow> {
        Ok(self.repo.get_window(window_id).await?)
    }

    pub async fn active_window(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ContextWindow>> {
        Ok(self.repo.active_window(conversation_id).await?)
    }

    pub async fn windows(&self, active_only: bool) -> Result<Vec<ContextWindow>> {
        Ok(self.repo.list_windows(active_only).await?)
    }

    pub async fn counts(&self) -> Result<StoreCounts> {
        Ok(self.repo.counts().await?)
    }

    // -- items ---------------------------------------------------------------

    /// Attach an item at the window's next position, included, adding its
    /// token cost to the window.
    #[instrument(skip(self, spec), fields(window_id = %window_id, item_type = %spec.item_type))]
    pub async fn add_item(&self, window_id: &WindowId, spec: ItemSpec) -> Result<ContextItem> {
        let relevance_score = validate_relevance(spec.relevance_score)?;
        let token_count = self.counter.count(spec.text());
        let content = match spec.source {
            ItemSource::Message { .. } => None,
            ItemSource::Inline(content) => Some(content),
        };

        let _guard = self.locks.acquire(window_key(window_id)).await;
        let item = self
            .repo
            .insert_item(NewItem {
                window_id: window_id.clone(),
                source_ref: spec.source_ref,
                content,
                item_type: spec.item_type,
                priority: spec.priority,
                relevance_score,
                token_count,
            })
            .await?;

        METRICS.inc_items_added();
        obs::emit_item_added(
            window_id.as_str(),
            item.id.as_str(),
            item.item_type.as_str(),
            item.token_count,
        );
        Ok(item)
    }

    pub async fn item(&self, item_id: &ItemId) -> Result<ContextItem> {
        Ok(self.repo.get_item(item_id).await?)
    }

    /// Include or exclude an item, adjusting the window's token sum. No-op
    /// when the item is already in the requested state.
    pub async fn set_included(&self, item_id: &ItemId, included: bool) -> Result<ContextItem> {
        let window_id = self.repo.get_item(item_id).await?.window_id;
        let _guard = self.locks.acquire(window_key(&window_id)).await;
        let update = self.repo.set_item_included(item_id, included).await?;

        if update.changed {
            if !included {
                METRICS.inc_evictions();
            }
            obs::emit_inclusion_changed(
                window_id.as_str(),
                item_id.as_str(),
                included,
                update.window_tokens,
            );
        }
        Ok(update.item)
    }

    pub async fn set_priority(&self, item_id: &ItemId, priority: Priority) -> Result<ContextItem> {
        let window_id = self.repo.get_item(item_id).await?.window_id;
        let _guard = self.locks.acquire(window_key(&window_id)).await;
        Ok(self.repo.set_item_priority(item_id, priority).await?)
    }

    pub async fn set_relevance(&self, item_id: &ItemId, score: f64) -> Result<ContextItem> {
        let score = validate_relevance(score)?;
        let window_id = self.repo.get_item(item_id).await?.window_id;
        let _guard = self.locks.acquire(window_key(&window_id)).await;
        Ok(self.repo.set_item_relevance(item_id, score).await?)
    }

    /// Items of a window ordered by position ascending.
    pub async fn items_for_window(
        &self,
        window_id: &WindowId,
        included_only: bool,
    ) -> Result<Vec<ContextItem>> {
        Ok(self.repo.list_items(window_id, included_only).await?)
    }

    /// Compare the cached token sum with the included items and repair it
    /// on mismatch.
    #[instrument(skip(self), fields(window_id = %window_id))]
    pub async fn verify_window(&self, window_id: &WindowId) -> Result<ConsistencyReport> {
        let _guard = self.locks.acquire(window_key(window_id)).await;
        let window = self.repo.get_window(window_id).await?;
        let actual: u64 = self
            .repo
            .list_items(window_id, true)
            .await?
            .iter()
            .map(|i| i.token_count)
            .sum();

        if window.current_tokens == actual {
            return Ok(ConsistencyReport {
                window_id: window_id.clone(),
                cached_tokens: actual,
                actual_tokens: actual,
                repaired: false,
            });
        }

        let violation = CtxwardenError::InvariantViolation {
            cached: window.current_tokens,
            actual,
        };
        warn!(window_id = %window_id, error = %violation, "repairing window token sum");
        let repaired = self.repo.recompute_window_tokens(window_id).await?;
        obs::emit_invariant_repaired(
            window_id.as_str(),
            window.current_tokens,
            repaired.current_tokens,
        );

        Ok(ConsistencyReport {
            window_id: window_id.clone(),
            cached_tokens: window.current_tokens,
            actual_tokens: repaired.current_tokens,
            repaired: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_spec_keeps_reference_not_content() {
        let spec = ItemSpec::message("msg-1", "hello there");
        assert_eq!(spec.item_type, ItemType::Message);
        assert_eq!(spec.source_ref.as_deref(), Some("msg-1"));
        assert_eq!(spec.text(), "hello there");
        assert_eq!(spec.priority, Priority::Medium);
        assert_eq!(spec.relevance_score, 1.0);
    }

    #[test]
    fn builders_override_defaults() {
        let spec = ItemSpec::summary("recap")
            .with_priority(Priority::High)
            .with_relevance(0.4)
            .with_source_ref("m1..m9");
        assert_eq!(spec.item_type, ItemType::Summary);
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.relevance_score, 0.4);
        assert_eq!(spec.source_ref.as_deref(), Some("m1..m9"));
        assert!(matches!(spec.source, ItemSource::Inline(ref c) if c == "recap"));
    }

    #[test]
    fn relevance_bounds() {
        assert!(validate_relevance(0.0).is_ok());
        assert!(validate_relevance(1.0).is_ok());
        assert!(matches!(
            validate_relevance(1.5),
            Err(CtxwardenError::InvalidRelevance(_))
        ));
        assert!(validate_relevance(-0.1).is_err());
        assert!(validate_relevance(f64::NAN).is_err());
    }
}
