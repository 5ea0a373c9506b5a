//! Shared fixtures for the ctxwarden-core integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ctxwarden_core::{
    ContextItem, ContextStore, ContextWindow, ConversationId, ItemSpec, ItemType, MonitorConfig,
    Priority, WindowId, WindowMonitor,
};
use ctxwarden_state::fakes::{MemoryCounterCache, MemoryWindowRepository};
use ctxwarden_state::{
    CounterCache, InclusionUpdate, ItemId, NewItem, StorageError, StorageResult, StoreCounts,
    WindowRepository,
};

/// Inline content costing exactly `tokens` under the default 4 chars/token.
pub fn text(tokens: u64) -> String {
    "x".repeat((tokens * 4) as usize)
}

pub fn spec(tokens: u64, priority: Priority) -> ItemSpec {
    ItemSpec::inline(ItemType::Message, text(tokens)).with_priority(priority)
}

pub struct Fixture {
    pub repo: Arc<MemoryWindowRepository>,
    pub cache: Arc<MemoryCounterCache>,
    pub store: ContextStore,
    pub monitor: WindowMonitor,
    pub conversation: ConversationId,
    pub window: ContextWindow,
}

impl Fixture {
    pub async fn new(max_tokens: u64) -> Self {
        let repo = Arc::new(MemoryWindowRepository::new());
        let cache = Arc::new(MemoryCounterCache::new());
        let store = ContextStore::new(repo.clone());
        let monitor = WindowMonitor::new(store.clone(), cache.clone(), MonitorConfig::default());
        let conversation = store.create_conversation().await.unwrap();
        let window = store
            .get_or_create_active_window(&conversation, max_tokens)
            .await
            .unwrap();
        Self {
            repo,
            cache,
            store,
            monitor,
            conversation,
            window,
        }
    }

    pub async fn add(&self, spec: ItemSpec) -> ContextItem {
        self.store.add_item(&self.window.id, spec).await.unwrap()
    }

    /// Fresh window plus its included items, as a strategy expects them.
    pub async fn snapshot(&self) -> (ContextWindow, Vec<ContextItem>) {
        snapshot(&self.store, &self.window.id).await
    }

    pub async fn included_ids(&self) -> Vec<ItemId> {
        self.snapshot().await.1.into_iter().map(|i| i.id).collect()
    }
}

pub async fn snapshot(store: &ContextStore, window_id: &WindowId) -> (ContextWindow, Vec<ContextItem>) {
    let window = store.window(window_id).await.unwrap();
    let items = store.items_for_window(window_id, true).await.unwrap();
    (window, items)
}

pub async fn assert_accounting(store: &ContextStore, window_id: &WindowId) {
    let (window, items) = snapshot(store, window_id).await;
    let sum: u64 = items.iter().map(|i| i.token_count).sum();
    assert_eq!(window.current_tokens, sum, "cached token sum drifted");
}

// ---------------------------------------------------------------------------
// Failure-injecting collaborators
// ---------------------------------------------------------------------------

/// Repository whose evictions start failing after `allowed` successes.
pub struct FlakyRepository {
    inner: MemoryWindowRepository,
    allowed: AtomicUsize,
}

impl FlakyRepository {
    pub fn new(allowed: usize) -> Self {
        Self {
            inner: MemoryWindowRepository::new(),
            allowed: AtomicUsize::new(allowed),
        }
    }
}

#[async_trait]
impl WindowRepository for FlakyRepository {
    async fn create_conversation(&self) -> StorageResult<ConversationId> {
        self.inner.create_conversation().await
    }

    async fn conversation_exists(&self, conversation_id: &ConversationId) -> StorageResult<bool> {
        self.inner.conversation_exists(conversation_id).await
    }

    async fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        self.inner.delete_conversation(conversation_id).await
    }

    async fn active_window(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ContextWindow>> {
        self.inner.active_window(conversation_id).await
    }

    async fn create_window(
        &self,
        conversation_id: &ConversationId,
        max_tokens: u64,
    ) -> StorageResult<ContextWindow> {
        self.inner.create_window(conversation_id, max_tokens).await
    }

    async fn get_window(&self, window_id: &WindowId) -> StorageResult<ContextWindow> {
        self.inner.get_window(window_id).await
    }

    async fn list_windows(&self, active_only: bool) -> StorageResult<Vec<ContextWindow>> {
        self.inner.list_windows(active_only).await
    }

    async fn insert_item(&self, item: NewItem) -> StorageResult<ContextItem> {
        self.inner.insert_item(item).await
    }

    async fn set_item_included(
        &self,
        item_id: &ItemId,
        included: bool,
    ) -> StorageResult<InclusionUpdate> {
        let remaining = self.allowed.load(Ordering::SeqCst);
        if remaining == 0 {
            return Err(StorageError::Backend("injected write failure".to_string()));
        }
        self.allowed.store(remaining - 1, Ordering::SeqCst);
        self.inner.set_item_included(item_id, included).await
    }

    async fn set_item_priority(
        &self,
        item_id: &ItemId,
        priority: Priority,
    ) -> StorageResult<ContextItem> {
        self.inner.set_item_priority(item_id, priority).await
    }

    async fn set_item_relevance(
        &self,
        item_id: &ItemId,
        score: f64,
    ) -> StorageResult<ContextItem> {
        self.inner.set_item_relevance(item_id, score).await
    }

    async fn get_item(&self, item_id: &ItemId) -> StorageResult<ContextItem> {
        self.inner.get_item(item_id).await
    }

    async fn list_items(
        &self,
        window_id: &WindowId,
        included_only: bool,
    ) -> StorageResult<Vec<ContextItem>> {
        self.inner.list_items(window_id, included_only).await
    }

    async fn recompute_window_tokens(&self, window_id: &WindowId) -> StorageResult<ContextWindow> {
        self.inner.recompute_window_tokens(window_id).await
    }

    async fn counts(&self) -> StorageResult<StoreCounts> {
        self.inner.counts().await
    }
}

/// Counter cache that is always down.
pub struct UnavailableCache;

fn down<T>() -> StorageResult<T> {
    Err(StorageError::Backend("cache unavailable".to_string()))
}

#[async_trait]
impl CounterCache for UnavailableCache {
    async fn incr(&self, _key: &str) -> StorageResult<i64> {
        down()
    }

    async fn incr_by(&self, _key: &str, _delta: i64) -> StorageResult<i64> {
        down()
    }

    async fn get(&self, _key: &str) -> StorageResult<Option<String>> {
        down()
    }

    async fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
        down()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> StorageResult<bool> {
        down()
    }

    async fn push(&self, _key: &str, _value: &str) -> StorageResult<u64> {
        down()
    }

    async fn trim(&self, _key: &str, _start: usize, _stop: usize) -> StorageResult<()> {
        down()
    }

    async fn range(&self, _key: &str, _start: usize, _stop: usize) -> StorageResult<Vec<String>> {
        down()
    }
}

/// In-memory cache that yields to the scheduler before every call, so
/// concurrent recorders interleave between cache operations.
pub struct YieldingCache {
    pub inner: Arc<MemoryCounterCache>,
}

#[async_trait]
impl CounterCache for YieldingCache {
    async fn incr(&self, key: &str) -> StorageResult<i64> {
        tokio::task::yield_now().await;
        self.inner.incr(key).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StorageResult<i64> {
        tokio::task::yield_now().await;
        self.inner.incr_by(key, delta).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        tokio::task::yield_now().await;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        tokio::task::yield_now().await;
        self.inner.set(key, value).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        tokio::task::yield_now().await;
        self.inner.expire(key, ttl).await
    }

    async fn push(&self, key: &str, value: &str) -> StorageResult<u64> {
        tokio::task::yield_now().await;
        self.inner.push(key, value).await
    }

    async fn trim(&self, key: &str, start: usize, stop: usize) -> StorageResult<()> {
        tokio::task::yield_now().await;
        self.inner.trim(key, start, stop).await
    }

    async fn range(&self, key: &str, start: usize, stop: usize) -> StorageResult<Vec<String>> {
        tokio::task::yield_now().await;
        self.inner.range(key, start, stop).await
    }
}
