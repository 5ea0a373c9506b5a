//! In-memory implementations of the storage traits
//!
//! Provides `MemoryWindowRepository` and `MemoryCounterCache` that satisfy
//! the trait contracts without any external dependencies. The CLI also uses
//! `MemoryCounterCache` as its process-local telemetry cache.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> StorageResult<MutexGuard<'_, T>> {
    m.lock()
        .map_err(|e| StorageError::Backend(format!("lock poisoned: {e}")))
}

// ---------------------------------------------------------------------------
// MemoryWindowRepository
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WindowState {
    window: ContextWindow,
    next_position: u64,
    /// Item ids in insertion order
    items: Vec<ItemId>,
}

#[derive(Debug, Default)]
struct Tables {
    conversations: HashSet<ConversationId>,
    windows: BTreeMap<WindowId, WindowState>,
    items: HashMap<ItemId, ContextItem>,
}

impl Tables {
    fn window_mut(&mut self, window_id: &WindowId) -> StorageResult<&mut WindowState> {
        self.windows
            .get_mut(window_id)
            .ok_or_else(|| StorageError::WindowNotFound {
                window_id: window_id.0.clone(),
            })
    }

    fn item_mut(&mut self, item_id: &ItemId) -> StorageResult<&mut ContextItem> {
        self.items
            .get_mut(item_id)
            .ok_or_else(|| StorageError::ItemNotFound {
                item_id: item_id.0.clone(),
            })
    }
}

/// In-memory window repository. All tables live behind one mutex, so every
/// mutation (item change plus token accounting) is a single critical section.
#[derive(Debug, Default)]
pub struct MemoryWindowRepository {
    tables: Mutex<Tables>,
}

impl MemoryWindowRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a window's cached token sum without touching its items.
    ///
    /// Test hook for simulating a drifted cache; production code never
    /// writes `current_tokens` directly.
    pub fn corrupt_window_tokens(&self, window_id: &WindowId, tokens: u64) -> StorageResult<()> {
        let mut tables = lock(&self.tables)?;
        tables.window_mut(window_id)?.window.current_tokens = tokens;
        Ok(())
    }
}

#[async_trait]
impl WindowRepository for MemoryWindowRepository {
    async fn create_conversation(&self) -> StorageResult<ConversationId> {
        let id = ConversationId::new();
        lock(&self.tables)?.conversations.insert(id.clone());
        Ok(id)
    }

    async fn conversation_exists(&self, conversation_id: &ConversationId) -> StorageResult<bool> {
        Ok(lock(&self.tables)?.conversations.contains(conversation_id))
    }

    async fn delete_conversation(&self, conversation_id: &ConversationId) -> StorageResult<()> {
        let mut tables = lock(&self.tables)?;
        if !tables.conversations.remove(conversation_id) {
            return Err(StorageError::ConversationNotFound {
                conversation_id: conversation_id.0.clone(),
            });
        }
        let doomed: Vec<WindowId> = tables
            .windows
            .values()
            .filter(|w| &w.window.conversation_id == conversation_id)
            .map(|w| w.window.id.clone())
            .collect();
        for window_id in doomed {
            if let Some(state) = tables.windows.remove(&window_id) {
                for item_id in state.items {
                    tables.items.remove(&item_id);
                }
            }
        }
        Ok(())
    }

    async fn active_window(
        &self,
        conversation_id: &ConversationId,
    ) -> StorageResult<Option<ContextWindow>> {
        let tables = lock(&self.tables)?;
        Ok(tables
            .windows
            .values()
            .find(|w| &w.window.conversation_id == conversation_id && w.window.is_active)
            .map(|w| w.window.clone()))
    }

    async fn create_window(
        &self,
        conversation_id: &ConversationId,
        max_tokens: u64,
    ) -> StorageResult<ContextWindow> {
        let mut tables = lock(&self.tables)?;
        if !tables.conversations.contains(conversation_id) {
            return Err(StorageError::ConversationNotFound {
                conversation_id: conversation_id.0.clone(),
            });
        }
        for state in tables.windows.values_mut() {
            if &state.window.conversation_id == conversation_id {
                state.window.is_active = false;
            }
        }
        let window = ContextWindow {
            id: WindowId::new(),
            conversation_id: conversation_id.clone(),
            max_tokens,
            current_tokens: 0,
            is_active: true,
            created_at: Utc::now(),
        };
        tables.windows.insert(
            window.id.clone(),
            WindowState {
                window: window.clone(),
                next_position: 0,
                items: Vec::new(),
            },
        );
        Ok(window)
    }

    async fn get_window(&self, window_id: &WindowId) -> StorageResult<ContextWindow> {
        let tables = lock(&self.tables)?;
        tables
            .windows
            .get(window_id)
            .map(|w| w.window.clone())
            .ok_or_else(|| StorageError::WindowNotFound {
                window_id: window_id.0.clone(),
            })
    }

    async fn list_windows(&self, active_only: bool) -> StorageResult<Vec<ContextWindow>> {
        let tables = lock(&self.tables)?;
        let mut windows: Vec<ContextWindow> = tables
            .windows
            .values()
            .filter(|w| !active_only || w.window.is_active)
            .map(|w| w.window.clone())
            .collect();
        windows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(windows)
    }

    async fn insert_item(&self, item: NewItem) -> StorageResult<ContextItem> {
        let mut tables = lock(&self.tables)?;
        let state = tables.window_mut(&item.window_id)?;
        let position = state.next_position;
        state.next_position += 1;
        state.window.current_tokens += item.token_count;

        let record = ContextItem {
            id: ItemId::new(),
            window_id: item.window_id,
            source_ref: item.source_ref,
            content: item.content,
            item_type: item.item_type,
            priority: item.priority,
            relevance_score: item.relevance_score,
            position,
            token_count: item.token_count,
            is_included: true,
            created_at: Utc::now(),
        };
        state.items.push(record.id.clone());
        tables.items.insert(record.id.clone(), record.clone());
        Ok(record)
    }

    async fn set_item_included(
        &self,
        item_id: &ItemId,
        included: bool,
    ) -> StorageResult<InclusionUpdate> {
        let mut tables = lock(&self.tables)?;
        let item = tables.item_mut(item_id)?;
        let changed = item.is_included != included;
        item.is_included = included;
        let item = item.clone();

        let state = tables.window_mut(&item.window_id)?;
        if changed {
            if included {
                state.window.current_tokens += item.token_count;
            } else {
                state.window.current_tokens =
                    state.window.current_tokens.saturating_sub(item.token_count);
            }
        }
        Ok(InclusionUpdate {
            item,
            changed,
            window_tokens: state.window.current_tokens,
        })
    }

    async fn set_item_priority(
        &self,
        item_id: &ItemId,
        priority: Priority,
    ) -> StorageResult<ContextItem> {
        let mut tables = lock(&self.tables)?;
        let item = tables.item_mut(item_id)?;
        item.priority = priority;
        Ok(item.clone())
    }

    async fn set_item_relevance(
        &self,
        item_id: &ItemId,
        score: f64,
    ) -> StorageResult<ContextItem> {
        let mut tables = lock(&self.tables)?;
        let item = tables.item_mut(item_id)?;
        item.relevance_score = score;
        Ok(item.clone())
    }

    async fn get_item(&self, item_id: &ItemId) -> StorageResult<ContextItem> {
        let tables = lock(&self.tables)?;
        tables
            .items
            .get(item_id)
            .cloned()
            .ok_or_else(|| StorageError::ItemNotFound {
                item_id: item_id.0.clone(),
            })
    }

    async fn list_items(
        &self,
        window_id: &WindowId,
        included_only: bool,
    ) -> StorageResult<Vec<ContextItem>> {
        let tables = lock(&self.tables)?;
        let state = tables
            .windows
            .get(window_id)
            .ok_or_else(|| StorageError::WindowNotFound {
                window_id: window_id.0.clone(),
            })?;
        // `state.items` is already in insertion (= position) order.
        Ok(state
            .items
            .iter()
            .filter_map(|id| tables.items.get(id))
            .filter(|item| !included_only || item.is_included)
            .cloned()
            .collect())
    }

    async fn recompute_window_tokens(&self, window_id: &WindowId) -> StorageResult<ContextWindow> {
        let mut tables = lock(&self.tables)?;
        let Tables { windows, items, .. } = &mut *tables;
        let state = windows
            .get_mut(window_id)
            .ok_or_else(|| StorageError::WindowNotFound {
                window_id: window_id.0.clone(),
            })?;
        state.window.current_tokens = state
            .items
            .iter()
            .filter_map(|id| items.get(id))
            .filter(|item| item.is_included)
            .map(|item| item.token_count)
            .sum();
        Ok(state.window.clone())
    }

    async fn counts(&self) -> StorageResult<StoreCounts> {
        let tables = lock(&self.tables)?;
        Ok(StoreCounts {
            conversations: tables.conversations.len() as u64,
            windows: tables.windows.len() as u64,
            active_windows: tables.windows.values().filter(|w| w.window.is_active).count() as u64,
            items: tables.items.len() as u64,
            included_items: tables.items.values().filter(|i| i.is_included).count() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// MemoryCounterCache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum CacheValue {
    Scalar(String),
    List(VecDeque<String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory counter cache backed by a `HashMap<key, entry>` with lazy
/// expiry (expired keys are dropped when next touched).
#[derive(Debug, Default)]
pub struct MemoryCounterCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCounterCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, CacheEntry>,
        key: &str,
    ) -> Option<&'a mut CacheEntry> {
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.is_expired(now)) {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    fn wrong_type(key: &str, expected: &str) -> StorageError {
        StorageError::WrongType {
            key: key.to_string(),
            expected: expected.to_string(),
        }
    }
}

/// Resolve an inclusive `[start, stop]` range against a list length.
fn clamp_range(len: usize, start: usize, stop: usize) -> Option<(usize, usize)> {
    if len == 0 || start >= len || start > stop {
        return None;
    }
    Some((start, stop.min(len - 1)))
}

#[async_trait]
impl CounterCache for MemoryCounterCache {
    async fn incr(&self, key: &str) -> StorageResult<i64> {
        self.incr_by(key, 1).await
    }

    async fn incr_by(&self, key: &str, delta: i64) -> StorageResult<i64> {
        let mut entries = lock(&self.entries)?;
        let current = match Self::live(&mut entries, key) {
            None => 0,
            Some(CacheEntry {
                value: CacheValue::Scalar(s),
                ..
            }) => s
                .parse::<i64>()
                .map_err(|_| Self::wrong_type(key, "integer"))?,
            Some(_) => return Err(Self::wrong_type(key, "integer")),
        };
        let next = current.saturating_add(delta);
        match Self::live(&mut entries, key) {
            Some(entry) => entry.value = CacheValue::Scalar(next.to_string()),
            None => {
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: CacheValue::Scalar(next.to_string()),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(next)
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut entries = lock(&self.entries)?;
        match Self::live(&mut entries, key) {
            None => Ok(None),
            Some(CacheEntry {
                value: CacheValue::Scalar(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(Self::wrong_type(key, "scalar")),
        }
    }

    async fn set(&self, key: &str, value: &str) -> StorageResult<()> {
        let mut entries = lock(&self.entries)?;
        entries.insert(
            key.to_string(),
            CacheEntry {
                value: CacheValue::Scalar(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let mut entries = lock(&self.entries)?;
        match Self::live(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn push(&self, key: &str, value: &str) -> StorageResult<u64> {
        let mut entries = lock(&self.entries)?;
        match Self::live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::List(list),
                ..
            }) => {
                list.push_front(value.to_string());
                Ok(list.len() as u64)
            }
            Some(_) => Err(Self::wrong_type(key, "list")),
            None => {
                let mut list = VecDeque::new();
                list.push_front(value.to_string());
                entries.insert(
                    key.to_string(),
                    CacheEntry {
                        value: CacheValue::List(list),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
        }
    }

    async fn trim(&self, key: &str, start: usize, stop: usize) -> StorageResult<()> {
        let mut entries = lock(&self.entries)?;
        match Self::live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::List(list),
                ..
            }) => {
                match clamp_range(list.len(), start, stop) {
                    Some((from, to)) => {
                        list.truncate(to + 1);
                        list.drain(..from);
                    }
                    None => list.clear(),
                }
                Ok(())
            }
            Some(_) => Err(Self::wrong_type(key, "list")),
            None => Ok(()),
        }
    }

    async fn range(&self, key: &str, start: usize, stop: usize) -> StorageResult<Vec<String>> {
        let mut entries = lock(&self.entries)?;
        match Self::live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::List(list),
                ..
            }) => Ok(match clamp_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(Self::wrong_type(key, "list")),
            None => Ok(Vec::new()),
        }
    }
}
