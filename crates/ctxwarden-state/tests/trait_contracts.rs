//! Trait contract tests for WindowRepository and CounterCache.
//!
//! Each repository contract is run against both the in-memory fake and the
//! SurrealDB backend on the embedded `mem://` engine. Any conforming
//! implementation must pass these.

use std::time::Duration;

use ctxwarden_state::fakes::{MemoryCounterCache, MemoryWindowRepository};
use ctxwarden_state::storage_traits::*;
use ctxwarden_state::{StorageError, SurrealConfig, SurrealWindowRepository};

fn message(window_id: &WindowId, tokens: u64) -> NewItem {
    NewItem {
        window_id: window_id.clone(),
        source_ref: None,
        content: Some("x".repeat(tokens as usize * 4)),
        item_type: ItemType::Message,
        priority: Priority::Medium,
        relevance_score: 1.0,
        token_count: tokens,
    }
}

async fn surreal(name: &str) -> SurrealWindowRepository {
    SurrealWindowRepository::connect(&SurrealConfig::in_memory().with_database(name))
        .await
        .expect("mem:// connect")
}

// ===========================================================================
// WindowRepository contracts
// ===========================================================================

async fn contract_insert_accumulates_tokens(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 1000).await.unwrap();
    assert_eq!(window.current_tokens, 0);
    assert!(window.is_active);

    let a = repo.insert_item(message(&window.id, 10)).await.unwrap();
    let b = repo.insert_item(message(&window.id, 25)).await.unwrap();
    assert!(a.position < b.position);
    assert!(a.is_included && b.is_included);

    let window = repo.get_window(&window.id).await.unwrap();
    assert_eq!(window.current_tokens, 35);
}

async fn contract_inclusion_toggle_adjusts_sum(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 1000).await.unwrap();
    let a = repo.insert_item(message(&window.id, 10)).await.unwrap();
    repo.insert_item(message(&window.id, 5)).await.unwrap();

    let update = repo.set_item_included(&a.id, false).await.unwrap();
    assert!(update.changed);
    assert!(!update.item.is_included);
    assert_eq!(update.window_tokens, 5);

    // Second exclusion is a no-op.
    let update = repo.set_item_included(&a.id, false).await.unwrap();
    assert!(!update.changed);
    assert_eq!(update.window_tokens, 5);

    let update = repo.set_item_included(&a.id, true).await.unwrap();
    assert!(update.changed);
    assert_eq!(update.window_tokens, 15);
}

async fn contract_list_items_orders_by_position(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 1000).await.unwrap();
    let mut ids = Vec::new();
    for tokens in [3, 1, 2] {
        ids.push(repo.insert_item(message(&window.id, tokens)).await.unwrap().id);
    }
    repo.set_item_included(&ids[1], false).await.unwrap();

    let all: Vec<ItemId> = repo
        .list_items(&window.id, false)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(all, ids);

    let included: Vec<ItemId> = repo
        .list_items(&window.id, true)
        .await
        .unwrap()
        .into_iter()
        .map(|i| i.id)
        .collect();
    assert_eq!(included, vec![ids[0].clone(), ids[2].clone()]);
}

async fn contract_create_window_rotates_active(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let first = repo.create_window(&conv, 100).await.unwrap();
    repo.insert_item(message(&first.id, 7)).await.unwrap();
    let second = repo.create_window(&conv, 200).await.unwrap();

    let active = repo.active_window(&conv).await.unwrap().unwrap();
    assert_eq!(active.id, second.id);

    // The previous window survives, inactive, with its accounting intact.
    let first = repo.get_window(&first.id).await.unwrap();
    assert!(!first.is_active);
    assert_eq!(first.current_tokens, 7);

    let active_ids: Vec<WindowId> = repo
        .list_windows(true)
        .await
        .unwrap()
        .into_iter()
        .filter(|w| w.conversation_id == conv)
        .map(|w| w.id)
        .collect();
    assert_eq!(active_ids, vec![second.id]);
}

async fn contract_missing_records_are_typed(repo: &dyn WindowRepository) {
    let err = repo
        .create_window(&ConversationId::from("no-such-conversation"), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::ConversationNotFound { .. }));

    let err = repo.get_window(&WindowId::from("nope")).await.unwrap_err();
    assert!(matches!(err, StorageError::WindowNotFound { .. }));

    let err = repo
        .insert_item(message(&WindowId::from("nope"), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::WindowNotFound { .. }));

    let err = repo.get_item(&ItemId::from("nope")).await.unwrap_err();
    assert!(matches!(err, StorageError::ItemNotFound { .. }));
    assert!(err.is_not_found());
}

async fn contract_attribute_updates_persist(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 100).await.unwrap();
    let item = repo.insert_item(message(&window.id, 4)).await.unwrap();

    repo.set_item_priority(&item.id, Priority::Critical)
        .await
        .unwrap();
    repo.set_item_relevance(&item.id, 0.125).await.unwrap();

    let item = repo.get_item(&item.id).await.unwrap();
    assert_eq!(item.priority, Priority::Critical);
    assert!((item.relevance_score - 0.125).abs() < f64::EPSILON);
    // Attribute updates never touch accounting.
    assert_eq!(repo.get_window(&window.id).await.unwrap().current_tokens, 4);
}

async fn contract_delete_conversation_cascades(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 100).await.unwrap();
    let item = repo.insert_item(message(&window.id, 4)).await.unwrap();

    repo.delete_conversation(&conv).await.unwrap();
    assert!(!repo.conversation_exists(&conv).await.unwrap());
    assert!(repo.get_window(&window.id).await.unwrap_err().is_not_found());
    assert!(repo.get_item(&item.id).await.unwrap_err().is_not_found());

    let err = repo.delete_conversation(&conv).await.unwrap_err();
    assert!(matches!(err, StorageError::ConversationNotFound { .. }));
}

async fn contract_counts(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let old = repo.create_window(&conv, 100).await.unwrap();
    let new = repo.create_window(&conv, 100).await.unwrap();
    repo.insert_item(message(&old.id, 1)).await.unwrap();
    let b = repo.insert_item(message(&new.id, 1)).await.unwrap();
    repo.insert_item(message(&new.id, 1)).await.unwrap();
    repo.set_item_included(&b.id, false).await.unwrap();

    let counts = repo.counts().await.unwrap();
    assert_eq!(
        counts,
        StoreCounts {
            conversations: 1,
            windows: 2,
            active_windows: 1,
            items: 3,
            included_items: 2,
        }
    );
}

async fn contract_recompute_matches_included_sum(repo: &dyn WindowRepository) {
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 100).await.unwrap();
    let a = repo.insert_item(message(&window.id, 6)).await.unwrap();
    repo.insert_item(message(&window.id, 9)).await.unwrap();
    repo.set_item_included(&a.id, false).await.unwrap();

    let window = repo.recompute_window_tokens(&window.id).await.unwrap();
    assert_eq!(window.current_tokens, 9);
}

macro_rules! repository_contracts {
    ($($name:ident),* $(,)?) => {
        mod memory {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let repo = MemoryWindowRepository::new();
                    super::$name(&repo).await;
                }
            )*
        }

        mod surreal_mem {
            use super::*;
            $(
                #[tokio::test]
                async fn $name() {
                    let repo = surreal(stringify!($name)).await;
                    super::$name(&repo).await;
                }
            )*
        }
    };
}

repository_contracts!(
    contract_insert_accumulates_tokens,
    contract_inclusion_toggle_adjusts_sum,
    contract_list_items_orders_by_position,
    contract_create_window_rotates_active,
    contract_missing_records_are_typed,
    contract_attribute_updates_persist,
    contract_delete_conversation_cascades,
    contract_counts,
    contract_recompute_matches_included_sum,
);

#[tokio::test]
async fn memory_recompute_repairs_corrupted_cache() {
    let repo = MemoryWindowRepository::new();
    let conv = repo.create_conversation().await.unwrap();
    let window = repo.create_window(&conv, 100).await.unwrap();
    repo.insert_item(message(&window.id, 12)).await.unwrap();

    repo.corrupt_window_tokens(&window.id, 999).unwrap();
    assert_eq!(repo.get_window(&window.id).await.unwrap().current_tokens, 999);

    let repaired = repo.recompute_window_tokens(&window.id).await.unwrap();
    assert_eq!(repaired.current_tokens, 12);
}

// ===========================================================================
// CounterCache contract tests
// ===========================================================================

#[tokio::test]
async fn cache_incr_starts_from_zero() {
    let cache = MemoryCounterCache::new();
    assert_eq!(cache.incr("runs").await.unwrap(), 1);
    assert_eq!(cache.incr("runs").await.unwrap(), 2);
    assert_eq!(cache.incr_by("tokens", 40).await.unwrap(), 40);
    assert_eq!(cache.incr_by("tokens", 2).await.unwrap(), 42);
    assert_eq!(cache.get("tokens").await.unwrap().as_deref(), Some("42"));
    assert_eq!(cache.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn cache_push_prepends_and_trim_bounds() {
    let cache = MemoryCounterCache::new();
    for n in 0..5 {
        cache.push("recent", &n.to_string()).await.unwrap();
    }
    cache.trim("recent", 0, 2).await.unwrap();

    let items = cache.range("recent", 0, 10).await.unwrap();
    assert_eq!(items, vec!["4", "3", "2"]);
    assert_eq!(cache.range("recent", 1, 1).await.unwrap(), vec!["3"]);
    assert!(cache.range("recent", 5, 9).await.unwrap().is_empty());
}

#[tokio::test]
async fn cache_wrong_type_is_reported() {
    let cache = MemoryCounterCache::new();
    cache.push("list", "a").await.unwrap();
    let err = cache.incr("list").await.unwrap_err();
    assert!(matches!(err, StorageError::WrongType { .. }));

    cache.set("scalar", "not-a-number").await.unwrap();
    assert!(cache.incr("scalar").await.is_err());
    assert!(cache.push("scalar", "x").await.is_err());
}

#[tokio::test]
async fn cache_expired_keys_behave_as_absent() {
    let cache = MemoryCounterCache::new();
    cache.incr("short").await.unwrap();
    assert!(cache.expire("short", Duration::from_millis(20)).await.unwrap());
    assert!(!cache.expire("absent", Duration::from_secs(1)).await.unwrap());

    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(cache.get("short").await.unwrap(), None);
    assert_eq!(cache.incr("short").await.unwrap(), 1);
}
