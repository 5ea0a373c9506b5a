//! ContextStore accounting and lifecycle tests.

mod common;

use std::sync::Arc;

use common::{assert_accounting, spec, text, Fixture};
use ctxwarden_core::{
    ContextStore, ConversationId, CtxwardenError, ItemSpec, ItemType, Priority, WindowId,
};
use ctxwarden_state::fakes::MemoryWindowRepository;
use ctxwarden_state::ItemId;

#[tokio::test]
async fn add_and_toggle_keep_token_sum_exact() {
    let fx = Fixture::new(1000).await;

    let a = fx.add(spec(10, Priority::Medium)).await;
    assert_accounting(&fx.store, &fx.window.id).await;
    let b = fx.add(spec(25, Priority::Low)).await;
    let c = fx.add(ItemSpec::message("msg-3", text(7))).await;
    assert_accounting(&fx.store, &fx.window.id).await;
    assert_eq!(fx.store.window(&fx.window.id).await.unwrap().current_tokens, 42);

    fx.store.set_included(&b.id, false).await.unwrap();
    assert_accounting(&fx.store, &fx.window.id).await;
    // repeated exclusion is a no-op
    fx.store.set_included(&b.id, false).await.unwrap();
    assert_eq!(fx.store.window(&fx.window.id).await.unwrap().current_tokens, 17);

    fx.store.set_included(&b.id, true).await.unwrap();
    fx.store.set_included(&a.id, false).await.unwrap();
    fx.store.set_included(&c.id, false).await.unwrap();
    assert_accounting(&fx.store, &fx.window.id).await;
    assert_eq!(fx.store.window(&fx.window.id).await.unwrap().current_tokens, 25);
}

#[tokio::test]
async fn positions_strictly_increase() {
    let fx = Fixture::new(1000).await;
    let mut last = None;
    for _ in 0..5 {
        let item = fx.add(spec(1, Priority::Medium)).await;
        if let Some(prev) = last {
            assert!(item.position > prev);
        }
        last = Some(item.position);
    }

    let all = fx.store.items_for_window(&fx.window.id, false).await.unwrap();
    assert!(all.windows(2).all(|w| w[0].position < w[1].position));
}

#[tokio::test]
async fn message_backed_items_carry_reference_only() {
    let fx = Fixture::new(1000).await;
    let item = fx.add(ItemSpec::message("msg-1", text(5))).await;
    assert_eq!(item.source_ref.as_deref(), Some("msg-1"));
    assert_eq!(item.content, None);
    assert_eq!(item.token_count, 5);
    assert!(item.is_included);
    assert_eq!(item.priority, Priority::Medium);
    assert_eq!(item.relevance_score, 1.0);

    let inline = fx.add(ItemSpec::system("be terse")).await;
    assert_eq!(inline.content.as_deref(), Some("be terse"));
    assert_eq!(inline.item_type, ItemType::System);
}

#[tokio::test]
async fn zero_cost_items_are_allowed() {
    let fx = Fixture::new(1000).await;
    let item = fx.add(ItemSpec::metadata("")).await;
    assert_eq!(item.token_count, 0);
    fx.store.set_included(&item.id, false).await.unwrap();
    assert_accounting(&fx.store, &fx.window.id).await;
}

#[tokio::test]
async fn attribute_updates_do_not_touch_accounting() {
    let fx = Fixture::new(1000).await;
    let item = fx.add(spec(12, Priority::Medium)).await;

    let updated = fx.store.set_priority(&item.id, Priority::Critical).await.unwrap();
    assert_eq!(updated.priority, Priority::Critical);
    let updated = fx.store.set_relevance(&item.id, 0.25).await.unwrap();
    assert_eq!(updated.relevance_score, 0.25);
    assert_eq!(fx.store.window(&fx.window.id).await.unwrap().current_tokens, 12);

    assert!(matches!(
        fx.store.set_relevance(&item.id, 1.5).await,
        Err(CtxwardenError::InvalidRelevance(_))
    ));
    assert!(matches!(
        fx.store.add_item(&fx.window.id, spec(1, Priority::Low).with_relevance(f64::NAN)).await,
        Err(CtxwardenError::InvalidRelevance(_))
    ));
}

#[tokio::test]
async fn lookups_surface_typed_absence() {
    let fx = Fixture::new(1000).await;

    let err = fx
        .store
        .add_item(&WindowId::from("missing"), spec(1, Priority::Low))
        .await
        .unwrap_err();
    assert!(matches!(err, CtxwardenError::WindowNotFound(_)));

    let err = fx
        .store
        .set_included(&ItemId::from("missing"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, CtxwardenError::ItemNotFound(_)));

    let err = fx
        .store
        .get_or_create_active_window(&ConversationId::from("missing"), 100)
        .await
        .unwrap_err();
    assert!(matches!(err, CtxwardenError::ConversationNotFound(_)));
    assert!(err.is_not_found());
}

#[tokio::test]
async fn one_active_window_per_conversation() {
    let fx = Fixture::new(100).await;

    let again = fx
        .store
        .get_or_create_active_window(&fx.conversation, 500)
        .await
        .unwrap();
    assert_eq!(again.id, fx.window.id);
    assert_eq!(again.max_tokens, 100);

    fx.add(spec(10, Priority::Medium)).await;
    let rotated = fx.store.rotate_window(&fx.conversation, 200).await.unwrap();
    assert_ne!(rotated.id, fx.window.id);
    assert!(rotated.is_active);
    assert_eq!(rotated.current_tokens, 0);

    // the old window keeps its items for audit
    let old = fx.store.window(&fx.window.id).await.unwrap();
    assert!(!old.is_active);
    assert_eq!(old.current_tokens, 10);

    let active = fx.store.windows(true).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, rotated.id);
}

#[tokio::test]
async fn deleting_a_conversation_removes_everything() {
    let fx = Fixture::new(100).await;
    let item = fx.add(spec(10, Priority::Medium)).await;
    fx.store.rotate_window(&fx.conversation, 100).await.unwrap();

    fx.store.delete_conversation(&fx.conversation).await.unwrap();

    assert!(fx.store.window(&fx.window.id).await.unwrap_err().is_not_found());
    assert!(fx.store.item(&item.id).await.unwrap_err().is_not_found());
    let counts = fx.store.counts().await.unwrap();
    assert_eq!(counts.conversations, 0);
    assert_eq!(counts.windows, 0);
    assert_eq!(counts.items, 0);
}

#[tokio::test]
async fn verify_repairs_drifted_sum() {
    let repo = Arc::new(MemoryWindowRepository::new());
    let store = ContextStore::new(repo.clone());
    let conversation = store.create_conversation().await.unwrap();
    let window = store.get_or_create_active_window(&conversation, 100).await.unwrap();
    store.add_item(&window.id, spec(30, Priority::Medium)).await.unwrap();

    let clean = store.verify_window(&window.id).await.unwrap();
    assert!(!clean.repaired);
    assert_eq!(clean.actual_tokens, 30);

    repo.corrupt_window_tokens(&window.id, 99).unwrap();
    let report = store.verify_window(&window.id).await.unwrap();
    assert!(report.repaired);
    assert_eq!(report.cached_tokens, 99);
    assert_eq!(report.actual_tokens, 30);
    assert_eq!(store.window(&window.id).await.unwrap().current_tokens, 30);
}

#[tokio::test]
async fn concurrent_appends_to_one_window_serialize() {
    let fx = Fixture::new(10_000).await;
    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let store = fx.store.clone();
            let window_id = fx.window.id.clone();
            tokio::spawn(async move {
                store
                    .add_item(&window_id, spec(1 + (i % 5), Priority::Medium))
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut positions = Vec::new();
    for task in tasks {
        positions.push(task.await.unwrap().position);
    }
    positions.sort_unstable();
    positions.dedup();
    assert_eq!(positions.len(), 32);
    assert_accounting(&fx.store, &fx.window.id).await;
}
