//! PruningEngine: eviction strategies over a window and its included items.
//!
//! Every strategy follows the same contract:
//! - a no-op returning `true` when `window.current_tokens <= budget`
//! - evictions go through [`ContextStore::set_included`] only
//! - the eviction plan is computed from an immutable snapshot of the items,
//!   then applied in order
//! - `false` is returned only when a storage call fails; evictions applied
//!   before the failure stay in place
//!
//! Recency (`position`) is the final tie-breaker of every ordering and
//! always favours keeping newer items.

mod hybrid;
mod priority;
mod registry;
mod relevance;
mod service;
mod time;

use async_trait::async_trait;
use ctxwarden_state::{ContextItem, ContextWindow};

pub use crate::config::PreserveSet;
pub use hybrid::{HybridStrategy, AGGRESSIVE_FALLBACK};
pub use priority::PriorityStrategy;
pub use registry::{StrategyKind, StrategyRegistry};
pub use relevance::RelevanceStrategy;
pub use service::{PruneReport, PruningService};
pub use time::TimeStrategy;

use crate::error::CtxwardenError;
use crate::monitor::WindowMonitor;
use crate::obs;
use crate::store::ContextStore;

/// One eviction strategy.
#[async_trait]
pub trait PruningStrategy: Send + Sync {
    /// Label used in telemetry.
    fn name(&self) -> &'static str;

    /// Evict items until `window.current_tokens <= budget` or nothing
    /// evictable remains. When `monitor` is given, one pruning event is
    /// recorded for a run that had work to do.
    async fn prune(
        &self,
        store: &ContextStore,
        monitor: Option<&WindowMonitor>,
        window: &ContextWindow,
        items: &[ContextItem],
        budget: u64,
    ) -> bool;
}

/// Tokens that must be removed to meet `budget`, or `None` when the window
/// already fits.
pub(crate) fn excess_tokens(window: &ContextWindow, budget: u64) -> Option<u64> {
    window
        .current_tokens
        .checked_sub(budget)
        .filter(|excess| *excess > 0)
}

/// Walk `order`, stopping once the evicted total reaches `target`. The item
/// that crosses the target is evicted too.
pub(crate) fn take_until_covered<'a>(
    order: impl IntoIterator<Item = &'a ContextItem>,
    target: u64,
) -> Vec<&'a ContextItem> {
    let mut planned = Vec::new();
    let mut covered = 0u64;
    for item in order {
        if covered >= target {
            break;
        }
        covered += item.token_count;
        planned.push(item);
    }
    planned
}

/// Result of applying an eviction plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Applied {
    pub items: u64,
    pub tokens: u64,
    pub ok: bool,
}

/// Exclude every planned item, stopping at the first storage failure.
pub(crate) async fn apply_evictions(
    store: &ContextStore,
    strategy: &str,
    window: &ContextWindow,
    plan: &[&ContextItem],
) -> Applied {
    let mut applied = Applied {
        ok: true,
        ..Applied::default()
    };
    for item in plan {
        match store.set_included(&item.id, false).await {
            Ok(_) => {
                applied.items += 1;
                applied.tokens += item.token_count;
            }
            Err(e) => {
                let failure = CtxwardenError::StrategyFailure {
                    strategy: strategy.to_string(),
                    reason: e.to_string(),
                };
                obs::emit_prune_failed(window.id.as_str(), strategy, &failure);
                applied.ok = false;
                break;
            }
        }
    }
    applied
}

/// Log a finished run and hand it to the monitor when one is attached.
pub(crate) async fn report(
    monitor: Option<&WindowMonitor>,
    window: &ContextWindow,
    strategy: &str,
    tokens_before: u64,
    tokens_after: u64,
    items_removed: u64,
) {
    obs::emit_prune_completed(
        window.id.as_str(),
        strategy,
        tokens_before,
        tokens_after,
        items_removed,
    );
    if let Some(monitor) = monitor {
        monitor
            .record_pruning_event(
                &window.id,
                strategy,
                tokens_before,
                tokens_after,
                items_removed,
            )
            .await;
    }
}

/// Included items only, in position order.
pub(crate) fn included(items: &[ContextItem]) -> Vec<&ContextItem> {
    let mut included: Vec<&ContextItem> = items.iter().filter(|i| i.is_included).collect();
    included.sort_by_key(|i| i.position);
    included
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use ctxwarden_state::{ContextItem, ItemId, ItemType, Priority, WindowId};

    pub fn item(position: u64, tokens: u64, item_type: ItemType, priority: Priority) -> ContextItem {
        ContextItem {
            id: ItemId(format!("i{position}")),
            window_id: WindowId::from("w"),
            source_ref: None,
            content: None,
            item_type,
            priority,
            relevance_score: 1.0,
            position,
            token_count: tokens,
            is_included: true,
            created_at: Utc::now(),
        }
    }

    pub fn ids(items: &[&ContextItem]) -> Vec<String> {
        items.iter().map(|i| i.id.0.clone()).collect()
    }
}
