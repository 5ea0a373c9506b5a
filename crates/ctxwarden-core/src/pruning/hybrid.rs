//! Hybrid composition with an aggressive fallback.

use std::sync::Arc;

use async_trait::async_trait;
use ctxwarden_state::{ContextItem, ContextWindow, ItemType};
use tracing::{debug, warn};

use super::{apply_evictions, excess_tokens, included, report, take_until_covered, PruningStrategy};
use crate::error::CtxwardenError;
use crate::monitor::WindowMonitor;
use crate::obs;
use crate::store::ContextStore;

/// Label of the last-resort pass in hybrid event labels.
pub const AGGRESSIVE_FALLBACK: &str = "AggressiveFallback";

/// Runs inner strategies in order against the then-current included set,
/// stopping as soon as the window fits. If it still does not fit, every
/// non-`System` item is evicted oldest first until it does.
///
/// Inner strategies run without a monitor; the hybrid records a single
/// event labelled `Hybrid(<used>+...)`.
#[derive(Clone)]
pub struct HybridStrategy {
    strategies: Vec<Arc<dyn PruningStrategy>>,
}

impl std::fmt::Debug for HybridStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridStrategy")
            .field(
                "strategies",
                &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

struct Snapshot {
    window: ContextWindow,
    items: Vec<ContextItem>,
}

impl HybridStrategy {
    pub const NAME: &'static str = "HybridPruning";

    pub fn new(strategies: Vec<Arc<dyn PruningStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    pub fn label(used: &[&str]) -> String {
        format!("Hybrid({})", used.join("+"))
    }

    async fn refresh(store: &ContextStore, window: &ContextWindow) -> Option<Snapshot> {
        let fetched = async {
            let window = store.window(&window.id).await?;
            let items = store.items_for_window(&window.id, true).await?;
            Ok::<_, CtxwardenError>(Snapshot { window, items })
        }
        .await;
        match fetched {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                let failure = CtxwardenError::StrategyFailure {
                    strategy: Self::NAME.to_string(),
                    reason: e.to_string(),
                };
                obs::emit_prune_failed(window.id.as_str(), Self::NAME, &failure);
                None
            }
        }
    }

    /// Evict every non-`System` item oldest first until the window fits.
    async fn aggressive_fallback(store: &ContextStore, snapshot: &Snapshot, budget: u64) -> bool {
        let Some(excess) = excess_tokens(&snapshot.window, budget) else {
            return true;
        };
        let order = included(&snapshot.items)
            .into_iter()
            .filter(|i| i.item_type != ItemType::System);
        let plan = take_until_covered(order, excess);
        apply_evictions(store, AGGRESSIVE_FALLBACK, &snapshot.window, &plan)
            .await
            .ok
    }
}

#[async_trait]
impl PruningStrategy for HybridStrategy {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn prune(
        &self,
        store: &ContextStore,
        monitor: Option<&WindowMonitor>,
        window: &ContextWindow,
        items: &[ContextItem],
        budget: u64,
    ) -> bool {
        if excess_tokens(window, budget).is_none() {
            return true;
        }

        let tokens_before = window.current_tokens;
        let included_before = included(items).len() as u64;
        let mut ok = true;
        let mut fresh = true;
        let mut used: Vec<&str> = Vec::new();
        let mut current = Snapshot {
            window: window.clone(),
            items: items.to_vec(),
        };

        for strategy in &self.strategies {
            if excess_tokens(&current.window, budget).is_none() {
                break;
            }
            used.push(strategy.name());
            if !strategy
                .prune(store, None, &current.window, &current.items, budget)
                .await
            {
                warn!(
                    window_id = %window.id,
                    strategy = strategy.name(),
                    "inner strategy failed, continuing"
                );
                ok = false;
            }
            match Self::refresh(store, window).await {
                Some(snapshot) => current = snapshot,
                None => {
                    ok = false;
                    fresh = false;
                    break;
                }
            }
        }

        // The fallback plans from the current snapshot, so it needs one.
        if fresh && excess_tokens(&current.window, budget).is_some() {
            debug!(window_id = %window.id, "inner strategies exhausted, using fallback");
            used.push(AGGRESSIVE_FALLBACK);
            if !Self::aggressive_fallback(store, &current, budget).await {
                ok = false;
            }
            match Self::refresh(store, window).await {
                Some(snapshot) => current = snapshot,
                None => ok = false,
            }
        }

        let included_after = included(&current.items).len() as u64;
        report(
            monitor,
            window,
            &Self::label(&used),
            tokens_before,
            current.window.current_tokens,
            included_before.saturating_sub(included_after),
        )
        .await;
        ok
    }
}
