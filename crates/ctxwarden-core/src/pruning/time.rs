//! Recency-based eviction.

use std::collections::HashSet;

use async_trait::async_trait;
use ctxwarden_state::{ContextItem, ContextWindow, ItemId};

use super::{apply_evictions, excess_tokens, included, report, PruningStrategy};
use crate::config::{PreserveSet, StrategyConfig};
use crate::monitor::WindowMonitor;
use crate::store::ContextStore;

/// Keeps preserved-type items and the `preserve_count` most recent other
/// items, then back-fills the remaining budget with the most recent
/// candidates that still fit.
///
/// When the kept set alone exceeds the budget, every candidate is evicted
/// and the kept set is trimmed oldest first (preserved types excepted).
#[derive(Debug, Clone)]
pub struct TimeStrategy {
    preserve: PreserveSet,
    preserve_count: usize,
}

impl TimeStrategy {
    pub const NAME: &'static str = "TimeBasedPruning";

    pub fn new(preserve: PreserveSet, preserve_count: usize) -> Self {
        Self {
            preserve,
            preserve_count,
        }
    }

    pub fn preserve_count(&self) -> usize {
        self.preserve_count
    }

    /// Items to evict, in application order. `items` must be in position
    /// order.
    pub(crate) fn plan<'a>(&self, items: &[&'a ContextItem], budget: u64) -> Vec<&'a ContextItem> {
        let (preserved, prunable): (Vec<&ContextItem>, Vec<&ContextItem>) = items
            .iter()
            .copied()
            .partition(|i| self.preserve.preserves_type(i.item_type));

        let split = prunable.len().saturating_sub(self.preserve_count);
        let (candidates, kept) = prunable.split_at(split);

        let kept_tokens: u64 = preserved
            .iter()
            .chain(kept.iter())
            .map(|i| i.token_count)
            .sum();

        if kept_tokens > budget {
            let mut plan: Vec<&ContextItem> = candidates.to_vec();
            let mut merged: Vec<&ContextItem> =
                preserved.iter().chain(kept.iter()).copied().collect();
            merged.sort_by_key(|i| i.position);

            let mut remaining = kept_tokens;
            for item in merged {
                if remaining <= budget {
                    break;
                }
                if self.preserve.preserves_type(item.item_type) {
                    continue;
                }
                remaining -= item.token_count;
                plan.push(item);
            }
            return plan;
        }

        let mut leftover = budget - kept_tokens;
        let mut selected: HashSet<&ItemId> = HashSet::new();
        for item in candidates.iter().rev() {
            if item.token_count <= leftover {
                leftover -= item.token_count;
                selected.insert(&item.id);
            }
        }
        candidates
            .iter()
            .copied()
            .filter(|i| !selected.contains(&i.id))
            .collect()
    }
}

impl Default for TimeStrategy {
    fn default() -> Self {
        let config = StrategyConfig::default();
        Self::new(config.time_preserve, config.preserve_count)
    }
}

#[async_trait]
impl PruningStrategy for TimeStrategy {
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

        let plan = self.plan(&included(items), budget);
        let applied = apply_evictions(store, Self::NAME, window, &plan).await;

        report(
            monitor,
            window,
            Self::NAME,
            window.current_tokens,
            window.current_tokens.saturating_sub(applied.tokens),
            applied.items,
        )
        .await;
        applied.ok
    }
}
