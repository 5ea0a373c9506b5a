//! Relevance-based eviction.

use async_trait::async_trait;
use ctxwarden_state::{ContextItem, ContextWindow};

use super::{apply_evictions, excess_tokens, included, report, take_until_covered, PruningStrategy};
use crate::config::{PreserveSet, StrategyConfig};
use crate::monitor::WindowMonitor;
use crate::store::ContextStore;

/// Evicts the least relevant items first: scores below `min_relevance`
/// before the rest, ascending score, oldest first on ties. Preserved item
/// types are never evicted.
#[derive(Debug, Clone)]
pub struct RelevanceStrategy {
    preserve: PreserveSet,
    min_relevance: f64,
}

impl RelevanceStrategy {
    pub const NAME: &'static str = "RelevanceBasedPruning";

    pub fn new(preserve: PreserveSet, min_relevance: f64) -> Self {
        Self {
            preserve,
            min_relevance,
        }
    }

    pub fn min_relevance(&self) -> f64 {
        self.min_relevance
    }

    pub(crate) fn eviction_order<'a>(&self, items: &[&'a ContextItem]) -> Vec<&'a ContextItem> {
        let mut order: Vec<&ContextItem> = items
            .iter()
            .copied()
            .filter(|i| !self.preserve.preserves_type(i.item_type))
            .collect();
        order.sort_by(|a, b| {
            let a_below = a.relevance_score < self.min_relevance;
            let b_below = b.relevance_score < self.min_relevance;
            b_below
                .cmp(&a_below)
                .then_with(|| a.relevance_score.total_cmp(&b.relevance_score))
                .then_with(|| a.position.cmp(&b.position))
        });
        order
    }
}

impl Default for RelevanceStrategy {
    fn default() -> Self {
        let config = StrategyConfig::default();
        Self::new(config.relevance_preserve, config.min_relevance)
    }
}

#[async_trait]
impl PruningStrategy for RelevanceStrategy {
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
        let Some(excess) = excess_tokens(window, budget) else {
            return true;
        };

        let order = self.eviction_order(&included(items));
        let plan = take_until_covered(order, excess);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pruning::test_support::{ids, item};
    use ctxwarden_state::{ItemType, Priority};

    fn scored(position: u64, score: f64, item_type: ItemType) -> ContextItem {
        let mut i = item(position, 10, item_type, Priority::Medium);
        i.relevance_score = score;
        i
    }

    #[test]
    fn below_threshold_first_then_ascending_score() {
        let items = [
            scored(0, 1.0, ItemType::Message),
            scored(1, 0.9, ItemType::Message),
            scored(2, 0.7, ItemType::Message),
            scored(3, 0.5, ItemType::Message),
        ];
        let refs: Vec<&ContextItem> = items.iter().collect();
        let strategy = RelevanceStrategy::new(PreserveSet::new([ItemType::System], Vec::new()), 0.6);
        assert_eq!(
            ids(&strategy.eviction_order(&refs)),
            vec!["i3", "i2", "i1", "i0"]
        );
    }

    #[test]
    fn system_items_are_never_candidates() {
        let items = [
            scored(0, 0.0, ItemType::System),
            scored(1, 0.8, ItemType::Preference),
            scored(2, 0.8, ItemType::Message),
        ];
        let refs: Vec<&ContextItem> = items.iter().collect();
        let order = RelevanceStrategy::default().eviction_order(&refs);
        // equal scores: older first
        assert_eq!(ids(&order), vec!["i1", "i2"]);
    }
}
