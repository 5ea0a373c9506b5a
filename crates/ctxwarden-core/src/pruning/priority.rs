//! Priority-based eviction.

use std::cmp::Reverse;

use async_trait::async_trait;
use ctxwarden_state::{ContextItem, ContextWindow};

use super::{apply_evictions, excess_tokens, included, report, take_until_covered, PruningStrategy};
use crate::config::PreserveSet;
use crate::monitor::WindowMonitor;
use crate::store::ContextStore;

/// Evicts lowest-priority items first.
///
/// Eviction order: items outside the preserved types, then items outside the
/// preserved priorities, then `Low` before `Critical`, then oldest first.
/// An item that is both a preserved type and a preserved priority is never
/// evicted.
#[derive(Debug, Clone)]
pub struct PriorityStrategy {
    preserve: PreserveSet,
}

impl PriorityStrategy {
    pub const NAME: &'static str = "PriorityBasedPruning";

    pub fn new(preserve: PreserveSet) -> Self {
        Self { preserve }
    }

    pub fn preserve(&self) -> &PreserveSet {
        &self.preserve
    }

    /// Evictable items in eviction-first order.
    pub(crate) fn eviction_order<'a>(&self, items: &[&'a ContextItem]) -> Vec<&'a ContextItem> {
        let mut order: Vec<&ContextItem> = items
            .iter()
            .copied()
            .filter(|i| {
                !(self.preserve.preserves_type(i.item_type)
                    && self.preserve.preserves_priority(i.priority))
            })
            .collect();
        order.sort_by_key(|i| {
            (
                self.preserve.preserves_type(i.item_type),
                self.preserve.preserves_priority(i.priority),
                Reverse(i.priority.rank()),
                i.position,
            )
        });
        order
    }
}

impl Default for PriorityStrategy {
    fn default() -> Self {
        Self::new(crate::config::StrategyConfig::default().priority_preserve)
    }
}

#[async_trait]
impl PruningStrategy for PriorityStrategy {
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

    #[test]
    fn low_priority_goes_first_and_critical_last() {
        let items = [
            item(0, 20, ItemType::Message, Priority::Critical),
            item(1, 30, ItemType::Message, Priority::High),
            item(2, 25, ItemType::Message, Priority::Medium),
            item(3, 25, ItemType::Message, Priority::Low),
        ];
        let refs: Vec<&ContextItem> = items.iter().collect();
        let order = PriorityStrategy::default().eviction_order(&refs);
        assert_eq!(ids(&order), vec!["i3", "i2", "i1", "i0"]);
    }

    #[test]
    fn older_item_breaks_priority_ties() {
        let items = [
            item(0, 5, ItemType::Message, Priority::Low),
            item(1, 5, ItemType::Message, Priority::Low),
        ];
        let refs: Vec<&ContextItem> = items.iter().collect();
        let order = PriorityStrategy::default().eviction_order(&refs);
        assert_eq!(ids(&order), vec!["i0", "i1"]);
    }

    #[test]
    fn doubly_preserved_items_are_skipped() {
        let items = [
            item(0, 5, ItemType::System, Priority::Critical),
            item(1, 5, ItemType::System, Priority::Low),
            item(2, 5, ItemType::Message, Priority::Critical),
            item(3, 5, ItemType::Message, Priority::Low),
        ];
        let refs: Vec<&ContextItem> = items.iter().collect();
        let order = PriorityStrategy::default().eviction_order(&refs);
        // non-preserved type first, then preserved type
        assert_eq!(ids(&order), vec!["i3", "i2", "i1"]);
    }
}
