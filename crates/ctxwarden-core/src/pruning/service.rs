//! Caller-facing pruning entry points.

use std::sync::Arc;

use ctxwarden_state::{ConversationId, WindowId};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use super::{StrategyKind, StrategyRegistry};
use crate::error::{CtxwardenError, Result};
use crate::locks::LockMap;
use crate::metrics::METRICS;
use crate::monitor::WindowMonitor;
use crate::store::ContextStore;

/// Outcome of one prune call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    pub window_id: WindowId,
    pub strategy: String,
    pub budget: u64,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub items_removed: u64,
    pub success: bool,
}

/// Selects a strategy by kind, resolves the budget and prunes with the
/// monitor attached. Prunes of one window never interleave.
#[derive(Clone)]
pub struct PruningService {
    store: ContextStore,
    monitor: WindowMonitor,
    registry: Arc<StrategyRegistry>,
    gates: Arc<LockMap>,
}

impl PruningService {
    pub fn new(store: ContextStore, monitor: WindowMonitor, registry: Arc<StrategyRegistry>) -> Self {
        Self {
            store,
            monitor,
            registry,
            gates: Arc::new(LockMap::default()),
        }
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    pub fn monitor(&self) -> &WindowMonitor {
        &self.monitor
    }

    /// Prune the conversation's active window. The budget is
    /// `max_tokens_override` or the window's own `max_tokens`.
    pub async fn prune_conversation(
        &self,
        conversation_id: &ConversationId,
        kind: StrategyKind,
        max_tokens_override: Option<u64>,
    ) -> Result<PruneReport> {
        let window = self.store.active_window(conversation_id).await?.ok_or_else(|| {
            CtxwardenError::WindowNotFound(format!(
                "no active window for conversation {conversation_id}"
            ))
        })?;
        self.prune_window(&window.id, kind, max_tokens_override).await
    }

    #[instrument(skip(self), fields(window_id = %window_id, strategy = %kind))]
    pub async fn prune_window(
        &self,
        window_id: &WindowId,
        kind: StrategyKind,
        max_tokens_override: Option<u64>,
    ) -> Result<PruneReport> {
        let _gate = self.gates.acquire(window_id.to_string()).await;

        let window = match self.store.window(window_id).await {
            Ok(window) => window,
            Err(e) => {
                if e.is_not_found() {
                    self.forget_window(window_id);
                }
                return Err(e);
            }
        };
        let items = self.store.items_for_window(window_id, true).await?;
        let budget = max_tokens_override.unwrap_or(window.max_tokens);
        let strategy = self.registry.get(kind);

        let success = strategy
            .prune(&self.store, Some(&self.monitor), &window, &items, budget)
            .await;
        METRICS.inc_prune_runs();
        if !success {
            METRICS.inc_prune_failures();
        }

        let after = self.store.window(window_id).await?;
        let remaining = self.store.items_for_window(window_id, true).await?.len();

        Ok(PruneReport {
            window_id: window_id.clone(),
            strategy: strategy.name().to_string(),
            budget,
            tokens_before: window.current_tokens,
            tokens_after: after.current_tokens,
            items_removed: items.len().saturating_sub(remaining) as u64,
            success,
        })
    }

    /// Drop the prune gate of a deleted window. Gates of missing windows are
    /// also dropped on the next prune attempt against them.
    pub fn forget_window(&self, window_id: &WindowId) {
        self.gates.forget([window_id.to_string()]);
    }

    /// Prune every active window at or above `threshold_percent`, continuing
    /// past individual failures. Windows are pruned concurrently. Gates left
    /// behind by deleted or idle windows are dropped afterwards.
    pub async fn prune_all(
        &self,
        threshold_percent: f64,
        kind: StrategyKind,
    ) -> Result<Vec<PruneReport>> {
        let due = self.monitor.windows_requiring_pruning(threshold_percent).await?;
        info!(windows = due.len(), strategy = %kind, "bulk prune starting");

        let outcomes = join_all(due.iter().map(|id| self.prune_window(id, kind, None))).await;
        let mut reports = Vec::with_capacity(outcomes.len());
        for (window_id, outcome) in due.iter().zip(outcomes) {
            match outcome {
                Ok(report) => reports.push(report),
                Err(e) => warn!(window_id = %window_id, error = %e, "skipping window in bulk prune"),
            }
        }

        let dropped = self.gates.forget_idle();
        debug!(dropped, "idle prune gates dropped");

        METRICS.flush();
        Ok(reports)
    }
}
