//! WindowMonitor: window health, statistics and pruning telemetry.
//!
//! Health and statistics are read from the [`ContextStore`]. Pruning events
//! are recorded to a [`CounterCache`] as best-effort telemetry: every cache
//! failure is logged at `warn!` and swallowed, so losing telemetry never
//! affects the store or the pruning engine.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ctxwarden_state::{ContextWindow, CounterCache, ItemType, Priority, StorageResult, WindowId};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::error::Result;
use crate::metrics::{MetricsSnapshot, METRICS};
use crate::store::ContextStore;

/// Usage above this percentage is critical.
pub const CRITICAL_USAGE_PERCENT: f64 = 90.0;
/// Usage above this percentage is high.
pub const HIGH_USAGE_PERCENT: f64 = 75.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    High,
    Critical,
}

impl HealthLevel {
    pub fn from_usage(usage_percent: f64) -> Self {
        if usage_percent > CRITICAL_USAGE_PERCENT {
            HealthLevel::Critical
        } else if usage_percent > HIGH_USAGE_PERCENT {
            HealthLevel::High
        } else {
            HealthLevel::Healthy
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::High => "high",
            HealthLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowHealth {
    pub window_id: WindowId,
    pub is_healthy: bool,
    pub level: HealthLevel,
    pub message: String,
    pub usage_percent: f64,
}

/// Item count and token sum of one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStats {
    pub items: u64,
    pub tokens: u64,
}

impl BucketStats {
    fn add(&mut self, tokens: u64) {
        self.items += 1;
        self.tokens += tokens;
    }
}

/// Statistics over a window's included items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowStatistics {
    pub window_id: WindowId,
    pub item_count: u64,
    pub token_sum: u64,
    pub max_tokens: u64,
    pub token_usage_percent: f64,
    pub by_type: BTreeMap<ItemType, BucketStats>,
    pub by_priority: BTreeMap<Priority, BucketStats>,
}

/// One recorded prune run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningEvent {
    pub window_id: WindowId,
    pub strategy: String,
    pub tokens_before: u64,
    pub tokens_after: u64,
    pub tokens_removed: u64,
    pub items_removed: u64,
    pub recorded_at: DateTime<Utc>,
}

/// Running totals for all strategies or for one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruningTotals {
    pub count: i64,
    pub tokens_removed: i64,
    pub items_removed: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PruningMetrics {
    pub totals: PruningTotals,
    pub by_strategy: BTreeMap<String, PruningTotals>,
    pub recent: Vec<PruningEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeMetrics {
    pub conversations: u64,
    pub windows: u64,
    pub active_windows: u64,
    pub items: u64,
    pub included_items: u64,
    pub counters: MetricsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalStatus {
    pub runtime: RuntimeMetrics,
    pub pruning: PruningMetrics,
    pub windows_requiring_pruning: Vec<WindowId>,
}

/// Key layout in the counter cache.
#[derive(Debug, Clone)]
struct Keys {
    prefix: String,
}

impl Keys {
    fn total(&self, field: &str) -> String {
        format!("{}:{field}", self.prefix)
    }

    fn strategy(&self, strategy: &str, field: &str) -> String {
        format!("{}:strategy:{strategy}:{field}", self.prefix)
    }

    fn recent(&self) -> String {
        format!("{}:recent", self.prefix)
    }

    fn strategies(&self) -> String {
        format!("{}:strategies", self.prefix)
    }
}

fn needs_pruning(window: &ContextWindow, threshold_percent: f64) -> bool {
    if window.current_tokens == 0 {
        return false;
    }
    window.current_tokens as f64 >= window.max_tokens as f64 * threshold_percent / 100.0
}

#[derive(Clone)]
pub struct WindowMonitor {
    store: ContextStore,
    cache: Arc<dyn CounterCache>,
    config: MonitorConfig,
    keys: Keys,
}

impl WindowMonitor {
    pub fn new(store: ContextStore, cache: Arc<dyn CounterCache>, config: MonitorConfig) -> Self {
        let keys = Keys {
            prefix: config.key_prefix.clone(),
        };
        Self {
            store,
            cache,
            config,
            keys,
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub async fn window_statistics(&self, window_id: &WindowId) -> Result<WindowStatistics> {
        let window = self.store.window(window_id).await?;
        let items = self.store.items_for_window(window_id, true).await?;

        let mut by_type: BTreeMap<ItemType, BucketStats> = BTreeMap::new();
        let mut by_priority: BTreeMap<Priority, BucketStats> = BTreeMap::new();
        let mut token_sum = 0;
        for item in &items {
            token_sum += item.token_count;
            by_type.entry(item.item_type).or_default().add(item.token_count);
            by_priority
                .entry(item.priority)
                .or_default()
                .add(item.token_count);
        }

        let token_usage_percent = ContextWindow {
            current_tokens: token_sum,
            ..window.clone()
        }
        .usage_percent();

        Ok(WindowStatistics {
            window_id: window.id,
            item_count: items.len() as u64,
            token_sum,
            max_tokens: window.max_tokens,
            token_usage_percent,
            by_type,
            by_priority,
        })
    }

    /// Fails with `WindowNotFound` when the window is absent.
    pub async fn window_health(&self, window_id: &WindowId) -> Result<WindowHealth> {
        let window = self.store.window(window_id).await?;
        let usage_percent = window.usage_percent();
        let level = HealthLevel::from_usage(usage_percent);
        let message = match level {
            HealthLevel::Critical => format!("token usage critical at {usage_percent:.1}%"),
            HealthLevel::High => format!("token usage high at {usage_percent:.1}%"),
            HealthLevel::Healthy => format!("token usage healthy at {usage_percent:.1}%"),
        };
        Ok(WindowHealth {
            window_id: window.id,
            is_healthy: level == HealthLevel::Healthy,
            level,
            message,
            usage_percent,
        })
    }

    /// Active windows whose usage is at or above `threshold_percent`.
    pub async fn windows_requiring_pruning(&self, threshold_percent: f64) -> Result<Vec<WindowId>> {
        Ok(self
            .store
            .windows(true)
            .await?
            .into_iter()
            .filter(|w| needs_pruning(w, threshold_percent))
            .map(|w| w.id)
            .collect())
    }

    /// Record one prune run. Never fails; cache errors are logged.
    pub async fn record_pruning_event(
        &self,
        window_id: &WindowId,
        strategy: &str,
        tokens_before: u64,
        tokens_after: u64,
        items_removed: u64,
    ) {
        let event = PruningEvent {
            window_id: window_id.clone(),
            strategy: strategy.to_string(),
            tokens_before,
            tokens_after,
            tokens_removed: tokens_before.saturating_sub(tokens_after),
            items_removed,
            recorded_at: Utc::now(),
        };
        if let Err(e) = self.try_record(&event).await {
            warn!(
                window_id = %window_id,
                strategy = %strategy,
                error = %e,
                "failed to record pruning telemetry"
            );
        }
    }

    async fn try_record(&self, event: &PruningEvent) -> StorageResult<()> {
        let ttl = self.config.telemetry_ttl();
        let tokens = i64::try_from(event.tokens_removed).unwrap_or(i64::MAX);
        let items = i64::try_from(event.items_removed).unwrap_or(i64::MAX);

        let strategy_count = self.keys.strategy(&event.strategy, "count");
        let bumps = [
            (self.keys.total("count"), 1),
            (self.keys.total("tokens_removed"), tokens),
            (self.keys.total("items_removed"), items),
            (strategy_count.clone(), 1),
            (self.keys.strategy(&event.strategy, "tokens_removed"), tokens),
            (self.keys.strategy(&event.strategy, "items_removed"), items),
        ];
        let mut first_of_strategy = false;
        for (key, delta) in &bumps {
            let value = self.cache.incr_by(key, *delta).await?;
            if *key == strategy_count && value == 1 {
                first_of_strategy = true;
            }
            self.cache.expire(key, ttl).await?;
        }

        // Only the recorder whose increment created the count key appends the name.
        let index = self.keys.strategies();
        if first_of_strategy {
            self.cache.push(&index, &event.strategy).await?;
        }
        self.cache.expire(&index, ttl).await?;

        let recent = self.keys.recent();
        let payload = serde_json::to_string(event)?;
        self.cache.push(&recent, &payload).await?;
        let capacity = self.config.recent_events_capacity.max(1);
        self.cache.trim(&recent, 0, capacity - 1).await?;
        self.cache.expire(&recent, ttl).await?;

        debug!(window_id = %event.window_id, strategy = %event.strategy, "pruning event recorded");
        Ok(())
    }

    /// Up to `limit` most recent events, newest first. Unreadable entries are
    /// skipped; an unavailable cache yields an empty list.
    pub async fn recent_events(&self, limit: usize) -> Vec<PruningEvent> {
        if limit == 0 {
            return Vec::new();
        }
        match self.cache.range(&self.keys.recent(), 0, limit - 1).await {
            Ok(raw) => raw
                .iter()
                .filter_map(|entry| match serde_json::from_str(entry) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        warn!(error = %e, "skipping unreadable pruning event");
                        None
                    }
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to read recent pruning events");
                Vec::new()
            }
        }
    }

    /// Strategy names that have recorded events. A name whose counters
    /// expired and came back appears twice in the list; the set dedupes it.
    async fn read_strategy_index(&self) -> StorageResult<BTreeSet<String>> {
        let names = self
            .cache
            .range(&self.keys.strategies(), 0, usize::MAX)
            .await?;
        Ok(names.into_iter().collect())
    }

    async fn read_counter(&self, key: &str) -> i64 {
        match self.cache.get(key).await {
            Ok(Some(raw)) => raw.parse().unwrap_or_else(|_| {
                warn!(key = %key, value = %raw, "non-numeric pruning counter");
                0
            }),
            Ok(None) => 0,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read pruning counter");
                0
            }
        }
    }

    async fn read_totals(&self, key: impl Fn(&str) -> String) -> PruningTotals {
        PruningTotals {
            count: self.read_counter(&key("count")).await,
            tokens_removed: self.read_counter(&key("tokens_removed")).await,
            items_removed: self.read_counter(&key("items_removed")).await,
        }
    }

    /// Cache-backed pruning totals plus the per-strategy breakdown of every
    /// strategy that has recorded an event within the telemetry TTL.
    pub async fn pruning_metrics(&self) -> PruningMetrics {
        let totals = self.read_totals(|field| self.keys.total(field)).await;
        let recent = self
            .recent_events(self.config.recent_events_capacity)
            .await;

        let mut names = self.read_strategy_index().await.unwrap_or_else(|e| {
            warn!(error = %e, "failed to read strategy index");
            BTreeSet::new()
        });
        names.extend(recent.iter().map(|event| event.strategy.clone()));

        let mut by_strategy = BTreeMap::new();
        for strategy in names {
            let per = self
                .read_totals(|field| self.keys.strategy(&strategy, field))
                .await;
            by_strategy.insert(strategy, per);
        }

        PruningMetrics {
            totals,
            by_strategy,
            recent,
        }
    }

    pub async fn global_status(&self) -> Result<GlobalStatus> {
        let counts = self.store.counts().await?;
        let windows_requiring_pruning = self
            .windows_requiring_pruning(self.config.prune_threshold_percent)
            .await?;
        let pruning = self.pruning_metrics().await;

        Ok(GlobalStatus {
            runtime: RuntimeMetrics {
                conversations: counts.conversations,
                windows: counts.windows,
                active_windows: counts.active_windows,
                items: counts.items,
                included_items: counts.included_items,
                counters: METRICS.snapshot(),
            },
            pruning,
            windows_requiring_pruning,
        })
    }
}
