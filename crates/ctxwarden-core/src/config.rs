//! Runtime configuration for ctxwarden.
//!
//! [`CtxwardenConfig::default`] gives working values for every knob;
//! [`CtxwardenConfig::from_env`] layers `CTXWARDEN_*` environment overrides
//! on top and validates the result.

use std::str::FromStr;
use std::time::Duration;

use ctxwarden_state::{ItemType, Priority};
use serde::{Deserialize, Serialize};

use crate::error::{CtxwardenError, Result};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtxwardenConfig {
    /// Budget for windows created on demand
    pub default_max_tokens: u64,
    pub monitor: MonitorConfig,
    pub strategies: StrategyConfig,
    pub enrichment: EnrichmentConfig,
    pub summarization: SummarizationConfig,
}

impl Default for CtxwardenConfig {
    fn default() -> Self {
        Self {
            default_max_tokens: 4000,
            monitor: MonitorConfig::default(),
            strategies: StrategyConfig::default(),
            enrichment: EnrichmentConfig::default(),
            summarization: SummarizationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Usage percentage at which an active window needs pruning
    pub prune_threshold_percent: f64,
    /// TTL refreshed on every telemetry write
    pub telemetry_ttl_secs: u64,
    /// Capacity of the recent pruning events ring
    pub recent_events_capacity: usize,
    /// Prefix for every telemetry key
    pub key_prefix: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            prune_threshold_percent: 75.0,
            telemetry_ttl_secs: 7 * 24 * 60 * 60,
            recent_events_capacity: 50,
            key_prefix: "ctxwarden:pruning".to_string(),
        }
    }
}

impl MonitorConfig {
    pub fn telemetry_ttl(&self) -> Duration {
        Duration::from_secs(self.telemetry_ttl_secs)
    }
}

/// Item types and priorities a strategy must not evict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreserveSet {
    pub types: Vec<ItemType>,
    pub priorities: Vec<Priority>,
}

impl PreserveSet {
    pub fn new(types: impl Into<Vec<ItemType>>, priorities: impl Into<Vec<Priority>>) -> Self {
        Self {
            types: types.into(),
            priorities: priorities.into(),
        }
    }

    pub fn preserves_type(&self, item_type: ItemType) -> bool {
        self.types.contains(&item_type)
    }

    pub fn preserves_priority(&self, priority: Priority) -> bool {
        self.priorities.contains(&priority)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub priority_preserve: PreserveSet,
    pub relevance_preserve: PreserveSet,
    pub min_relevance: f64,
    pub time_preserve: PreserveSet,
    /// Most-recent prunable items the time strategy keeps
    pub preserve_count: usize,
    /// Strategy names (`priority`, `relevance`, `time`) in hybrid order
    pub hybrid_order: Vec<String>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            priority_preserve: PreserveSet::new([ItemType::System], [Priority::Critical]),
            relevance_preserve: PreserveSet::new([ItemType::System], Vec::new()),
            min_relevance: 0.5,
            time_preserve: PreserveSet::new([ItemType::System], Vec::new()),
            preserve_count: 10,
            hybrid_order: vec![
                "priority".to_string(),
                "relevance".to_string(),
                "time".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub completion_timeout_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 64,
            completion_timeout_ms: 30_000,
        }
    }
}

impl EnrichmentConfig {
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummarizationConfig {
    pub token_threshold: u64,
    pub count_threshold: usize,
    pub segment_size: usize,
    pub segment_overlap: usize,
}

impl Default for SummarizationConfig {
    fn default() -> Self {
        Self {
            token_threshold: 3000,
            count_threshold: 20,
            segment_size: 10,
            segment_overlap: 2,
        }
    }
}

fn env_override<T: FromStr>(name: &str, slot: &mut T) -> Result<()> {
    if let Ok(raw) = std::env::var(name) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| CtxwardenError::Config(format!("{name}: cannot parse {raw:?}")))?;
    }
    Ok(())
}

impl CtxwardenConfig {
    /// Defaults plus `CTXWARDEN_*` overrides, validated.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        env_override("CTXWARDEN_DEFAULT_MAX_TOKENS", &mut config.default_max_tokens)?;
        env_override(
            "CTXWARDEN_PRUNE_THRESHOLD",
            &mut config.monitor.prune_threshold_percent,
        )?;
        env_override(
            "CTXWARDEN_TELEMETRY_TTL_SECS",
            &mut config.monitor.telemetry_ttl_secs,
        )?;
        env_override(
            "CTXWARDEN_RECENT_EVENTS",
            &mut config.monitor.recent_events_capacity,
        )?;
        env_override("CTXWARDEN_ENRICHMENT_WORKERS", &mut config.enrichment.workers)?;
        env_override(
            "CTXWARDEN_ENRICHMENT_QUEUE",
            &mut config.enrichment.queue_capacity,
        )?;
        env_override(
            "CTXWARDEN_COMPLETION_TIMEOUT_MS",
            &mut config.enrichment.completion_timeout_ms,
        )?;
        env_override(
            "CTXWARDEN_SUMMARY_TOKEN_THRESHOLD",
            &mut config.summarization.token_threshold,
        )?;
        env_override(
            "CTXWARDEN_SUMMARY_COUNT_THRESHOLD",
            &mut config.summarization.count_threshold,
        )?;
        env_override("CTXWARDEN_SEGMENT_SIZE", &mut config.summarization.segment_size)?;
        env_override(
            "CTXWARDEN_SEGMENT_OVERLAP",
            &mut config.summarization.segment_overlap,
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let threshold = self.monitor.prune_threshold_percent;
        if !(threshold > 0.0 && threshold <= 100.0) {
            return Err(CtxwardenError::Config(format!(
                "prune threshold must be within (0, 100], got {threshold}"
            )));
        }
        if self.monitor.recent_events_capacity == 0 {
            return Err(CtxwardenError::Config(
                "recent events capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.strategies.min_relevance) {
            return Err(CtxwardenError::Config(format!(
                "min relevance must be within [0, 1], got {}",
                self.strategies.min_relevance
            )));
        }
        if self.enrichment.workers == 0 || self.enrichment.queue_capacity == 0 {
            return Err(CtxwardenError::Config(
                "enrichment needs at least one worker and queue slot".to_string(),
            ));
        }
        let seg = &self.summarization;
        if seg.segment_size == 0 || seg.segment_overlap >= seg.segment_size {
            return Err(CtxwardenError::Config(format!(
                "segment overlap ({}) must be smaller than a non-zero segment size ({})",
                seg.segment_overlap, seg.segment_size
            )));
        }
        Ok(())
    }
}
