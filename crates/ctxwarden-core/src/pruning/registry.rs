//! Strategy registry built once from configuration.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::{HybridStrategy, PriorityStrategy, PruningStrategy, RelevanceStrategy, TimeStrategy};
use crate::config::StrategyConfig;
use crate::error::{CtxwardenError, Result};

/// Caller-facing strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Priority,
    Relevance,
    Time,
    Hybrid,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        StrategyKind::Priority,
        StrategyKind::Relevance,
        StrategyKind::Time,
        StrategyKind::Hybrid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Priority => "priority",
            StrategyKind::Relevance => "relevance",
            StrategyKind::Time => "time",
            StrategyKind::Hybrid => "hybrid",
        }
    }

    /// Telemetry name of the strategy this kind selects.
    pub fn strategy_name(&self) -> &'static str {
        match self {
            StrategyKind::Priority => PriorityStrategy::NAME,
            StrategyKind::Relevance => RelevanceStrategy::NAME,
            StrategyKind::Time => TimeStrategy::NAME,
            StrategyKind::Hybrid => HybridStrategy::NAME,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = CtxwardenError;

    /// Accepts the short kind (`priority`) or the strategy name
    /// (`PriorityBasedPruning`), case-insensitively.
    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        StrategyKind::ALL
            .into_iter()
            .find(|k| {
                k.as_str().eq_ignore_ascii_case(wanted)
                    || k.strategy_name().eq_ignore_ascii_case(wanted)
            })
            .ok_or_else(|| CtxwardenError::UnknownStrategy(wanted.to_string()))
    }
}

/// The strategy instances of a process.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    priority: Arc<PriorityStrategy>,
    relevance: Arc<RelevanceStrategy>,
    time: Arc<TimeStrategy>,
    hybrid: Arc<HybridStrategy>,
}

impl StrategyRegistry {
    /// Fails with `UnknownStrategy` for an unknown hybrid entry and with
    /// `Config` when the hybrid order nests `hybrid`.
    pub fn from_config(config: &StrategyConfig) -> Result<Self> {
        let priority = Arc::new(PriorityStrategy::new(config.priority_preserve.clone()));
        let relevance = Arc::new(RelevanceStrategy::new(
            config.relevance_preserve.clone(),
            config.min_relevance,
        ));
        let time = Arc::new(TimeStrategy::new(
            config.time_preserve.clone(),
            config.preserve_count,
        ));

        let mut inner: Vec<Arc<dyn PruningStrategy>> = Vec::with_capacity(config.hybrid_order.len());
        for entry in &config.hybrid_order {
            let strategy: Arc<dyn PruningStrategy> = match entry.parse::<StrategyKind>()? {
                StrategyKind::Priority => priority.clone(),
                StrategyKind::Relevance => relevance.clone(),
                StrategyKind::Time => time.clone(),
                StrategyKind::Hybrid => {
                    return Err(CtxwardenError::Config(
                        "hybrid order cannot contain hybrid".to_string(),
                    ))
                }
            };
            inner.push(strategy);
        }

        Ok(Self {
            priority,
            relevance,
            time,
            hybrid: Arc::new(HybridStrategy::new(inner)),
        })
    }

    pub fn get(&self, kind: StrategyKind) -> Arc<dyn PruningStrategy> {
        match kind {
            StrategyKind::Priority => self.priority.clone(),
            StrategyKind::Relevance => self.relevance.clone(),
            StrategyKind::Time => self.time.clone(),
            StrategyKind::Hybrid => self.hybrid.clone(),
        }
    }

    /// Look up by kind or strategy name.
    pub fn by_name(&self, name: &str) -> Result<Arc<dyn PruningStrategy>> {
        Ok(self.get(name.parse()?))
    }

    pub fn hybrid(&self) -> &HybridStrategy {
        &self.hybrid
    }
}
