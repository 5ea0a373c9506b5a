//! ctxwarden core library
//!
//! Token-budgeted context windows for LLM conversations:
//!
//! - [`ContextStore`]: windows and items with exact token accounting
//! - [`pruning`]: priority, relevance, time and hybrid eviction strategies
//! - [`WindowMonitor`]: health, statistics and pruning telemetry
//! - [`segmenter`]: overlapping history segments for summarization
//! - [`enrichment`]: background summarization through a completion client

pub mod config;
pub mod enrichment;
pub mod error;
mod locks;
pub mod metrics;
pub mod monitor;
pub mod obs;
pub mod pruning;
pub mod segmenter;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod tokens;

pub use config::{
    CtxwardenConfig, EnrichmentConfig, MonitorConfig, PreserveSet, StrategyConfig,
    SummarizationConfig,
};
pub use enrichment::{
    Completion, CompletionClient, CompletionError, CompletionRequest, EnrichmentJob,
    EnrichmentQueue, EnrichmentWorkers, SummarizationPipeline, TokenUsage,
};
pub use error::{CtxwardenError, Result};
pub use monitor::{
    BucketStats, GlobalStatus, HealthLevel, PruningEvent, PruningMetrics, PruningTotals,
    RuntimeMetrics, WindowHealth, WindowMonitor, WindowStatistics,
};
pub use pruning::{
    HybridStrategy, PriorityStrategy, PruneReport, PruningService, PruningStrategy,
    RelevanceStrategy, StrategyKind, StrategyRegistry, TimeStrategy, AGGRESSIVE_FALLBACK,
};
pub use segmenter::{segments, should_summarize, Message, Role, Segment, SegmentPlan};
pub use service::ContextService;
pub use store::{ConsistencyReport, ContextStore, ItemSource, ItemSpec};
pub use tokens::{approx_tokens, CharRatioTokenCounter, TokenCounter};

pub use metrics::{MetricsSnapshot, METRICS};
pub use telemetry::init_tracing;

pub use ctxwarden_state::{
    ContextItem, ContextWindow, ConversationId, ItemId, ItemType, Priority, WindowId,
};

/// ctxwarden version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
