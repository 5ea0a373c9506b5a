//! Global atomic counters for ctxwarden observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. at the end of a bulk prune).

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Process-wide counters updated with relaxed atomics.
pub struct Metrics {
    items_added: AtomicU64,
    evictions: AtomicU64,
    prune_runs: AtomicU64,
    prune_failures: AtomicU64,
    enrichment_completed: AtomicU64,
    enrichment_failed: AtomicU64,
    enrichment_dropped: AtomicU64,
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub items_added: u64,
    pub evictions: u64,
    pub prune_runs: u64,
    pub prune_failures: u64,
    pub enrichment_completed: u64,
    pub enrichment_failed: u64,
    pub enrichment_dropped: u64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            items_added: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            prune_runs: AtomicU64::new(0),
            prune_failures: AtomicU64::new(0),
            enrichment_completed: AtomicU64::new(0),
            enrichment_failed: AtomicU64::new(0),
            enrichment_dropped: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, metric: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric, "counter incremented");
    }

    pub fn inc_items_added(&self) {
        Self::bump(&self.items_added, "items_added");
    }

    /// One item excluded from its window.
    pub fn inc_evictions(&self) {
        Self::bump(&self.evictions, "evictions");
    }

    pub fn inc_prune_runs(&self) {
        Self::bump(&self.prune_runs, "prune_runs");
    }

    pub fn inc_prune_failures(&self) {
        Self::bump(&self.prune_failures, "prune_failures");
    }

    pub fn inc_enrichment_completed(&self) {
        Self::bump(&self.enrichment_completed, "enrichment_completed");
    }

    pub fn inc_enrichment_failed(&self) {
        Self::bump(&self.enrichment_failed, "enrichment_failed");
    }

    /// A job rejected because the enrichment queue was full or closed.
    pub fn inc_enrichment_dropped(&self) {
        Self::bump(&self.enrichment_dropped, "enrichment_dropped");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            items_added: self.items_added.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            prune_runs: self.prune_runs.load(Ordering::Relaxed),
            prune_failures: self.prune_failures.load(Ordering::Relaxed),
            enrichment_completed: self.enrichment_completed.load(Ordering::Relaxed),
            enrichment_failed: self.enrichment_failed.load(Ordering::Relaxed),
            enrichment_dropped: self.enrichment_dropped.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    ///
    /// Call this at natural boundaries (end of a bulk prune, watch tick, etc.)
    /// rather than on every increment.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            items_added = s.items_added,
            evictions = s.evictions,
            prune_runs = s.prune_runs,
            prune_failures = s.prune_failures,
            enrichment_completed = s.enrichment_completed,
            enrichment_failed = s.enrichment_failed,
            enrichment_dropped = s.enrichment_dropped,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.items_added,
            &self.evictions,
            &self.prune_runs,
            &self.prune_failures,
            &self.enrichment_completed,
            &self.enrichment_failed,
            &self.enrichment_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
