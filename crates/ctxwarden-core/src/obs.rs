//! Structured observability hooks for window, item, pruning and enrichment
//! lifecycle events.
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`), failures at
//! `warn!`. For JSON output, run the CLI with `--json`.

use tracing::{info, warn};

pub fn emit_window_created(window_id: &str, conversation_id: &str, max_tokens: u64) {
    info!(
        event = "window.created",
        window_id = %window_id,
        conversation_id = %conversation_id,
        max_tokens = max_tokens,
    );
}

/// Emit event: a conversation moved to a fresh window.
pub fn emit_window_rotated(
    conversation_id: &str,
    previous_window_id: Option<&str>,
    window_id: &str,
    max_tokens: u64,
) {
    info!(
        event = "window.rotated",
        conversation_id = %conversation_id,
        previous_window_id = previous_window_id.unwrap_or("-"),
        window_id = %window_id,
        max_tokens = max_tokens,
    );
}

pub fn emit_conversation_deleted(conversation_id: &str, windows: usize) {
    info!(
        event = "conversation.deleted",
        conversation_id = %conversation_id,
        windows = windows,
    );
}

pub fn emit_item_added(window_id: &str, item_id: &str, item_type: &str, token_count: u64) {
    info!(
        event = "item.added",
        window_id = %window_id,
        item_id = %item_id,
        item_type = %item_type,
        token_count = token_count,
    );
}

pub fn emit_inclusion_changed(window_id: &str, item_id: &str, included: bool, window_tokens: u64) {
    info!(
        event = "item.inclusion_changed",
        window_id = %window_id,
        item_id = %item_id,
        included = included,
        window_tokens = window_tokens,
    );
}

/// Emit event: a prune run finished (successfully or with partial progress).
pub fn emit_prune_completed(
    window_id: &str,
    strategy: &str,
    tokens_before: u64,
    tokens_after: u64,
    items_removed: u64,
) {
    info!(
        event = "prune.completed",
        window_id = %window_id,
        strategy = %strategy,
        tokens_before = tokens_before,
        tokens_after = tokens_after,
        items_removed = items_removed,
    );
}

/// Emit event: a storage call failed during pruning (warning level).
pub fn emit_prune_failed(window_id: &str, strategy: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "prune.failed",
        window_id = %window_id,
        strategy = %strategy,
        error = %error,
    );
}

/// Emit event: a drifted token sum was recomputed (warning level).
pub fn emit_invariant_repaired(window_id: &str, cached: u64, actual: u64) {
    warn!(
        event = "invariant.repaired",
        window_id = %window_id,
        cached = cached,
        actual = actual,
    );
}

pub fn emit_enrichment_enqueued(job_id: &str, kind: &str, window_id: &str) {
    info!(
        event = "enrichment.enqueued",
        job_id = %job_id,
        kind = %kind,
        window_id = %window_id,
    );
}

pub fn emit_enrichment_completed(job_id: &str, window_id: &str, item_id: &str, total_tokens: u64) {
    info!(
        event = "enrichment.completed",
        job_id = %job_id,
        window_id = %window_id,
        item_id = %item_id,
        total_tokens = total_tokens,
    );
}

/// Emit event: an enrichment job was skipped (warning level).
pub fn emit_enrichment_failed(job_id: &str, window_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "enrichment.failed",
        job_id = %job_id,
        window_id = %window_id,
        error = %error,
    );
}

pub fn emit_enrichment_dropped(kind: &str, window_id: &str, reason: &str) {
    warn!(
        event = "enrichment.dropped",
        kind = %kind,
        window_id = %window_id,
        reason = %reason,
    );
}
