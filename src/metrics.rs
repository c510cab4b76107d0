// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the offline data layer.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `offline_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: sqlite, file, memory
//! - `operation`: get, set, create, update, delete, query
//! - `status`: success, error
//! - `collection`: remote collection name

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a storage tier operation
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "offline_sync_storage_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "offline_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A write landed in a fallback tier because the ones before it failed
pub fn record_tier_fallback(tier: &str) {
    counter!(
        "offline_sync_tier_fallbacks_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// Record bytes written to a tier
pub fn record_bytes_written(tier: &str, bytes: usize) {
    counter!(
        "offline_sync_bytes_written_total",
        "tier" => tier.to_string()
    )
    .increment(bytes as u64);
}

/// Record an error with category for alerting
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "offline_sync_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE - Pending work
// ═══════════════════════════════════════════════════════════════════════════

/// Set unsynced queue entries
pub fn set_pending_changes(count: usize) {
    gauge!("offline_sync_pending_changes").set(count as f64);
}

/// Record a queue mutation (enqueue, synced, failed)
pub fn record_queue_operation(collection: &str, action: &str) {
    counter!(
        "offline_sync_queue_operations_total",
        "collection" => collection.to_string(),
        "action" => action.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC - Pass and per-entry outcomes
// ═══════════════════════════════════════════════════════════════════════════

/// Record one queue entry applied (or not) to the remote store
pub fn record_sync_entry(collection: &str, operation: &str, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!(
        "offline_sync_entries_total",
        "collection" => collection.to_string(),
        "operation" => operation.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a completed sync pass
pub fn record_sync_pass(synced: usize, failed: usize, duration: Duration) {
    let status = if failed == 0 { "success" } else { "partial" };
    counter!("offline_sync_passes_total", "status" => status).increment(1);
    histogram!("offline_sync_pass_seconds").record(duration.as_secs_f64());
    histogram!("offline_sync_pass_entries").record((synced + failed) as f64);
}

/// A sync request was dropped (offline or already syncing)
pub fn record_sync_skipped(reason: &str) {
    counter!(
        "offline_sync_skipped_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a post-sync cache refill of one collection
pub fn record_refill(collection: &str, success: bool, records: usize) {
    let status = if success { "success" } else { "error" };
    counter!(
        "offline_sync_refills_total",
        "collection" => collection.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        gauge!(
            "offline_sync_cached_records",
            "collection" => collection.to_string()
        )
        .set(records as f64);
    }
}

/// Set engine state (for monitoring state machine transitions)
pub fn set_engine_state(state: &str) {
    counter!(
        "offline_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CONNECTIVITY & GATEWAY
// ═══════════════════════════════════════════════════════════════════════════

/// Set connectivity (1 = online, 0 = offline)
pub fn set_connected(connected: bool) {
    gauge!("offline_sync_connected").set(if connected { 1.0 } else { 0.0 });
}

/// Record which path a gateway call took (`online` or `offline`)
pub fn record_gateway_call(collection: &str, operation: &str, path: &str) {
    counter!(
        "offline_sync_gateway_calls_total",
        "collection" => collection.to_string(),
        "operation" => operation.to_string(),
        "path" => path.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// STARTUP - Timing for cold start monitoring
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "offline_sync_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
