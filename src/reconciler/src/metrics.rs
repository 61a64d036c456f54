//! Reconciliation metrics tracking
//!
//! Thread-safe counters shared by all group tasks of a run.

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Thread-safe metrics for reconciliation runs
#[derive(Debug, Clone)]
pub struct ReconcileMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    groups_found: AtomicUsize,
    groups_merged: AtomicUsize,
    groups_failed: AtomicUsize,
    groups_skipped: AtomicUsize,
    rows_repointed: AtomicU64,
    rows_deleted: AtomicU64,
    retries_attempted: AtomicUsize,
    rollbacks: AtomicUsize,
    total_group_duration_ms: AtomicU64,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner::default()),
        }
    }

    pub fn record_groups_found(&self, count: usize) {
        self.inner.groups_found.fetch_add(count, Ordering::Relaxed);
    }

    /// Record a group whose work reached its end, committed or rolled back for a dry run.
    pub fn record_group_merged(&self, rows_repointed: u64, rows_deleted: u64, duration: Duration) {
        self.inner.groups_merged.fetch_add(1, Ordering::Relaxed);
        self.inner
            .rows_repointed
            .fetch_add(rows_repointed, Ordering::Relaxed);
        self.inner
            .rows_deleted
            .fetch_add(rows_deleted, Ordering::Relaxed);
        self.inner
            .total_group_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_group_failed(&self) {
        self.inner.groups_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_group_skipped(&self) {
        self.inner.groups_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.inner.retries_attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rollback(&self) {
        self.inner.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn groups_found(&self) -> usize {
        self.inner.groups_found.load(Ordering::Relaxed)
    }

    pub fn groups_merged(&self) -> usize {
        self.inner.groups_merged.load(Ordering::Relaxed)
    }

    pub fn groups_failed(&self) -> usize {
        self.inner.groups_failed.load(Ordering::Relaxed)
    }

    pub fn groups_skipped(&self) -> usize {
        self.inner.groups_skipped.load(Ordering::Relaxed)
    }

    pub fn rows_repointed(&self) -> u64 {
        self.inner.rows_repointed.load(Ordering::Relaxed)
    }

    pub fn rows_deleted(&self) -> u64 {
        self.inner.rows_deleted.load(Ordering::Relaxed)
    }

    pub fn retries_attempted(&self) -> usize {
        self.inner.retries_attempted.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> usize {
        self.inner.rollbacks.load(Ordering::Relaxed)
    }

    /// Average time spent per merged group
    pub fn avg_group_duration_ms(&self) -> f64 {
        let total_ms = self.inner.total_group_duration_ms.load(Ordering::Relaxed) as f64;
        let groups = self.groups_merged() as f64;

        if groups > 0.0 { total_ms / groups } else { 0.0 }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            groups_found: self.groups_found(),
            groups_merged: self.groups_merged(),
            groups_failed: self.groups_failed(),
            groups_skipped: self.groups_skipped(),
            rows_repointed: self.rows_repointed(),
            rows_deleted: self.rows_deleted(),
            retries_attempted: self.retries_attempted(),
            rollbacks: self.rollbacks(),
            avg_group_duration_ms: self.avg_group_duration_ms(),
        }
    }
}

/// Point-in-time copy of [`ReconcileMetrics`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub groups_found: usize,
    pub groups_merged: usize,
    pub groups_failed: usize,
    pub groups_skipped: usize,
    pub rows_repointed: u64,
    pub rows_deleted: u64,
    pub retries_attempted: usize,
    pub rollbacks: usize,
    pub avg_group_duration_ms: f64,
}

impl std::fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "groups: {} found, {} merged, {} failed, {} skipped; rows: {} repointed, {} deleted; \
             retries: {}, rollbacks: {}, avg group: {:.1}ms",
            self.groups_found,
            self.groups_merged,
            self.groups_failed,
            self.groups_skipped,
            self.rows_repointed,
            self.rows_deleted,
            self.retries_attempted,
            self.rollbacks,
            self.avg_group_duration_ms
        )
    }
}
