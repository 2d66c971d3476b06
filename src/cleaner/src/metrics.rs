//! Cleaner metrics tracking
//!
//! Thread-safe counters shared between the scheduler and the reconciler.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::reconciler::PassReport;

/// Thread-safe metrics for reconciliation passes
#[derive(Debug, Clone, Default)]
pub struct CleanerMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    passes_completed: AtomicUsize,
    passes_failed: AtomicUsize,
    passes_timed_out: AtomicUsize,
    writes_aborted: AtomicUsize,
    aborts_skipped: AtomicUsize,
    deletions_succeeded: AtomicUsize,
    deletions_failed: AtomicUsize,
    watermark_advances: AtomicUsize,
    records_purged: AtomicUsize,
    tables_halted: AtomicUsize,
}

impl CleanerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed pass and everything it did
    pub fn record_pass(&self, report: &PassReport) {
        let inner = &self.inner;
        inner.passes_completed.fetch_add(1, Ordering::Relaxed);
        inner
            .writes_aborted
            .fetch_add(report.aborted_ids.len(), Ordering::Relaxed);
        inner
            .aborts_skipped
            .fetch_add(report.skipped_ids.len(), Ordering::Relaxed);
        inner
            .deletions_succeeded
            .fetch_add(report.deleted_ids.len(), Ordering::Relaxed);
        inner
            .deletions_failed
            .fetch_add(report.failed_deletions.len(), Ordering::Relaxed);
        inner
            .records_purged
            .fetch_add(report.purged_ids.len(), Ordering::Relaxed);
        if report.watermark_advanced() {
            inner.watermark_advances.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_pass_failure(&self) {
        self.inner.passes_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pass_timeout(&self) {
        self.inner.passes_timed_out.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_table_halted(&self) {
        self.inner.tables_halted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn passes_completed(&self) -> usize {
        self.inner.passes_completed.load(Ordering::Relaxed)
    }

    pub fn passes_failed(&self) -> usize {
        self.inner.passes_failed.load(Ordering::Relaxed)
    }

    pub fn writes_aborted(&self) -> usize {
        self.inner.writes_aborted.load(Ordering::Relaxed)
    }

    pub fn deletions_failed(&self) -> usize {
        self.inner.deletions_failed.load(Ordering::Relaxed)
    }

    pub fn tables_halted(&self) -> usize {
        self.inner.tables_halted.load(Ordering::Relaxed)
    }

    /// Get a summary of all metrics
    pub fn summary(&self) -> MetricsSummary {
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        let inner = &self.inner;
        MetricsSummary {
            passes_completed: load(&inner.passes_completed),
            passes_failed: load(&inner.passes_failed),
            passes_timed_out: load(&inner.passes_timed_out),
            writes_aborted: load(&inner.writes_aborted),
            aborts_skipped: load(&inner.aborts_skipped),
            deletions_succeeded: load(&inner.deletions_succeeded),
            deletions_failed: load(&inner.deletions_failed),
            watermark_advances: load(&inner.watermark_advances),
            records_purged: load(&inner.records_purged),
            tables_halted: load(&inner.tables_halted),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSummary {
    pub passes_completed: usize,
    pub passes_failed: usize,
    pub passes_timed_out: usize,
    pub writes_aborted: usize,
    pub aborts_skipped: usize,
    pub deletions_succeeded: usize,
    pub deletions_failed: usize,
    pub watermark_advances: usize,
    pub records_purged: usize,
    pub tables_halted: usize,
}

impl MetricsSummary {
    /// Log the metrics summary
    pub fn log(&self) {
        tracing::info!(
            completed = self.passes_completed,
            failed = self.passes_failed,
            timed_out = self.passes_timed_out,
            halted_tables = self.tables_halted,
            "Cleaner passes"
        );
        tracing::info!(
            aborted = self.writes_aborted,
            skipped = self.aborts_skipped,
            deleted = self.deletions_succeeded,
            failed_deletions = self.deletions_failed,
            watermark_advances = self.watermark_advances,
            purged = self.records_purged,
            "Cleaner write activity"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::writes::{TableName, TableWriteState};
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_metrics_initialization() {
        let metrics = CleanerMetrics::new();
        let summary = metrics.summary();

        assert_eq!(summary.passes_completed, 0);
        assert_eq!(summary.writes_aborted, 0);
        assert_eq!(summary.tables_halted, 0);
    }

    #[test]
    fn test_record_pass() {
        let metrics = CleanerMetrics::new();
        let state = TableWriteState {
            next_write_id: 4,
            watermark: -1,
        };
        let report = PassReport {
            table: TableName::new("db", "t"),
            previous_watermark: state.watermark,
            new_watermark: 1,
            aborted_ids: BTreeSet::from([1, 3]),
            skipped_ids: BTreeSet::new(),
            deleted_ids: BTreeSet::from([1]),
            failed_deletions: BTreeMap::from([(3, "boom".to_string())]),
            purged_ids: vec![0, 1],
        };

        metrics.record_pass(&report);
        let summary = metrics.summary();
        assert_eq!(summary.passes_completed, 1);
        assert_eq!(summary.writes_aborted, 2);
        assert_eq!(summary.deletions_succeeded, 1);
        assert_eq!(summary.deletions_failed, 1);
        assert_eq!(summary.watermark_advances, 1);
        assert_eq!(summary.records_purged, 2);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = CleanerMetrics::new();
        let clone = metrics.clone();

        clone.record_pass_failure();
        clone.record_pass_timeout();
        clone.record_table_halted();

        assert_eq!(metrics.passes_failed(), 1);
        assert_eq!(metrics.summary().passes_timed_out, 1);
        assert_eq!(metrics.tables_halted(), 1);
    }
}
