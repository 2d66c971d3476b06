//! Periodic driver of reconciliation passes.
//!
//! Every tick the scheduler lists the tables with pending writes and runs one
//! bounded pass per table, several tables at a time. A table whose pass hits
//! an invariant violation is halted and skipped until resumed; any other
//! failure is retried on the next tick.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use common::config::CleanerConfig;
use common::writes::{StoreError, TableName, WriteRecordStore};
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::clock::TimeSource;
use crate::locator::{ArtifactLocator, parse_write_dir};
use crate::metrics::CleanerMetrics;
use crate::policy::{PolicyError, TimeoutPolicy};
use crate::reconciler::{PassReport, ReconcileError, Reconciler};

/// A table whose pass failed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFailure {
    pub table: TableName,
    pub error: String,
    /// The table was halted because of this failure.
    pub fatal: bool,
}

/// Outcome of one scheduler tick.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Successful passes, sorted by table.
    pub passes: Vec<PassReport>,
    pub failures: Vec<TableFailure>,
    /// Tables with pending writes that were skipped because they are halted.
    pub halted: Vec<TableName>,
}

impl SweepReport {
    pub fn pass(&self, table: &TableName) -> Option<&PassReport> {
        self.passes.iter().find(|pass| &pass.table == table)
    }
}

pub struct CleanerScheduler {
    config: CleanerConfig,
    store: Arc<dyn WriteRecordStore>,
    locator: Arc<dyn ArtifactLocator>,
    reconciler: Reconciler,
    clock: Arc<dyn TimeSource>,
    metrics: CleanerMetrics,
    halted: Mutex<BTreeSet<TableName>>,
}

impl CleanerScheduler {
    pub fn new(
        config: CleanerConfig,
        store: Arc<dyn WriteRecordStore>,
        locator: Arc<dyn ArtifactLocator>,
        clock: Arc<dyn TimeSource>,
    ) -> Result<Self, PolicyError> {
        let policy = TimeoutPolicy::try_from(&config)?;
        let metrics = CleanerMetrics::new();
        let reconciler = Reconciler::new(store.clone(), locator.clone(), policy, metrics.clone());
        Ok(Self {
            config,
            store,
            locator,
            reconciler,
            clock,
            metrics,
            halted: Mutex::default(),
        })
    }

    pub fn metrics(&self) -> &CleanerMetrics {
        &self.metrics
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    fn halted_set(&self) -> MutexGuard<'_, BTreeSet<TableName>> {
        self.halted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn halted_tables(&self) -> Vec<TableName> {
        self.halted_set().iter().cloned().collect()
    }

    /// Let a halted table be reconciled again. Returns whether it was halted.
    pub fn resume_table(&self, table: &TableName) -> bool {
        let resumed = self.halted_set().remove(table);
        if resumed {
            tracing::info!(table = %table, "Resumed halted table");
        }
        resumed
    }

    /// Run one pass for every table with pending writes.
    ///
    /// Only failing to list the tables is an error; per-table failures are
    /// reported in the returned [`SweepReport`].
    pub async fn run_one_iteration(&self) -> Result<SweepReport, StoreError> {
        let now = self.clock.now();
        let tables = self.store.list_tables_with_pending_writes().await?;

        let mut sweep = SweepReport::default();
        let mut runnable = Vec::with_capacity(tables.len());
        {
            let halted = self.halted_set();
            for table in tables {
                if halted.contains(&table) {
                    sweep.halted.push(table);
                } else {
                    runnable.push(table);
                }
            }
        }

        tracing::debug!(
            tables = runnable.len(),
            halted = sweep.halted.len(),
            now = %now,
            "Starting cleaner sweep"
        );

        let mut results: Vec<(TableName, Result<PassReport, ReconcileError>)> =
            futures::stream::iter(runnable)
                .map(|table| async move {
                    let result = self.reconcile_table(&table, now).await;
                    (table, result)
                })
                .buffer_unordered(self.config.max_concurrent_tables.max(1))
                .collect()
                .await;
        results.sort_by(|a, b| a.0.cmp(&b.0));

        for (table, result) in results {
            match result {
                Ok(report) => sweep.passes.push(report),
                Err(e) => sweep.failures.push(self.handle_failure(table, e)),
            }
        }
        Ok(sweep)
    }

    fn handle_failure(&self, table: TableName, error: ReconcileError) -> TableFailure {
        let fatal = error.is_fatal();
        if fatal {
            tracing::error!(
                table = %table,
                error = %error,
                "Invariant violated, halting cleaner for table"
            );
            self.halted_set().insert(table.clone());
            self.metrics.record_table_halted();
        } else {
            tracing::warn!(
                table = %table,
                error = %error,
                "Reconciliation pass failed, will retry next tick"
            );
            match error {
                ReconcileError::TimedOut { .. } => self.metrics.record_pass_timeout(),
                ReconcileError::Store { .. } => self.metrics.record_pass_failure(),
            }
        }
        TableFailure {
            table,
            error: error.to_string(),
            fatal,
        }
    }

    /// One pass over `table`, bounded by a timeout that grows with the
    /// number of pending writes.
    async fn reconcile_table(
        &self,
        table: &TableName,
        now: DateTime<Utc>,
    ) -> Result<PassReport, ReconcileError> {
        let state = self
            .store
            .get_table_state(table)
            .await
            .map_err(ReconcileError::store(table))?;
        let timeout = self.config.pass_timeout(state.pending_count());

        let report =
            match tokio::time::timeout(timeout, self.reconciler.run_one_pass(table, now)).await {
                Ok(result) => result?,
                Err(_) => {
                    return Err(ReconcileError::TimedOut {
                        table: table.clone(),
                        timeout,
                    });
                }
            };

        if self.config.report_unaccounted_artifacts {
            self.report_unaccounted(table).await;
        }
        Ok(report)
    }

    /// Log artifact directories no allocated write accounts for.
    async fn report_unaccounted(&self, table: &TableName) {
        let state = match self.store.get_table_state(table).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Could not read table state");
                return;
            }
        };
        let candidates = match self
            .locator
            .list_unaccounted(table, state.next_write_id)
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(table = %table, error = %e, "Could not list artifact directories");
                return;
            }
        };
        if candidates.is_empty() {
            return;
        }

        // Writers may have allocated more ids while the listing ran
        let next_write_id = match self.store.get_table_state(table).await {
            Ok(latest) => latest.next_write_id,
            Err(_) => state.next_write_id,
        };
        for dir in candidates {
            let name = dir.rsplit('/').next().unwrap_or(dir.as_str());
            if matches!(parse_write_dir(name), Some(Ok(id)) if id < next_write_id) {
                continue;
            }
            tracing::warn!(
                table = %table,
                directory = %dir,
                "Artifact directory is not accounted for by any allocated write"
            );
        }
    }

    /// Sweep every poll interval until `shutdown` fires.
    ///
    /// A sweep in flight when shutdown arrives is dropped; passes are
    /// idempotent, so the next start resumes where it stopped.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval = ?self.config.poll_interval,
            max_concurrent_tables = self.config.max_concurrent_tables,
            "Cleaner started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.run_one_iteration() => match result {
                    Ok(sweep) => {
                        if !sweep.failures.is_empty() || sweep.passes.iter().any(|p| !p.is_noop()) {
                            self.metrics.summary().log();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to list tables with pending writes");
                    }
                },
            }
        }

        self.metrics.summary().log();
        tracing::info!("Cleaner stopped");
    }
}
