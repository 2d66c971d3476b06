//! One reconciliation pass over a single table.
//!
//! A pass walks every allocated id above the watermark in increasing order:
//!
//! 1. Timed-out open writes are aborted, and unrecorded ids old enough to
//!    belong to a dead writer get an aborted record. Both happen through
//!    conditional store operations, so a writer that commits concurrently
//!    wins and the id is re-read instead of overwritten.
//! 2. Aborted writes whose artifacts are still present get them deleted.
//!    The deletion flag is only persisted after the locator confirms it.
//! 3. The watermark moves over the longest run of resolved ids directly
//!    above it, and the records of folded writes are purged.
//!
//! Failures part-way through leave the store consistent; the next pass
//! picks up where this one stopped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::writes::{
    StoreError, TableName, TableWriteState, WriteId, WriteRecord, WriteRecordStore, WriteState,
};

use crate::locator::{ArtifactLocator, DeletionOutcome};
use crate::metrics::CleanerMetrics;
use crate::policy::{TimeoutPolicy, WriteStatus};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("write-record store failed while reconciling {table}: {source}")]
    Store {
        table: TableName,
        #[source]
        source: StoreError,
    },

    #[error("reconciliation pass for {table} did not finish within {timeout:?}")]
    TimedOut { table: TableName, timeout: Duration },
}

impl ReconcileError {
    pub(crate) fn store(table: &TableName) -> impl FnOnce(StoreError) -> ReconcileError + '_ {
        move |source| ReconcileError::Store {
            table: table.clone(),
            source,
        }
    }

    /// Errors after which the table must not be reconciled again until an
    /// operator looks at it.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReconcileError::Store { source, .. } => source.is_invariant_violation(),
            ReconcileError::TimedOut { .. } => false,
        }
    }

    pub fn table(&self) -> &TableName {
        match self {
            ReconcileError::Store { table, .. } | ReconcileError::TimedOut { table, .. } => table,
        }
    }
}

/// Outcome of one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub table: TableName,
    pub previous_watermark: i64,
    pub new_watermark: i64,
    /// Writes this pass moved into the aborted state.
    pub aborted_ids: BTreeSet<WriteId>,
    /// Writes a concurrent writer resolved before the abort landed.
    pub skipped_ids: BTreeSet<WriteId>,
    pub deleted_ids: BTreeSet<WriteId>,
    /// Writes whose artifact deletion failed, with the reason.
    pub failed_deletions: BTreeMap<WriteId, String>,
    pub purged_ids: Vec<WriteId>,
}

impl PassReport {
    fn new(table: &TableName, state: &TableWriteState) -> Self {
        Self {
            table: table.clone(),
            previous_watermark: state.watermark,
            new_watermark: state.watermark,
            aborted_ids: BTreeSet::new(),
            skipped_ids: BTreeSet::new(),
            deleted_ids: BTreeSet::new(),
            failed_deletions: BTreeMap::new(),
            purged_ids: Vec::new(),
        }
    }

    pub fn watermark_advanced(&self) -> bool {
        self.new_watermark > self.previous_watermark
    }

    /// Whether the pass changed anything at all.
    pub fn is_noop(&self) -> bool {
        self.aborted_ids.is_empty()
            && self.deleted_ids.is_empty()
            && self.failed_deletions.is_empty()
            && !self.watermark_advanced()
    }
}

/// Runs reconciliation passes for any table of a store.
pub struct Reconciler {
    store: Arc<dyn WriteRecordStore>,
    locator: Arc<dyn ArtifactLocator>,
    policy: TimeoutPolicy,
    metrics: CleanerMetrics,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn WriteRecordStore>,
        locator: Arc<dyn ArtifactLocator>,
        policy: TimeoutPolicy,
        metrics: CleanerMetrics,
    ) -> Self {
        Self {
            store,
            locator,
            policy,
            metrics,
        }
    }

    /// Run one full pass over `table` as of `now`.
    pub async fn run_one_pass(
        &self,
        table: &TableName,
        now: DateTime<Utc>,
    ) -> Result<PassReport, ReconcileError> {
        let state = self
            .store
            .get_table_state(table)
            .await
            .map_err(ReconcileError::store(table))?;
        let mut report = PassReport::new(table, &state);
        if !state.has_pending() {
            return Ok(report);
        }

        let mut statuses = self.load_statuses(table, &state).await?;

        self.abort_timed_out(table, &mut statuses, now, &mut report)
            .await?;
        self.delete_aborted_artifacts(table, &mut statuses, &mut report)
            .await?;
        self.fold(table, &state, &statuses, now, &mut report).await?;

        self.metrics.record_pass(&report);
        if !report.is_noop() {
            tracing::info!(
                table = %table,
                aborted = report.aborted_ids.len(),
                deleted = report.deleted_ids.len(),
                failed_deletions = report.failed_deletions.len(),
                watermark = report.new_watermark,
                previous_watermark = report.previous_watermark,
                "Reconciliation pass finished"
            );
        }
        Ok(report)
    }

    /// Status of every allocated id above the watermark, in id order, with
    /// the creation time bounding each unrecorded id.
    async fn load_statuses(
        &self,
        table: &TableName,
        state: &TableWriteState,
    ) -> Result<Vec<PendingWrite>, ReconcileError> {
        let pending = usize::try_from(state.pending_count()).unwrap_or(usize::MAX);
        let records: BTreeMap<WriteId, WriteRecord> = self
            .store
            .list_write_records(table, state.watermark, pending)
            .await
            .map_err(ReconcileError::store(table))?
            .into_iter()
            .filter(|record| state.is_allocated(record.id))
            .map(|record| (record.id, record))
            .collect();

        let mut writes: Vec<PendingWrite> = (state.first_pending()..state.next_write_id)
            .map(|id| {
                let record = records.get(&id);
                PendingWrite {
                    id,
                    status: WriteStatus::of(record),
                    created_at: record.map(|r| r.created_at),
                    bound: None,
                }
            })
            .collect();

        // Nearest recorded write above each unrecorded id
        let mut next_created = None;
        for write in writes.iter_mut().rev() {
            match write.created_at {
                Some(created_at) => next_created = Some(created_at),
                None => write.bound = next_created,
            }
        }

        Ok(writes)
    }

    async fn abort_timed_out(
        &self,
        table: &TableName,
        writes: &mut [PendingWrite],
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), ReconcileError> {
        for write in writes.iter_mut() {
            if !self.policy.should_abort(&write.status, write.bound, now) {
                continue;
            }

            let applied = match (write.status, write.bound) {
                (WriteStatus::Open { .. }, _) => self
                    .store
                    .set_write_state(
                        table,
                        write.id,
                        Some(WriteState::Open),
                        WriteState::Aborted,
                        now,
                    )
                    .await
                    .map_err(ReconcileError::store(table))?,
                (WriteStatus::Unrecorded, Some(bound)) => {
                    let record = WriteRecord {
                        id: write.id,
                        state: WriteState::Aborted,
                        created_at: bound,
                        aborted_at: Some(now),
                        artifacts_deleted: false,
                    };
                    self.store
                        .insert_write_record(table, &record)
                        .await
                        .map_err(ReconcileError::store(table))?
                }
                _ => continue,
            };

            if applied {
                tracing::info!(
                    table = %table,
                    write_id = write.id,
                    recorded = matches!(write.status, WriteStatus::Open { .. }),
                    "Aborted timed-out write"
                );
                write.status = WriteStatus::Aborted {
                    aborted_at: now,
                    artifacts_deleted: false,
                };
                report.aborted_ids.insert(write.id);
            } else {
                let current = self
                    .store
                    .get_write_record(table, write.id)
                    .await
                    .map_err(ReconcileError::store(table))?;
                tracing::debug!(
                    table = %table,
                    write_id = write.id,
                    state = ?current.as_ref().map(|r| r.state),
                    "Write changed before it could be aborted"
                );
                write.status = WriteStatus::of(current.as_ref());
                report.skipped_ids.insert(write.id);
            }
        }
        Ok(())
    }

    async fn delete_aborted_artifacts(
        &self,
        table: &TableName,
        writes: &mut [PendingWrite],
        report: &mut PassReport,
    ) -> Result<(), ReconcileError> {
        for write in writes.iter_mut() {
            let WriteStatus::Aborted {
                aborted_at,
                artifacts_deleted: false,
            } = write.status
            else {
                continue;
            };

            match self.locator.delete_artifacts(table, write.id).await {
                DeletionOutcome::Deleted { .. } => {
                    self.store
                        .mark_artifacts_deleted(table, write.id)
                        .await
                        .map_err(ReconcileError::store(table))?;
                    write.status = WriteStatus::Aborted {
                        aborted_at,
                        artifacts_deleted: true,
                    };
                    report.deleted_ids.insert(write.id);
                }
                DeletionOutcome::Failed { reason } => {
                    tracing::warn!(
                        table = %table,
                        write_id = write.id,
                        reason = %reason,
                        "Failed to delete artifacts of aborted write, will retry"
                    );
                    report.failed_deletions.insert(write.id, reason);
                }
            }
        }
        Ok(())
    }

    async fn fold(
        &self,
        table: &TableName,
        state: &TableWriteState,
        writes: &[PendingWrite],
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<(), ReconcileError> {
        let folded: Vec<WriteId> = writes
            .iter()
            .take_while(|write| self.policy.is_foldable(&write.status, now))
            .map(|write| write.id)
            .collect();
        let Some(&last) = folded.last() else {
            return Ok(());
        };

        let watermark = last as i64;
        self.store
            .set_watermark(table, watermark)
            .await
            .map_err(ReconcileError::store(table))?;
        report.new_watermark = watermark;
        tracing::debug!(
            table = %table,
            from = state.watermark,
            to = watermark,
            "Advanced watermark"
        );

        for id in folded {
            self.store
                .purge_write_record(table, id)
                .await
                .map_err(ReconcileError::store(table))?;
            report.purged_ids.push(id);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingWrite {
    id: WriteId,
    status: WriteStatus,
    created_at: Option<DateTime<Utc>>,
    /// Creation time of the nearest recorded write above an unrecorded one.
    bound: Option<DateTime<Utc>>,
}
