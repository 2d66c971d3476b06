//! Test doubles for exercising the cleaner against failures and races.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::writes::{
    InMemoryWriteStore, StoreResult, TableName, TableWriteState, WriteId, WriteRecord,
    WriteRecordStore, WriteState,
};

use crate::locator::{ArtifactLocator, DeletionOutcome};

#[derive(Debug, Default)]
struct LocatorState {
    deleted: Vec<WriteId>,
    failing: HashSet<WriteId>,
}

/// Locator that records deletions and fails on demand.
///
/// Without an inner locator every deletion succeeds without touching storage.
#[derive(Default)]
pub struct RecordingLocator {
    inner: Option<Arc<dyn ArtifactLocator>>,
    state: Mutex<LocatorState>,
}

impl RecordingLocator {
    pub fn wrapping(inner: Arc<dyn ArtifactLocator>) -> Self {
        Self {
            inner: Some(inner),
            state: Mutex::default(),
        }
    }

    fn state(&self) -> MutexGuard<'_, LocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every deletion of `id` fail until cleared.
    pub fn fail_for(&self, id: WriteId) {
        self.state().failing.insert(id);
    }

    pub fn clear_failures(&self) {
        self.state().failing.clear();
    }

    /// Ids whose deletion succeeded, in call order.
    pub fn deleted(&self) -> Vec<WriteId> {
        self.state().deleted.clone()
    }
}

#[async_trait]
impl ArtifactLocator for RecordingLocator {
    async fn delete_artifacts(&self, table: &TableName, id: WriteId) -> DeletionOutcome {
        if self.state().failing.contains(&id) {
            return DeletionOutcome::Failed {
                reason: format!("injected failure for write {id}"),
            };
        }
        let outcome = match &self.inner {
            Some(inner) => inner.delete_artifacts(table, id).await,
            None => DeletionOutcome::Deleted { objects: 0 },
        };
        if outcome.is_deleted() {
            self.state().deleted.push(id);
        }
        outcome
    }

    async fn list_unaccounted(
        &self,
        table: &TableName,
        next_write_id: WriteId,
    ) -> anyhow::Result<Vec<String>> {
        match &self.inner {
            Some(inner) => inner.list_unaccounted(table, next_write_id).await,
            None => Ok(Vec::new()),
        }
    }
}

/// Store wrapper that lets a writer act right before the cleaner's abort
/// lands, reproducing the races between writers and timeouts.
pub struct RacingStore {
    inner: InMemoryWriteStore,
    commit_before_abort: Mutex<HashSet<WriteId>>,
    open_before_abort: Mutex<HashSet<WriteId>>,
    injected: AtomicUsize,
}

fn take(ids: &Mutex<HashSet<WriteId>>, id: WriteId) -> bool {
    ids.lock().unwrap_or_else(PoisonError::into_inner).remove(&id)
}

impl RacingStore {
    pub fn new(inner: InMemoryWriteStore) -> Self {
        Self {
            inner,
            commit_before_abort: Mutex::default(),
            open_before_abort: Mutex::default(),
            injected: AtomicUsize::new(0),
        }
    }

    pub fn commit_before_abort(&self, id: WriteId) {
        self.commit_before_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    /// Record `id` as open right before the cleaner records it as aborted,
    /// as a slow writer whose id the cleaner found unrecorded would.
    pub fn open_before_abort(&self, id: WriteId) {
        self.open_before_abort
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    /// Number of writer actions injected so far.
    pub fn commits_injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WriteRecordStore for RacingStore {
    async fn register_table(&self, table: &TableName) -> StoreResult<()> {
        self.inner.register_table(table).await
    }

    async fn list_tables_with_pending_writes(&self) -> StoreResult<Vec<TableName>> {
        self.inner.list_tables_with_pending_writes().await
    }

    async fn get_table_state(&self, table: &TableName) -> StoreResult<TableWriteState> {
        self.inner.get_table_state(table).await
    }

    async fn allocate_write_id(&self, table: &TableName) -> StoreResult<WriteId> {
        self.inner.allocate_write_id(table).await
    }

    async fn insert_write_record(
        &self,
        table: &TableName,
        record: &WriteRecord,
    ) -> StoreResult<bool> {
        if record.state == WriteState::Aborted && take(&self.open_before_abort, record.id) {
            let open = WriteRecord::open(record.id, record.created_at);
            self.inner.insert_write_record(table, &open).await?;
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.insert_write_record(table, record).await
    }

    async fn get_write_record(
        &self,
        table: &TableName,
        id: WriteId,
    ) -> StoreResult<Option<WriteRecord>> {
        self.inner.get_write_record(table, id).await
    }

    async fn list_write_records(
        &self,
        table: &TableName,
        after: i64,
        limit: usize,
    ) -> StoreResult<Vec<WriteRecord>> {
        self.inner.list_write_records(table, after, limit).await
    }

    async fn list_write_ids(
        &self,
        table: &TableName,
        after: i64,
        limit: usize,
        state: Option<WriteState>,
    ) -> StoreResult<Vec<WriteId>> {
        self.inner.list_write_ids(table, after, limit, state).await
    }

    async fn set_write_state(
        &self,
        table: &TableName,
        id: WriteId,
        expected: Option<WriteState>,
        new_state: WriteState,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        if new_state == WriteState::Aborted && take(&self.commit_before_abort, id) {
            self.inner
                .set_write_state(table, id, Some(WriteState::Open), WriteState::Committed, at)
                .await?;
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        self.inner
            .set_write_state(table, id, expected, new_state, at)
            .await
    }

    async fn mark_artifacts_deleted(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        self.inner.mark_artifacts_deleted(table, id).await
    }

    async fn set_watermark(&self, table: &TableName, watermark: i64) -> StoreResult<()> {
        self.inner.set_watermark(table, watermark).await
    }

    async fn purge_write_record(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        self.inner.purge_write_record(table, id).await
    }
}
