//! Writer-side helpers for the write lifecycle.

use chrono::{DateTime, Utc};

use super::{StoreError, StoreResult, TableName, WriteId, WriteRecord, WriteRecordStore, WriteState};

/// Allocate a write id and record it as open.
///
/// The cleaner may record a freshly allocated id as aborted before the
/// writer's own record lands. The writer must not produce artifacts for
/// such an id, so that case fails with [`StoreError::WriteTaken`].
pub async fn begin_write(
    store: &dyn WriteRecordStore,
    table: &TableName,
    now: DateTime<Utc>,
) -> StoreResult<WriteId> {
    let id = store.allocate_write_id(table).await?;
    let inserted = store
        .insert_write_record(table, &WriteRecord::open(id, now))
        .await?;
    if !inserted {
        let existing = store.get_write_record(table, id).await?;
        match existing.map(|record| record.state) {
            Some(WriteState::Open) => {}
            Some(state) => {
                log::warn!("Write {id} on {table} was recorded as {state} before it began");
                return Err(StoreError::WriteTaken {
                    table: table.clone(),
                    id,
                    state,
                });
            }
            None => {
                return Err(StoreError::Corrupt(format!(
                    "write {id} of {table} vanished while it was being opened"
                )));
            }
        }
    }
    log::debug!("Began write {id} on {table}");
    Ok(id)
}

/// Commit an open write.
///
/// Returns `false` when the write is no longer open, e.g. because the
/// cleaner aborted it after a timeout. The writer must then treat its
/// artifacts as lost.
pub async fn commit_write(
    store: &dyn WriteRecordStore,
    table: &TableName,
    id: WriteId,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    let committed = store
        .set_write_state(table, id, Some(WriteState::Open), WriteState::Committed, now)
        .await?;
    if !committed {
        log::warn!("Write {id} on {table} could not be committed, it is no longer open");
    }
    Ok(committed)
}

/// Abort an open write on behalf of its writer.
pub async fn abort_write(
    store: &dyn WriteRecordStore,
    table: &TableName,
    id: WriteId,
    now: DateTime<Utc>,
) -> StoreResult<bool> {
    store
        .set_write_state(table, id, Some(WriteState::Open), WriteState::Aborted, now)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writes::InMemoryWriteStore;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[tokio::test]
    async fn test_begin_then_commit() {
        let store = InMemoryWriteStore::new();
        let table = TableName::new("db", "t");
        store.register_table(&table).await.unwrap();

        let id = begin_write(&store, &table, ts(3)).await.unwrap();
        assert_eq!(id, 0);
        let record = store.get_write_record(&table, id).await.unwrap().unwrap();
        assert_eq!(record.state, WriteState::Open);
        assert_eq!(record.created_at, ts(3));

        assert!(commit_write(&store, &table, id, ts(4)).await.unwrap());
        assert!(!commit_write(&store, &table, id, ts(5)).await.unwrap());
    }

    /// Store whose cleaner records every allocated id as aborted before the
    /// writer's insert reaches it.
    struct PreemptedStore(InMemoryWriteStore);

    #[async_trait::async_trait]
    impl WriteRecordStore for PreemptedStore {
        async fn register_table(&self, table: &TableName) -> StoreResult<()> {
            self.0.register_table(table).await
        }
        async fn list_tables_with_pending_writes(&self) -> StoreResult<Vec<TableName>> {
            self.0.list_tables_with_pending_writes().await
        }
        async fn get_table_state(
            &self,
            table: &TableName,
        ) -> StoreResult<crate::writes::TableWriteState> {
            self.0.get_table_state(table).await
        }
        async fn allocate_write_id(&self, table: &TableName) -> StoreResult<WriteId> {
            let id = self.0.allocate_write_id(table).await?;
            self.0
                .insert_write_record(table, &WriteRecord::new(id, WriteState::Aborted, ts(0)))
                .await?;
            Ok(id)
        }
        async fn insert_write_record(
            &self,
            table: &TableName,
            record: &WriteRecord,
        ) -> StoreResult<bool> {
            self.0.insert_write_record(table, record).await
        }
        async fn get_write_record(
            &self,
            table: &TableName,
            id: WriteId,
        ) -> StoreResult<Option<WriteRecord>> {
            self.0.get_write_record(table, id).await
        }
        async fn list_write_records(
            &self,
            table: &TableName,
            after: i64,
            limit: usize,
        ) -> StoreResult<Vec<WriteRecord>> {
            self.0.list_write_records(table, after, limit).await
        }
        async fn list_write_ids(
            &self,
            table: &TableName,
            after: i64,
            limit: usize,
            state: Option<WriteState>,
        ) -> StoreResult<Vec<WriteId>> {
            self.0.list_write_ids(table, after, limit, state).await
        }
        async fn set_write_state(
            &self,
            table: &TableName,
            id: WriteId,
            expected: Option<WriteState>,
            new_state: WriteState,
            at: DateTime<Utc>,
        ) -> StoreResult<bool> {
            self.0.set_write_state(table, id, expected, new_state, at).await
        }
        async fn mark_artifacts_deleted(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
            self.0.mark_artifacts_deleted(table, id).await
        }
        async fn set_watermark(&self, table: &TableName, watermark: i64) -> StoreResult<()> {
            self.0.set_watermark(table, watermark).await
        }
        async fn purge_write_record(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
            self.0.purge_write_record(table, id).await
        }
    }

    #[tokio::test]
    async fn test_begin_fails_when_cleaner_aborted_the_id_first() {
        let inner = InMemoryWriteStore::new();
        let store = PreemptedStore(inner.clone());
        let table = TableName::new("db", "t");
        store.register_table(&table).await.unwrap();

        let err = begin_write(&store, &table, ts(5)).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::WriteTaken {
                id: 0,
                state: WriteState::Aborted,
                ..
            }
        ));
        assert!(!err.is_invariant_violation());

        let record = inner.get_write_record(&table, 0).await.unwrap().unwrap();
        assert_eq!(record.state, WriteState::Aborted);
        assert!(!commit_write(&store, &table, 0, ts(6)).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_after_abort_is_refused() {
        let store = InMemoryWriteStore::new();
        let table = TableName::new("db", "t");
        store.register_table(&table).await.unwrap();

        let id = begin_write(&store, &table, ts(0)).await.unwrap();
        assert!(abort_write(&store, &table, id, ts(1)).await.unwrap());
        assert!(!commit_write(&store, &table, id, ts(2)).await.unwrap());

        let record = store.get_write_record(&table, id).await.unwrap().unwrap();
        assert_eq!(record.state, WriteState::Aborted);
        assert_eq!(record.aborted_at, Some(ts(1)));
    }
}
