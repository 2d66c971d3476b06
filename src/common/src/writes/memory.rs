use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{
    StoreError, StoreResult, TableName, TableWriteState, WriteId, WriteRecord, WriteRecordStore,
    WriteState,
};

#[derive(Debug, Default)]
struct TableEntry {
    state: TableWriteState,
    writes: BTreeMap<WriteId, WriteRecord>,
}

/// Process-local write-record store.
///
/// Cloning yields a handle to the same underlying tables.
#[derive(Debug, Clone, Default)]
pub struct InMemoryWriteStore {
    tables: Arc<Mutex<HashMap<TableName, TableEntry>>>,
}

impl InMemoryWriteStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn entry_mut<'a>(
    tables: &'a mut HashMap<TableName, TableEntry>,
    table: &TableName,
) -> StoreResult<&'a mut TableEntry> {
    tables
        .get_mut(table)
        .ok_or_else(|| StoreError::UnknownTable(table.clone()))
}

#[async_trait]
impl WriteRecordStore for InMemoryWriteStore {
    async fn register_table(&self, table: &TableName) -> StoreResult<()> {
        self.tables.lock().await.entry(table.clone()).or_default();
        Ok(())
    }

    async fn list_tables_with_pending_writes(&self) -> StoreResult<Vec<TableName>> {
        let tables = self.tables.lock().await;
        let mut pending: Vec<TableName> = tables
            .iter()
            .filter(|(_, entry)| entry.state.has_pending())
            .map(|(name, _)| name.clone())
            .collect();
        pending.sort();
        Ok(pending)
    }

    async fn get_table_state(&self, table: &TableName) -> StoreResult<TableWriteState> {
        let mut tables = self.tables.lock().await;
        Ok(entry_mut(&mut tables, table)?.state)
    }

    async fn allocate_write_id(&self, table: &TableName) -> StoreResult<WriteId> {
        let mut tables = self.tables.lock().await;
        let entry = entry_mut(&mut tables, table)?;
        let id = entry.state.next_write_id;
        entry.state.next_write_id += 1;
        Ok(id)
    }

    async fn insert_write_record(
        &self,
        table: &TableName,
        record: &WriteRecord,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let entry = entry_mut(&mut tables, table)?;
        entry.state.check_mutable(table, record.id)?;
        if entry.writes.contains_key(&record.id) {
            return Ok(false);
        }
        entry.writes.insert(record.id, record.clone());
        Ok(true)
    }

    async fn get_write_record(
        &self,
        table: &TableName,
        id: WriteId,
    ) -> StoreResult<Option<WriteRecord>> {
        let mut tables = self.tables.lock().await;
        Ok(entry_mut(&mut tables, table)?.writes.get(&id).cloned())
    }

    async fn list_write_records(
        &self,
        table: &TableName,
        after: i64,
        limit: usize,
    ) -> StoreResult<Vec<WriteRecord>> {
        let mut tables = self.tables.lock().await;
        let entry = entry_mut(&mut tables, table)?;
        let start = (after + 1).max(0) as WriteId;
        Ok(entry
            .writes
            .range(start..)
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn list_write_ids(
        &self,
        table: &TableName,
        after: i64,
        limit: usize,
        state: Option<WriteState>,
    ) -> StoreResult<Vec<WriteId>> {
        let mut tables = self.tables.lock().await;
        let entry = entry_mut(&mut tables, table)?;
        let start = (after + 1).max(0) as WriteId;
        Ok(entry
            .writes
            .range(start..)
            .filter(|(_, record)| state.is_none_or(|s| record.state == s))
            .take(limit)
            .map(|(id, _)| *id)
            .collect())
    }

    async fn set_write_state(
        &self,
        table: &TableName,
        id: WriteId,
        expected: Option<WriteState>,
        new_state: WriteState,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.lock().await;
        let entry = entry_mut(&mut tables, table)?;
        entry.state.check_mutable(table, id)?;

        let Some(record) = entry.writes.get_mut(&id) else {
            return Ok(false);
        };
        if expected.is_some_and(|s| s != record.state) {
            return Ok(false);
        }
        if new_state == WriteState::Aborted && record.state != WriteState::Aborted {
            record.aborted_at = Some(at);
        }
        record.state = new_state;
        Ok(true)
    }

    async fn mark_artifacts_deleted(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(record) = entry_mut(&mut tables, table)?.writes.get_mut(&id) {
            record.artifacts_deleted = true;
        }
        Ok(())
    }

    async fn set_watermark(&self, table: &TableName, watermark: i64) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        let entry = entry_mut(&mut tables, table)?;
        entry.state.check_watermark(table, watermark)?;
        entry.state.watermark = watermark;
        Ok(())
    }

    async fn purge_write_record(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        let mut tables = self.tables.lock().await;
        entry_mut(&mut tables, table)?.writes.remove(&id);
        Ok(())
    }
}
