use std::collections::BTreeSet;

use super::{StoreResult, TableName, WriteId, WriteRecordStore, WriteState};

/// Reader view of which writes of a table are visible.
///
/// Everything at or below the watermark is resolved: committed writes are
/// visible and aborted ones have no artifacts left. Above the watermark only
/// the explicitly committed ids are visible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidWriteIds {
    pub watermark: i64,
    pub next_write_id: WriteId,
    pub committed_above_watermark: BTreeSet<WriteId>,
}

impl ValidWriteIds {
    /// Snapshot the visible writes of `table`.
    pub async fn load(store: &dyn WriteRecordStore, table: &TableName) -> StoreResult<Self> {
        let state = store.get_table_state(table).await?;
        let pending = usize::try_from(state.pending_count()).unwrap_or(usize::MAX);
        let committed = store
            .list_write_ids(table, state.watermark, pending, Some(WriteState::Committed))
            .await?;

        Ok(Self {
            watermark: state.watermark,
            next_write_id: state.next_write_id,
            committed_above_watermark: committed.into_iter().collect(),
        })
    }

    pub fn is_visible(&self, id: WriteId) -> bool {
        if id >= self.next_write_id {
            return false;
        }
        (id as i64) <= self.watermark || self.committed_above_watermark.contains(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writes::{InMemoryWriteStore, WriteRecord};
    use chrono::DateTime;

    #[tokio::test]
    async fn test_visibility_follows_watermark_and_exceptions() {
        let store = InMemoryWriteStore::new();
        let table = TableName::new("db1", "table1");
        store.register_table(&table).await.unwrap();

        let at = DateTime::from_timestamp_millis(0).unwrap();
        let states = [
            WriteState::Committed,
            WriteState::Committed,
            WriteState::Open,
            WriteState::Committed,
            WriteState::Aborted,
        ];
        for (id, state) in states.into_iter().enumerate() {
            store.allocate_write_id(&table).await.unwrap();
            store
                .insert_write_record(&table, &WriteRecord::new(id as WriteId, state, at))
                .await
                .unwrap();
        }
        store.set_watermark(&table, 1).await.unwrap();

        let valid = ValidWriteIds::load(&store, &table).await.unwrap();
        assert_eq!(valid.watermark, 1);
        assert_eq!(valid.committed_above_watermark, BTreeSet::from([3]));

        assert!(valid.is_visible(0));
        assert!(valid.is_visible(1));
        assert!(!valid.is_visible(2));
        assert!(valid.is_visible(3));
        assert!(!valid.is_visible(4));
        assert!(!valid.is_visible(5));
    }
}
