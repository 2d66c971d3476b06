//! File-backed SQLite write-store tests.
//!
//! The in-memory variants live next to the store; these cover what only a
//! real database file shows: durability across pools and concurrent writers.

use std::collections::BTreeSet;

use chrono::DateTime;
use common::writes::{
    SqlWriteStore, StoreError, TableName, WriteRecord, WriteRecordStore, WriteState, begin_write,
};
use tempfile::TempDir;

fn dsn(dir: &TempDir) -> String {
    format!("sqlite://{}", dir.path().join("writes.db").display())
}

#[tokio::test]
async fn test_state_survives_reconnect() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let table = TableName::new("db1", "table1");
    let at = DateTime::from_timestamp_millis(31).expect("valid timestamp");

    {
        let store = SqlWriteStore::connect(&dsn(&dir))
            .await
            .expect("Failed to open store");
        store
            .register_table(&table)
            .await
            .expect("Failed to register table");
        for state in [WriteState::Committed, WriteState::Aborted] {
            let id = store
                .allocate_write_id(&table)
                .await
                .expect("Failed to allocate");
            store
                .insert_write_record(&table, &WriteRecord::new(id, state, at))
                .await
                .expect("Failed to insert record");
        }
        store
            .mark_artifacts_deleted(&table, 1)
            .await
            .expect("Failed to mark deleted");
        store
            .set_watermark(&table, 0)
            .await
            .expect("Failed to set watermark");
    }

    let store = SqlWriteStore::connect(&dsn(&dir))
        .await
        .expect("Failed to reopen store");
    let state = store
        .get_table_state(&table)
        .await
        .expect("Failed to read table state");
    assert_eq!(state.next_write_id, 2);
    assert_eq!(state.watermark, 0);

    let aborted = store
        .get_write_record(&table, 1)
        .await
        .expect("Failed to read record")
        .expect("record should exist");
    assert_eq!(aborted.state, WriteState::Aborted);
    assert_eq!(aborted.aborted_at, Some(at));
    assert!(aborted.artifacts_deleted);

    // Registering again keeps the existing counters
    store
        .register_table(&table)
        .await
        .expect("Failed to re-register table");
    assert_eq!(
        store.get_table_state(&table).await.unwrap().next_write_id,
        2
    );
}

#[tokio::test]
async fn test_concurrent_allocation_from_two_pools() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let table = TableName::new("db1", "table1");
    let first = SqlWriteStore::connect(&dsn(&dir))
        .await
        .expect("Failed to open first store");
    let second = SqlWriteStore::connect(&dsn(&dir))
        .await
        .expect("Failed to open second store");
    first
        .register_table(&table)
        .await
        .expect("Failed to register table");

    let at = DateTime::UNIX_EPOCH;
    let (a, b) = tokio::join!(
        async {
            let mut ids = Vec::new();
            for _ in 0..10 {
                ids.push(begin_write(&first, &table, at).await.expect("first writer"));
            }
            ids
        },
        async {
            let mut ids = Vec::new();
            for _ in 0..10 {
                ids.push(begin_write(&second, &table, at).await.expect("second writer"));
            }
            ids
        }
    );

    let all: BTreeSet<_> = a.into_iter().chain(b).collect();
    assert_eq!(all, (0..20).collect::<BTreeSet<_>>());
    assert!(
        first
            .list_tables_with_pending_writes()
            .await
            .unwrap()
            .contains(&table)
    );
}

#[tokio::test]
async fn test_watermark_regression_is_rejected_on_disk() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let table = TableName::new("db1", "table1");
    let store = SqlWriteStore::connect(&dsn(&dir))
        .await
        .expect("Failed to open store");
    store.register_table(&table).await.unwrap();
    for _ in 0..3 {
        store.allocate_write_id(&table).await.unwrap();
    }
    store.set_watermark(&table, 2).await.unwrap();

    let err = store.set_watermark(&table, 1).await.unwrap_err();
    assert!(matches!(err, StoreError::WatermarkRegression { .. }));
    assert!(err.is_invariant_violation());
    assert_eq!(store.get_watermark(&table).await.unwrap(), 2);
}
