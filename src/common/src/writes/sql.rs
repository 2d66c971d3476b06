use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{PgPool, Row, SqlitePool, query};

use super::{
    StoreError, StoreResult, TableName, TableWriteState, WriteId, WriteRecord, WriteRecordStore,
    WriteState,
};

const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS mm_tables (
    db_name TEXT NOT NULL,
    tbl_name TEXT NOT NULL,
    next_write_id BIGINT NOT NULL DEFAULT 0,
    watermark BIGINT NOT NULL DEFAULT -1,
    PRIMARY KEY (db_name, tbl_name)
)"#;

const CREATE_WRITES: &str = r#"
CREATE TABLE IF NOT EXISTS mm_writes (
    db_name TEXT NOT NULL,
    tbl_name TEXT NOT NULL,
    write_id BIGINT NOT NULL,
    state TEXT NOT NULL,
    created_at BIGINT NOT NULL,
    aborted_at BIGINT,
    artifacts_deleted BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (db_name, tbl_name, write_id)
)"#;

const WRITE_COLUMNS: &str = "write_id, state, created_at, aborted_at, artifacts_deleted";

/// Write-record store backed by SQLite or PostgreSQL.
///
/// Statements use `$N` placeholders, which both drivers accept, so each
/// operation is written once and dispatched per pool.
#[derive(Clone)]
pub enum SqlWriteStore {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Run the same body against whichever pool backs the store.
macro_rules! with_pool {
    ($store:expr, $pool:ident => $body:expr) => {
        match $store {
            SqlWriteStore::Postgres($pool) => $body,
            SqlWriteStore::Sqlite($pool) => $body,
        }
    };
}

fn db_id(id: WriteId) -> StoreResult<i64> {
    i64::try_from(id).map_err(|_| StoreError::Corrupt(format!("write id {id} out of range")))
}

fn write_id(raw: i64) -> StoreResult<WriteId> {
    WriteId::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative write id {raw}")))
}

fn timestamp(ms: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp {ms} out of range")))
}

fn limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn decode_record<R>(row: &R) -> StoreResult<WriteRecord>
where
    R: Row,
    for<'a> &'a str: sqlx::ColumnIndex<R>,
    i64: for<'r> sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<i64>: for<'r> sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    String: for<'r> sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    let code: String = row.try_get("state")?;
    let state = WriteState::from_code(&code)
        .ok_or_else(|| StoreError::Corrupt(format!("unknown write state '{code}'")))?;
    let aborted_at: Option<i64> = row.try_get("aborted_at")?;
    let deleted: i64 = row.try_get("artifacts_deleted")?;

    Ok(WriteRecord {
        id: write_id(row.try_get("write_id")?)?,
        state,
        created_at: timestamp(row.try_get("created_at")?)?,
        aborted_at: aborted_at.map(timestamp).transpose()?,
        artifacts_deleted: deleted != 0,
    })
}

impl SqlWriteStore {
    /// Connect to the store and initialize its schema.
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        log::info!("Connecting to write-record store with DSN: {dsn}");

        let store = if dsn.starts_with("sqlite:") {
            let connected = if dsn.contains(":memory:") {
                // Every connection to an in-memory database sees its own
                // database, so keep exactly one alive.
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect(dsn)
                    .await
            } else {
                // Add mode=rwc to create database file if it doesn't exist
                let dsn_with_create = if dsn.contains('?') {
                    if dsn.contains("mode=") {
                        dsn.to_string()
                    } else {
                        format!("{dsn}&mode=rwc")
                    }
                } else {
                    format!("{dsn}?mode=rwc")
                };
                SqlitePoolOptions::new().connect(&dsn_with_create).await
            };
            let pool = connected.map_err(|e| {
                log::error!("Failed to connect to SQLite database with DSN '{dsn}': {e}");
                e
            })?;
            SqlWriteStore::Sqlite(pool)
        } else {
            let pool = PgPoolOptions::new().connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            SqlWriteStore::Postgres(pool)
        };

        store.init().await.map_err(|e| {
            log::error!("Failed to initialize write-record schema: {e}");
            e
        })?;
        log::info!("Write-record schema initialized successfully");
        Ok(store)
    }

    async fn init(&self) -> StoreResult<()> {
        with_pool!(self, pool => {
            query(CREATE_TABLES).execute(pool).await?;
            query(CREATE_WRITES).execute(pool).await?;
        });
        Ok(())
    }

    async fn table_state(&self, table: &TableName) -> StoreResult<Option<TableWriteState>> {
        let stmt = r#"
        SELECT next_write_id, watermark FROM mm_tables
        WHERE db_name = $1 AND tbl_name = $2
        "#;
        let row = with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .fetch_optional(pool)
                .await?
                .map(|row| -> StoreResult<(i64, i64)> {
                    Ok((row.try_get("next_write_id")?, row.try_get("watermark")?))
                })
                .transpose()?
        });

        row.map(|(next_write_id, watermark)| {
            Ok(TableWriteState {
                next_write_id: write_id(next_write_id)?,
                watermark,
            })
        })
        .transpose()
    }
}

#[async_trait]
impl WriteRecordStore for SqlWriteStore {
    async fn register_table(&self, table: &TableName) -> StoreResult<()> {
        let stmt = r#"
        INSERT INTO mm_tables (db_name, tbl_name, next_write_id, watermark)
        VALUES ($1, $2, 0, -1)
        ON CONFLICT (db_name, tbl_name) DO NOTHING
        "#;
        with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .execute(pool)
                .await?;
        });
        Ok(())
    }

    async fn list_tables_with_pending_writes(&self) -> StoreResult<Vec<TableName>> {
        let stmt = r#"
        SELECT db_name, tbl_name FROM mm_tables
        WHERE watermark < next_write_id - 1
        ORDER BY db_name, tbl_name
        "#;
        with_pool!(self, pool => {
            let rows = query(stmt).fetch_all(pool).await?;
            let mut tables = Vec::with_capacity(rows.len());
            for row in rows {
                let database: String = row.try_get("db_name")?;
                let table: String = row.try_get("tbl_name")?;
                tables.push(TableName::new(database, table));
            }
            Ok(tables)
        })
    }

    async fn get_table_state(&self, table: &TableName) -> StoreResult<TableWriteState> {
        self.table_state(table)
            .await?
            .ok_or_else(|| StoreError::UnknownTable(table.clone()))
    }

    async fn allocate_write_id(&self, table: &TableName) -> StoreResult<WriteId> {
        let stmt = r#"
        UPDATE mm_tables SET next_write_id = next_write_id + 1
        WHERE db_name = $1 AND tbl_name = $2
        RETURNING next_write_id
        "#;
        let next: Option<i64> = with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .fetch_optional(pool)
                .await?
                .map(|row| row.try_get("next_write_id"))
                .transpose()?
        });

        let next = next.ok_or_else(|| StoreError::UnknownTable(table.clone()))?;
        write_id(next - 1)
    }

    async fn insert_write_record(
        &self,
        table: &TableName,
        record: &WriteRecord,
    ) -> StoreResult<bool> {
        self.get_table_state(table)
            .await?
            .check_mutable(table, record.id)?;

        let stmt = r#"
        INSERT INTO mm_writes
            (db_name, tbl_name, write_id, state, created_at, aborted_at, artifacts_deleted)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (db_name, tbl_name, write_id) DO NOTHING
        "#;
        let id = db_id(record.id)?;
        let created_at = record.created_at.timestamp_millis();
        let aborted_at = record.aborted_at.map(|at| at.timestamp_millis());
        let deleted = i64::from(record.artifacts_deleted);

        let inserted = with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(id)
                .bind(record.state.code())
                .bind(created_at)
                .bind(aborted_at)
                .bind(deleted)
                .execute(pool)
                .await?
                .rows_affected()
        });
        Ok(inserted == 1)
    }

    async fn get_write_record(
        &self,
        table: &TableName,
        id: WriteId,
    ) -> StoreResult<Option<WriteRecord>> {
        let stmt = format!(
            "SELECT {WRITE_COLUMNS} FROM mm_writes \
             WHERE db_name = $1 AND tbl_name = $2 AND write_id = $3"
        );
        let id = db_id(id)?;
        with_pool!(self, pool => {
            query(&stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(id)
                .fetch_optional(pool)
                .await?
                .map(|row| decode_record(&row))
                .transpose()
        })
    }

    async fn list_write_records(
        &self,
        table: &TableName,
        after: i64,
        max: usize,
    ) -> StoreResult<Vec<WriteRecord>> {
        let stmt = format!(
            "SELECT {WRITE_COLUMNS} FROM mm_writes \
             WHERE db_name = $1 AND tbl_name = $2 AND write_id > $3 \
             ORDER BY write_id LIMIT $4"
        );
        with_pool!(self, pool => {
            query(&stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(after)
                .bind(limit(max))
                .fetch_all(pool)
                .await?
                .iter()
                .map(decode_record)
                .collect()
        })
    }

    async fn list_write_ids(
        &self,
        table: &TableName,
        after: i64,
        max: usize,
        state: Option<WriteState>,
    ) -> StoreResult<Vec<WriteId>> {
        let stmt = match state {
            Some(_) => {
                r#"
                SELECT write_id FROM mm_writes
                WHERE db_name = $1 AND tbl_name = $2 AND write_id > $3 AND state = $5
                ORDER BY write_id LIMIT $4
                "#
            }
            None => {
                r#"
                SELECT write_id FROM mm_writes
                WHERE db_name = $1 AND tbl_name = $2 AND write_id > $3
                ORDER BY write_id LIMIT $4
                "#
            }
        };

        with_pool!(self, pool => {
            let mut q = query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(after)
                .bind(limit(max));
            if let Some(state) = state {
                q = q.bind(state.code());
            }
            q.fetch_all(pool)
                .await?
                .iter()
                .map(|row| write_id(row.try_get("write_id")?))
                .collect()
        })
    }

    async fn set_write_state(
        &self,
        table: &TableName,
        id: WriteId,
        expected: Option<WriteState>,
        new_state: WriteState,
        at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.get_table_state(table).await?.check_mutable(table, id)?;

        // Entering the aborted state stamps the abort time; staying aborted keeps it.
        let stmt = match expected {
            Some(_) => {
                r#"
                UPDATE mm_writes
                SET aborted_at = CASE WHEN $4 = 'a' AND state <> 'a' THEN $5 ELSE aborted_at END,
                    state = $4
                WHERE db_name = $1 AND tbl_name = $2 AND write_id = $3 AND state = $6
                "#
            }
            None => {
                r#"
                UPDATE mm_writes
                SET aborted_at = CASE WHEN $4 = 'a' AND state <> 'a' THEN $5 ELSE aborted_at END,
                    state = $4
                WHERE db_name = $1 AND tbl_name = $2 AND write_id = $3
                "#
            }
        };
        let id = db_id(id)?;
        let at = at.timestamp_millis();

        let updated = with_pool!(self, pool => {
            let mut q = query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(id)
                .bind(new_state.code())
                .bind(at);
            if let Some(expected) = expected {
                q = q.bind(expected.code());
            }
            q.execute(pool).await?.rows_affected()
        });
        Ok(updated == 1)
    }

    async fn mark_artifacts_deleted(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        let stmt = r#"
        UPDATE mm_writes SET artifacts_deleted = 1
        WHERE db_name = $1 AND tbl_name = $2 AND write_id = $3
        "#;
        let id = db_id(id)?;
        with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(id)
                .execute(pool)
                .await?;
        });
        Ok(())
    }

    async fn set_watermark(&self, table: &TableName, watermark: i64) -> StoreResult<()> {
        let stmt = r#"
        UPDATE mm_tables SET watermark = $3
        WHERE db_name = $1 AND tbl_name = $2 AND watermark <= $3 AND $3 < next_write_id
        "#;
        let updated = with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(watermark)
                .execute(pool)
                .await?
                .rows_affected()
        });
        if updated == 1 {
            return Ok(());
        }

        // Nothing changed: report why
        let state = self.get_table_state(table).await?;
        state.check_watermark(table, watermark)?;
        Ok(())
    }

    async fn purge_write_record(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        let stmt = r#"
        DELETE FROM mm_writes
        WHERE db_name = $1 AND tbl_name = $2 AND write_id = $3
        "#;
        let id = db_id(id)?;
        with_pool!(self, pool => {
            query(stmt)
                .bind(&table.database)
                .bind(&table.table)
                .bind(id)
                .execute(pool)
                .await?;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    async fn sqlite_store() -> (SqlWriteStore, TableName) {
        let store = SqlWriteStore::connect("sqlite::memory:").await.unwrap();
        let table = TableName::new("db1", "table1");
        store.register_table(&table).await.unwrap();
        (store, table)
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (store, table) = sqlite_store().await;
        store.register_table(&table).await.unwrap();

        let state = store.get_table_state(&table).await.unwrap();
        assert_eq!(state, TableWriteState::default());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = SqlWriteStore::connect("sqlite::memory:").await.unwrap();
        let err = store
            .allocate_write_id(&TableName::new("db", "nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnknownTable(_)));
    }

    #[tokio::test]
    async fn test_allocate_and_record() {
        let (store, table) = sqlite_store().await;
        assert_eq!(store.allocate_write_id(&table).await.unwrap(), 0);
        assert_eq!(store.allocate_write_id(&table).await.unwrap(), 1);

        assert!(
            store
                .insert_write_record(&table, &WriteRecord::open(1, ts(7)))
                .await
                .unwrap()
        );
        assert!(
            !store
                .insert_write_record(&table, &WriteRecord::open(1, ts(9)))
                .await
                .unwrap()
        );

        let record = store.get_write_record(&table, 1).await.unwrap().unwrap();
        assert_eq!(record, WriteRecord::open(1, ts(7)));
        assert!(store.get_write_record(&table, 0).await.unwrap().is_none());

        let pending = store.list_tables_with_pending_writes().await.unwrap();
        assert_eq!(pending, vec![table]);
    }

    #[tokio::test]
    async fn test_compare_and_set_transitions() {
        let (store, table) = sqlite_store().await;
        store.allocate_write_id(&table).await.unwrap();
        store
            .insert_write_record(&table, &WriteRecord::open(0, ts(0)))
            .await
            .unwrap();

        assert!(
            store
                .set_write_state(&table, 0, Some(WriteState::Open), WriteState::Aborted, ts(25))
                .await
                .unwrap()
        );
        assert!(
            !store
                .set_write_state(&table, 0, Some(WriteState::Open), WriteState::Committed, ts(26))
                .await
                .unwrap()
        );

        let record = store.get_write_record(&table, 0).await.unwrap().unwrap();
        assert_eq!(record.state, WriteState::Aborted);
        assert_eq!(record.aborted_at, Some(ts(25)));

        store.mark_artifacts_deleted(&table, 0).await.unwrap();
        let record = store.get_write_record(&table, 0).await.unwrap().unwrap();
        assert!(record.artifacts_deleted);
    }

    #[tokio::test]
    async fn test_watermark_and_purge() {
        let (store, table) = sqlite_store().await;
        for id in 0..3 {
            store.allocate_write_id(&table).await.unwrap();
            store
                .insert_write_record(&table, &WriteRecord::new(id, WriteState::Committed, ts(0)))
                .await
                .unwrap();
        }

        store.set_watermark(&table, 1).await.unwrap();
        assert_eq!(store.get_watermark(&table).await.unwrap(), 1);
        // Same value again is fine
        store.set_watermark(&table, 1).await.unwrap();

        let err = store.set_watermark(&table, 0).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkRegression { .. }));
        let err = store.set_watermark(&table, 3).await.unwrap_err();
        assert!(matches!(err, StoreError::WatermarkOverrun { .. }));

        let err = store
            .set_write_state(&table, 0, None, WriteState::Aborted, ts(1))
            .await
            .unwrap_err();
        assert!(err.is_invariant_violation());

        store.purge_write_record(&table, 0).await.unwrap();
        store.purge_write_record(&table, 1).await.unwrap();
        let ids = store.list_write_ids(&table, -1, 10, None).await.unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_list_with_state_filter() {
        let (store, table) = sqlite_store().await;
        let states = [
            WriteState::Aborted,
            WriteState::Open,
            WriteState::Aborted,
            WriteState::Committed,
        ];
        for (id, state) in states.into_iter().enumerate() {
            store.allocate_write_id(&table).await.unwrap();
            store
                .insert_write_record(&table, &WriteRecord::new(id as WriteId, state, ts(3)))
                .await
                .unwrap();
        }

        let aborted = store
            .list_write_ids(&table, -1, 10, Some(WriteState::Aborted))
            .await
            .unwrap();
        assert_eq!(aborted, vec![0, 2]);

        let records = store.list_write_records(&table, 0, 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, 1);
        assert_eq!(records[1].id, 2);
        assert_eq!(records[1].aborted_at, Some(ts(3)));
    }
}
