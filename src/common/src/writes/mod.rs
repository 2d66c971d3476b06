//! Write tracking for insert-only tables.
//!
//! Every logical append to an insert-only table is identified by a write id,
//! allocated from a per-table counter. Each id may carry a [`WriteRecord`]
//! (its lifecycle state and timestamps), and each table keeps a watermark:
//! the highest id at or below which every write is resolved.
//!
//! ## Backends
//!
//! - [`InMemoryWriteStore`]: process-local store for tests and `memory://` setups
//! - [`SqlWriteStore`]: durable store on SQLite or PostgreSQL via `sqlx`
//!
//! Readers use [`ValidWriteIds`] to decide which writes are visible.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod lifecycle;
pub mod memory;
pub mod sql;
pub mod valid;

pub use lifecycle::{abort_write, begin_write, commit_write};
pub use memory::InMemoryWriteStore;
pub use sql::SqlWriteStore;
pub use valid::ValidWriteIds;

/// Identifier of one logical append batch.
pub type WriteId = u64;

/// Watermark value of a table on which no write has been resolved yet.
pub const NO_WATERMARK: i64 = -1;

/// Fully qualified name of an insert-only table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    pub database: String,
    pub table: String,
}

impl TableName {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// Persisted lifecycle state of a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteState {
    Open,
    Committed,
    Aborted,
}

impl WriteState {
    /// Single-character code used by the SQL backend.
    pub fn code(self) -> &'static str {
        match self {
            WriteState::Open => "o",
            WriteState::Committed => "c",
            WriteState::Aborted => "a",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "o" => Some(WriteState::Open),
            "c" => Some(WriteState::Committed),
            "a" => Some(WriteState::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for WriteState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteState::Open => "open",
            WriteState::Committed => "committed",
            WriteState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Durable record of a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub id: WriteId,
    pub state: WriteState,
    pub created_at: DateTime<Utc>,
    /// When the write entered the aborted state.
    pub aborted_at: Option<DateTime<Utc>>,
    /// Whether the write's artifacts are confirmed gone.
    pub artifacts_deleted: bool,
}

impl WriteRecord {
    /// A record in the given state. Records created already aborted take
    /// their creation time as abort time.
    pub fn new(id: WriteId, state: WriteState, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            state,
            created_at,
            aborted_at: (state == WriteState::Aborted).then_some(created_at),
            artifacts_deleted: false,
        }
    }

    pub fn open(id: WriteId, created_at: DateTime<Utc>) -> Self {
        Self::new(id, WriteState::Open, created_at)
    }

    /// Abort time, falling back to the creation time for records that lack one.
    pub fn aborted_since(&self) -> DateTime<Utc> {
        self.aborted_at.unwrap_or(self.created_at)
    }
}

/// Per-table tracking metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableWriteState {
    /// Id the next allocated write receives.
    pub next_write_id: WriteId,
    /// Highest id below which everything is resolved, or [`NO_WATERMARK`].
    pub watermark: i64,
}

impl Default for TableWriteState {
    fn default() -> Self {
        Self {
            next_write_id: 0,
            watermark: NO_WATERMARK,
        }
    }
}

impl TableWriteState {
    /// Number of allocated ids above the watermark.
    pub fn pending_count(&self) -> u64 {
        let highest = self.next_write_id as i64 - 1;
        (highest - self.watermark).max(0) as u64
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// First id above the watermark.
    pub fn first_pending(&self) -> WriteId {
        (self.watermark + 1) as WriteId
    }

    /// Whether `id` is at or below the watermark, i.e. already folded.
    pub fn is_folded(&self, id: WriteId) -> bool {
        (id as i64) <= self.watermark
    }

    pub fn is_allocated(&self, id: WriteId) -> bool {
        id < self.next_write_id
    }

    /// Reject mutations of ids that are folded or were never allocated.
    pub(crate) fn check_mutable(&self, table: &TableName, id: WriteId) -> StoreResult<()> {
        if self.is_folded(id) {
            return Err(StoreError::PurgedWrite {
                table: table.clone(),
                id,
                watermark: self.watermark,
            });
        }
        if !self.is_allocated(id) {
            return Err(StoreError::UnallocatedWrite {
                table: table.clone(),
                id,
                next_write_id: self.next_write_id,
            });
        }
        Ok(())
    }

    pub(crate) fn check_watermark(&self, table: &TableName, requested: i64) -> StoreResult<()> {
        if requested < self.watermark {
            return Err(StoreError::WatermarkRegression {
                table: table.clone(),
                current: self.watermark,
                requested,
            });
        }
        if requested >= self.next_write_id as i64 {
            return Err(StoreError::WatermarkOverrun {
                table: table.clone(),
                requested,
                next_write_id: self.next_write_id,
            });
        }
        Ok(())
    }
}

/// Errors raised by write-record stores.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("table {0} is not registered for write tracking")]
    UnknownTable(TableName),

    #[error("watermark of {table} cannot move backwards from {current} to {requested}")]
    WatermarkRegression {
        table: TableName,
        current: i64,
        requested: i64,
    },

    #[error("watermark {requested} of {table} must stay below next write id {next_write_id}")]
    WatermarkOverrun {
        table: TableName,
        requested: i64,
        next_write_id: WriteId,
    },

    #[error("write {id} of {table} is at or below watermark {watermark} and was purged")]
    PurgedWrite {
        table: TableName,
        id: WriteId,
        watermark: i64,
    },

    #[error("write {id} of {table} was never allocated (next write id {next_write_id})")]
    UnallocatedWrite {
        table: TableName,
        id: WriteId,
        next_write_id: WriteId,
    },

    #[error("write {id} of {table} was already recorded as {state} when its writer began")]
    WriteTaken {
        table: TableName,
        id: WriteId,
        state: WriteState,
    },

    #[error("corrupt write metadata: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl StoreError {
    /// Errors that indicate a programming error rather than a transient fault.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            StoreError::WatermarkRegression { .. }
                | StoreError::WatermarkOverrun { .. }
                | StoreError::PurgedWrite { .. }
                | StoreError::UnallocatedWrite { .. }
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable storage of per-table write metadata.
///
/// Every mutating operation is atomic on its own. Writers allocate ids and
/// commit; the cleaner aborts timed-out writes, records artifact deletion,
/// advances the watermark and purges folded records.
#[async_trait]
pub trait WriteRecordStore: Send + Sync + 'static {
    /// Start tracking a table. Registering twice is a no-op.
    async fn register_table(&self, table: &TableName) -> StoreResult<()>;

    /// Tables with at least one allocated id above the watermark, sorted by name.
    async fn list_tables_with_pending_writes(&self) -> StoreResult<Vec<TableName>>;

    /// Watermark and next write id, read together.
    async fn get_table_state(&self, table: &TableName) -> StoreResult<TableWriteState>;

    /// Atomically reserve the next write id.
    async fn allocate_write_id(&self, table: &TableName) -> StoreResult<WriteId>;

    /// Insert a record unless one already exists for its id.
    ///
    /// Returns `false` when a record was already present. The id must be
    /// allocated and above the watermark.
    async fn insert_write_record(&self, table: &TableName, record: &WriteRecord)
    -> StoreResult<bool>;

    async fn get_write_record(
        &self,
        table: &TableName,
        id: WriteId,
    ) -> StoreResult<Option<WriteRecord>>;

    /// Records with id greater than `after`, in increasing id order.
    async fn list_write_records(
        &self,
        table: &TableName,
        after: i64,
        limit: usize,
    ) -> StoreResult<Vec<WriteRecord>>;

    /// Ids greater than `after` in increasing order, optionally filtered by state.
    async fn list_write_ids(
        &self,
        table: &TableName,
        after: i64,
        limit: usize,
        state: Option<WriteState>,
    ) -> StoreResult<Vec<WriteId>>;

    /// Compare-and-set the state of a write.
    ///
    /// Returns `false` when the record does not exist or its state differs
    /// from `expected`. Entering [`WriteState::Aborted`] stamps `at` as the
    /// abort time. Touching a folded or unallocated id is an invariant violation.
    async fn set_write_state(
        &self,
        table: &TableName,
        id: WriteId,
        expected: Option<WriteState>,
        new_state: WriteState,
        at: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Persist that the artifacts of `id` are gone.
    async fn mark_artifacts_deleted(&self, table: &TableName, id: WriteId) -> StoreResult<()>;

    async fn get_watermark(&self, table: &TableName) -> StoreResult<i64> {
        Ok(self.get_table_state(table).await?.watermark)
    }

    /// Move the watermark forward. Moving it backwards or up to the next
    /// write id is an invariant violation.
    async fn set_watermark(&self, table: &TableName, watermark: i64) -> StoreResult<()>;

    async fn purge_write_record(&self, table: &TableName, id: WriteId) -> StoreResult<()>;
}
