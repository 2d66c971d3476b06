pub mod config;
pub mod storage;
pub mod writes;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use writes::{
    InMemoryWriteStore, SqlWriteStore, StoreError, TableName, ValidWriteIds, WriteId,
    WriteRecord, WriteRecordStore, WriteState,
};
