//! Mapping from write ids to the artifacts they produced.
//!
//! Writers place every file of write `N` under `<root>/<database>/<table>/mm_N/`.
//! Deleting a write's artifacts removes that whole directory.

use std::sync::Arc;

use async_trait::async_trait;
use common::writes::{TableName, WriteId};
use futures::TryStreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;

/// Prefix of per-write artifact directories.
pub const WRITE_DIR_PREFIX: &str = "mm_";

/// Result of deleting the artifacts of one write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Every artifact is gone. Also returned when none existed.
    Deleted { objects: usize },
    Failed { reason: String },
}

impl DeletionOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeletionOutcome::Deleted { .. })
    }
}

/// Locates and deletes write artifacts.
#[async_trait]
pub trait ArtifactLocator: Send + Sync + 'static {
    /// Delete everything write `id` produced for `table`.
    ///
    /// Must be idempotent: deleting already-missing artifacts succeeds.
    async fn delete_artifacts(&self, table: &TableName, id: WriteId) -> DeletionOutcome;

    /// Artifact directories no allocated write accounts for.
    ///
    /// Only used for reporting; the cleaner never deletes these.
    async fn list_unaccounted(
        &self,
        table: &TableName,
        next_write_id: WriteId,
    ) -> anyhow::Result<Vec<String>>;
}

/// Artifact locator over an [`ObjectStore`].
#[derive(Debug, Clone)]
pub struct ObjectStoreArtifactLocator {
    object_store: Arc<dyn ObjectStore>,
    root: ObjectPath,
}

impl ObjectStoreArtifactLocator {
    pub fn new(object_store: Arc<dyn ObjectStore>, root: ObjectPath) -> Self {
        Self { object_store, root }
    }

    pub fn table_dir(&self, table: &TableName) -> ObjectPath {
        self.root
            .child(table.database.as_str())
            .child(table.table.as_str())
    }

    /// Directory holding the artifacts of write `id`.
    pub fn write_dir(&self, table: &TableName, id: WriteId) -> ObjectPath {
        self.table_dir(table)
            .child(format!("{WRITE_DIR_PREFIX}{id}"))
    }

    async fn delete_prefix(&self, prefix: &ObjectPath) -> object_store::Result<usize> {
        let objects: Vec<_> = self.object_store.list(Some(prefix)).try_collect().await?;

        let mut deleted = 0;
        for meta in &objects {
            match self.object_store.delete(&meta.location).await {
                Ok(()) => deleted += 1,
                // Someone else got there first
                Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }
}

/// Write id encoded in an artifact directory name, if it is one.
pub fn parse_write_dir(name: &str) -> Option<Result<WriteId, String>> {
    let suffix = name.strip_prefix(WRITE_DIR_PREFIX)?;
    Some(suffix.parse::<WriteId>().map_err(|_| name.to_string()))
}

#[async_trait]
impl ArtifactLocator for ObjectStoreArtifactLocator {
    async fn delete_artifacts(&self, table: &TableName, id: WriteId) -> DeletionOutcome {
        let prefix = self.write_dir(table, id);
        match self.delete_prefix(&prefix).await {
            Ok(objects) => {
                tracing::debug!(
                    table = %table,
                    write_id = id,
                    prefix = %prefix,
                    objects,
                    "Deleted write artifacts"
                );
                DeletionOutcome::Deleted { objects }
            }
            Err(e) => DeletionOutcome::Failed {
                reason: format!("failed to delete {prefix}: {e}"),
            },
        }
    }

    async fn list_unaccounted(
        &self,
        table: &TableName,
        next_write_id: WriteId,
    ) -> anyhow::Result<Vec<String>> {
        let table_dir = self.table_dir(table);
        let listing = self
            .object_store
            .list_with_delimiter(Some(&table_dir))
            .await?;

        let mut unaccounted = Vec::new();
        for dir in listing.common_prefixes {
            let Some(name) = dir.filename() else {
                continue;
            };
            match parse_write_dir(name) {
                Some(Ok(id)) if id < next_write_id => {}
                Some(_) => unaccounted.push(dir.to_string()),
                None => {}
            }
        }
        Ok(unaccounted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use object_store::PutPayload;
    use object_store::memory::InMemory;

    async fn put(store: &Arc<dyn ObjectStore>, path: &str) {
        store
            .put(
                &ObjectPath::from(path),
                PutPayload::from(Bytes::from_static(b"row")),
            )
            .await
            .unwrap();
    }

    fn locator(store: &Arc<dyn ObjectStore>) -> ObjectStoreArtifactLocator {
        ObjectStoreArtifactLocator::new(store.clone(), ObjectPath::from("warehouse"))
    }

    #[test]
    fn test_write_dir_layout() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let table = TableName::new("db1", "table1");
        assert_eq!(
            locator(&store).write_dir(&table, 7).as_ref(),
            "warehouse/db1/table1/mm_7"
        );
    }

    #[test]
    fn test_parse_write_dir() {
        assert_eq!(parse_write_dir("mm_12"), Some(Ok(12)));
        assert_eq!(parse_write_dir("mm_x"), Some(Err("mm_x".to_string())));
        assert_eq!(parse_write_dir("base_1"), None);
    }

    #[tokio::test]
    async fn test_delete_removes_only_the_write_directory() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let table = TableName::new("db1", "table1");
        put(&store, "warehouse/db1/table1/mm_1/part-0").await;
        put(&store, "warehouse/db1/table1/mm_1/part-1").await;
        put(&store, "warehouse/db1/table1/mm_10/part-0").await;

        let outcome = locator(&store).delete_artifacts(&table, 1).await;
        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 2 });

        let remaining: Vec<_> = store
            .list(Some(&ObjectPath::from("warehouse")))
            .try_collect()
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(
            remaining[0].location.as_ref(),
            "warehouse/db1/table1/mm_10/part-0"
        );
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let table = TableName::new("db1", "table1");

        let outcome = locator(&store).delete_artifacts(&table, 3).await;
        assert_eq!(outcome, DeletionOutcome::Deleted { objects: 0 });
        assert!(outcome.is_deleted());
    }

    #[tokio::test]
    async fn test_list_unaccounted() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let table = TableName::new("db1", "table1");
        put(&store, "warehouse/db1/table1/mm_0/part-0").await;
        put(&store, "warehouse/db1/table1/mm_4/part-0").await;
        put(&store, "warehouse/db1/table1/mm_bogus/part-0").await;
        put(&store, "warehouse/db1/table1/staging/part-0").await;

        let mut unaccounted = locator(&store).list_unaccounted(&table, 4).await.unwrap();
        unaccounted.sort();
        assert_eq!(
            unaccounted,
            vec![
                "warehouse/db1/table1/mm_4".to_string(),
                "warehouse/db1/table1/mm_bogus".to_string(),
            ]
        );
    }
}
