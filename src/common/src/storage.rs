use anyhow::{Context, Result};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

use crate::config::StorageConfig;

/// Create the object store holding write artifacts
pub fn create_object_store(storage_config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    log::info!(
        "Opening artifact store at {} (root prefix '{}')",
        storage_config.dsn,
        storage_config.artifact_root
    );
    create_object_store_from_dsn(&storage_config.dsn)
}

/// Object path under which table directories live
pub fn artifact_root(storage_config: &StorageConfig) -> ObjectPath {
    ObjectPath::from(storage_config.artifact_root.trim_matches('/'))
}

/// Resolve the local directory of a `file://` DSN.
///
/// `file:///.data/x` is relative to the working directory, any other path is absolute.
fn local_path(url: &Url) -> Result<String> {
    let path = url.path();
    if path.is_empty() || path == "/" {
        anyhow::bail!("File DSN must specify a path: file:///path/to/storage");
    }
    let path = match path.strip_prefix("/.") {
        Some(rest) => format!(".{rest}"),
        None => path.to_string(),
    };
    Ok(path)
}

/// Create an object store from a DSN string
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = local_path(&url)?;
            std::fs::create_dir_all(&path)
                .with_context(|| format!("Failed to create storage directory {path}"))?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(&path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => Ok(Arc::new(s3_builder_from_dsn(&url)?.build()?)),
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Create an S3 builder from a DSN
/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
fn s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let bucket = dsn.path().trim_start_matches('/');
    if bucket.is_empty() {
        anyhow::bail!("S3 DSN must specify a bucket: s3://host/bucket");
    }

    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region("us-east-1");

    if !dsn.username().is_empty() {
        builder = builder
            .with_access_key_id(dsn.username())
            .with_secret_access_key(dsn.password().unwrap_or(""));
    }

    // Anything that is not AWS proper is treated as an S3-compatible endpoint (MinIO etc.)
    if !host.contains("amazonaws.com") {
        let port = dsn.port();
        let scheme = if port == Some(443) { "https" } else { "http" };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_memory_object_store() {
        assert!(create_object_store_from_dsn("memory://").is_ok());
    }

    #[test]
    fn test_create_filesystem_object_store_creates_directory() {
        use tempfile::TempDir;

        let temp_dir = TempDir::new().unwrap();
        let target = temp_dir.path().join("artifacts");
        let dsn = format!("file://{}", target.to_string_lossy());

        assert!(create_object_store_from_dsn(&dsn).is_ok());
        assert!(target.is_dir());
    }

    #[test]
    fn test_artifact_root_is_normalized() {
        let config = StorageConfig {
            dsn: "memory://".to_string(),
            artifact_root: "/warehouse/".to_string(),
        };
        assert_eq!(artifact_root(&config).as_ref(), "warehouse");
        assert!(create_object_store(&config).is_ok());
    }

    #[test]
    fn test_relative_file_path() {
        let url = Url::parse("file:///.data/warehouse").unwrap();
        assert_eq!(local_path(&url).unwrap(), ".data/warehouse");
        let url = Url::parse("file:///tmp/data").unwrap();
        assert_eq!(local_path(&url).unwrap(), "/tmp/data");
    }

    #[test]
    fn test_invalid_dsn() {
        let err = create_object_store_from_dsn("not-a-url").unwrap_err();
        assert!(err.to_string().contains("Invalid storage DSN"));
    }

    #[test]
    fn test_unsupported_scheme() {
        let err = create_object_store_from_dsn("gcs://bucket/prefix").unwrap_err();
        assert!(err.to_string().contains("Unsupported storage scheme"));
    }

    #[test]
    fn test_file_dsn_without_path() {
        let err = create_object_store_from_dsn("file://").unwrap_err();
        assert!(err.to_string().contains("File DSN must specify a path"));
    }

    #[test]
    fn test_s3_dsn_parsing() {
        let url = Url::parse("s3://access:secret@localhost:9000/bucket").unwrap();
        assert!(s3_builder_from_dsn(&url).is_ok());

        let url = Url::parse("s3://localhost:9000/").unwrap();
        let err = s3_builder_from_dsn(&url).unwrap_err();
        assert!(err.to_string().contains("must specify a bucket"));
    }
}
