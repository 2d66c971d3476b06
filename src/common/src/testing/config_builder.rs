//! Test configuration builder for creating test setups quickly.

use std::path::Path;
use std::time::Duration;

use crate::config::{Configuration, DatabaseConfig, StorageConfig};

/// Builder for creating test configurations.
///
/// Starts from [`Configuration::default`] and offers shortcuts for the
/// settings tests usually change.
///
/// # Example
///
/// ```rust,ignore
/// use common::testing::TestConfigBuilder;
///
/// let temp = tempfile::TempDir::new().unwrap();
/// let config = TestConfigBuilder::new()
///     .with_shared_store_dir(temp.path())
///     .with_poll_interval(Duration::from_millis(10))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: Configuration::default(),
        }
    }

    /// Configure for fully in-memory operation (fastest for tests).
    ///
    /// This sets:
    /// - Storage DSN to `memory://`
    /// - Database DSN to `sqlite::memory:`
    pub fn in_memory(mut self) -> Self {
        self.config.storage = StorageConfig {
            dsn: "memory://".to_string(),
            ..StorageConfig::default()
        };
        self.config.database = DatabaseConfig::in_memory();
        self
    }

    /// Use a file-backed SQLite store and a local artifact directory under `dir`.
    ///
    /// Needed whenever more than one pool must see the same write records.
    pub fn with_shared_store_dir(mut self, dir: &Path) -> Self {
        self.config.database.dsn = format!("sqlite://{}", dir.join("writes.db").display());
        self.config.storage.dsn = format!("file://{}", dir.join("artifacts").display());
        self
    }

    /// Set the three timeouts of the cleaner policy.
    pub fn with_timeouts(
        mut self,
        heartbeat: Duration,
        absolute: Duration,
        grace: Duration,
    ) -> Self {
        self.config.cleaner.heartbeat_timeout = heartbeat;
        self.config.cleaner.absolute_timeout = absolute;
        self.config.cleaner.aborted_grace_period = grace;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.cleaner.poll_interval = interval;
        self
    }

    pub fn with_artifact_root(mut self, root: &str) -> Self {
        self.config.storage.artifact_root = root.to_string();
        self
    }

    /// Set the storage DSN.
    pub fn with_storage_dsn(mut self, dsn: &str) -> Self {
        self.config.storage.dsn = dsn.to_string();
        self
    }

    /// Set the database DSN.
    pub fn with_database_dsn(mut self, dsn: &str) -> Self {
        self.config.database.dsn = dsn.to_string();
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory() {
        let config = TestConfigBuilder::new().in_memory().build();
        assert_eq!(config.storage.dsn, "memory://");
        assert_eq!(config.database.dsn, "sqlite::memory:");
    }

    #[test]
    fn test_timeouts_are_applied() {
        let config = TestConfigBuilder::new()
            .with_timeouts(
                Duration::from_millis(3),
                Duration::from_millis(20),
                Duration::from_millis(5),
            )
            .build();
        assert_eq!(config.cleaner.heartbeat_timeout, Duration::from_millis(3));
        assert_eq!(config.cleaner.absolute_timeout, Duration::from_millis(20));
        assert_eq!(config.cleaner.aborted_grace_period, Duration::from_millis(5));
        assert!(config.cleaner.validate().is_ok());
    }

    #[test]
    fn test_shared_store_dir() {
        let dir = Path::new("/tmp/wl");
        let config = TestConfigBuilder::new().with_shared_store_dir(dir).build();
        assert_eq!(config.database.dsn, "sqlite:///tmp/wl/writes.db");
        assert_eq!(config.storage.dsn, "file:///tmp/wl/artifacts");
    }
}
