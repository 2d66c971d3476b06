use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "writeledger.toml";

/// Prefix for environment overrides, e.g. `WRITELEDGER__CLEANER__POLL_INTERVAL=30s`.
pub const ENV_PREFIX: &str = "WRITELEDGER__";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN of the write-record store (PostgreSQL or SQLite)
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/writeledger.db"),
        }
    }
}

impl DatabaseConfig {
    /// Create an in-memory database configuration
    pub fn in_memory() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Object store DSN (`file://`, `memory://`, `s3://`)
    pub dsn: String,
    /// Prefix under which table directories live inside the object store
    #[serde(default)]
    pub artifact_root: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file:///.data/warehouse"),
            artifact_root: String::new(),
        }
    }
}

/// Settings for the insert-only write cleaner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanerConfig {
    /// Run the cleaner loop at all.
    ///
    /// Env: WRITELEDGER__CLEANER__ENABLED
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Grace window for allocated-but-unrecorded writes, measured from the
    /// creation time of the next recorded write.
    ///
    /// Env: WRITELEDGER__CLEANER__HEARTBEAT_TIMEOUT
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,

    /// Age at which a recorded OPEN write is forcibly aborted.
    ///
    /// Env: WRITELEDGER__CLEANER__ABSOLUTE_TIMEOUT
    #[serde(with = "humantime_serde")]
    pub absolute_timeout: Duration,

    /// Time an aborted write stays above the watermark after its abort so
    /// that in-flight readers stop referencing it.
    ///
    /// Env: WRITELEDGER__CLEANER__ABORTED_GRACE_PERIOD
    #[serde(with = "humantime_serde")]
    pub aborted_grace_period: Duration,

    /// Interval between cleaner sweeps.
    ///
    /// Env: WRITELEDGER__CLEANER__POLL_INTERVAL
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Maximum number of tables reconciled concurrently within one sweep.
    ///
    /// Env: WRITELEDGER__CLEANER__MAX_CONCURRENT_TABLES
    #[serde(default = "default_max_concurrent_tables")]
    pub max_concurrent_tables: usize,

    /// Fixed part of the per-table pass timeout.
    #[serde(with = "humantime_serde", default = "default_pass_timeout_base")]
    pub pass_timeout_base: Duration,

    /// Additional pass timeout granted per pending write id.
    #[serde(with = "humantime_serde", default = "default_pass_timeout_per_write")]
    pub pass_timeout_per_write: Duration,

    /// Log artifact directories that belong to no allocated write id.
    #[serde(default)]
    pub report_unaccounted_artifacts: bool,
}

fn default_enabled() -> bool {
    true
}

fn default_max_concurrent_tables() -> usize {
    4
}

fn default_pass_timeout_base() -> Duration {
    Duration::from_secs(30)
}

fn default_pass_timeout_per_write() -> Duration {
    Duration::from_millis(250)
}

impl Default for CleanerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            heartbeat_timeout: Duration::from_secs(30 * 60), // 30 minutes
            absolute_timeout: Duration::from_secs(7 * 24 * 3600), // 7 days
            aborted_grace_period: Duration::from_secs(24 * 3600), // 1 day
            poll_interval: Duration::from_secs(5 * 60),
            max_concurrent_tables: default_max_concurrent_tables(),
            pass_timeout_base: default_pass_timeout_base(),
            pass_timeout_per_write: default_pass_timeout_per_write(),
            report_unaccounted_artifacts: false,
        }
    }
}

impl CleanerConfig {
    /// Validate the cleaner configuration.
    ///
    /// Checks:
    /// - Poll interval is positive
    /// - Table concurrency is positive
    /// - Absolute timeout is not shorter than the heartbeat timeout
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval.is_zero() {
            anyhow::bail!("poll_interval must be positive");
        }

        if self.max_concurrent_tables == 0 {
            anyhow::bail!(
                "max_concurrent_tables must be positive, got {}",
                self.max_concurrent_tables
            );
        }

        if self.absolute_timeout < self.heartbeat_timeout {
            anyhow::bail!(
                "absolute_timeout ({:?}) must not be shorter than heartbeat_timeout ({:?})",
                self.absolute_timeout,
                self.heartbeat_timeout
            );
        }

        Ok(())
    }

    /// Upper bound for a single table pass with `pending` unresolved ids.
    pub fn pass_timeout(&self, pending: u64) -> Duration {
        let per_write = self
            .pass_timeout_per_write
            .saturating_mul(u32::try_from(pending).unwrap_or(u32::MAX));
        self.pass_timeout_base.saturating_add(per_write)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Configuration {
    /// Write-record store
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Object storage holding write artifacts
    #[serde(default)]
    pub storage: StorageConfig,
    /// Cleaner loop settings
    #[serde(default)]
    pub cleaner: CleanerConfig,
}

impl Configuration {
    fn figment(file: &Path) -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load from `writeledger.toml` in the working directory plus environment.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Load from the given TOML file plus environment. A missing file is not an error.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        Self::figment(path).extract().map_err(Box::new)
    }
}
