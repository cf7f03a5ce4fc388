//! Server and per-database configuration.

use crate::error::{ServerError, ServerResult};
use crate::name::DatabaseName;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Setting key: whether durability writes `fsync`.
pub const SYNC_ON_COMMIT: &str = "Storage.SyncOnCommit";
/// Setting key: maximum number of commands per merged batch.
pub const MAX_BATCH_SIZE: &str = "TransactionMerger.MaxBatchSize";
/// Setting key: keep a failed load in the cache for inspection.
pub const KEEP_FAILED_LOAD: &str = "Database.KeepFailedLoad";

fn available_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// Configuration for the landlord and everything it loads.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Root directory; each database lives in a subdirectory.
    pub data_dir: PathBuf,
    /// Tag identifying this node in database topologies.
    pub node_tag: String,
    /// Admission gate capacity.
    pub max_concurrent_loads: usize,
    /// How long a load waits for an admission token.
    pub concurrent_load_timeout: Duration,
    /// How long [`get_database`](crate::Landlord::get_database) waits for a load.
    pub database_load_timeout: Duration,
    /// Idle time after which the sweeper unloads a database.
    pub idle_unload_after: Duration,
    /// How often the idle sweeper runs.
    pub idle_sweep_interval: Duration,
    /// How many databases are disposed concurrently during shutdown.
    pub dispose_parallelism: usize,
    /// Keep databases in memory instead of on disk.
    pub in_memory: bool,
    /// Defaults for every database before record settings apply.
    pub database: DatabaseConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tenantdb-data"),
            node_tag: "A".to_string(),
            max_concurrent_loads: available_cpus(),
            concurrent_load_timeout: Duration::from_secs(5),
            database_load_timeout: Duration::from_secs(30),
            idle_unload_after: Duration::from_secs(15 * 60),
            idle_sweep_interval: Duration::from_secs(60),
            dispose_parallelism: (available_cpus() / 2).max(1),
            in_memory: false,
            database: DatabaseConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data directory.
    #[must_use]
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.data_dir = path.into();
        self
    }

    /// Sets this node's tag.
    #[must_use]
    pub fn node_tag(mut self, tag: impl Into<String>) -> Self {
        self.node_tag = tag.into();
        self
    }

    /// Sets the admission gate capacity (at least one).
    #[must_use]
    pub fn max_concurrent_loads(mut self, value: usize) -> Self {
        self.max_concurrent_loads = value.max(1);
        self
    }

    /// Sets the admission timeout.
    #[must_use]
    pub const fn concurrent_load_timeout(mut self, value: Duration) -> Self {
        self.concurrent_load_timeout = value;
        self
    }

    /// Sets the database load timeout.
    #[must_use]
    pub const fn database_load_timeout(mut self, value: Duration) -> Self {
        self.database_load_timeout = value;
        self
    }

    /// Sets the idle time after which the sweeper unloads databases.
    #[must_use]
    pub const fn idle_unload_after(mut self, value: Duration) -> Self {
        self.idle_unload_after = value;
        self
    }

    /// Sets the idle sweep period.
    #[must_use]
    pub const fn idle_sweep_interval(mut self, value: Duration) -> Self {
        self.idle_sweep_interval = value;
        self
    }

    /// Sets shutdown disposal parallelism (at least one).
    #[must_use]
    pub fn dispose_parallelism(mut self, value: usize) -> Self {
        self.dispose_parallelism = value.max(1);
        self
    }

    /// Keeps databases in memory.
    #[must_use]
    pub const fn in_memory(mut self, value: bool) -> Self {
        self.in_memory = value;
        self
    }

    /// Sets per-database defaults.
    #[must_use]
    pub fn database(mut self, value: DatabaseConfig) -> Self {
        self.database = value;
        self
    }

    /// Builds the configuration of one database: server defaults, its
    /// directory, then the record's settings.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidSetting`] for unknown keys or bad values.
    pub fn database_config(
        &self,
        name: &DatabaseName,
        settings: &BTreeMap<String, String>,
    ) -> ServerResult<DatabaseConfig> {
        let mut config = self.database.clone();
        config.data_dir = self.data_dir.join(name.key());
        config.apply_settings(settings)?;
        Ok(config)
    }
}

/// Configuration of one loaded database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    /// Directory holding the database files.
    pub data_dir: PathBuf,
    /// Maximum commands merged into one batch.
    pub max_batch_size: usize,
    /// Whether durability writes `fsync`.
    pub sync_on_commit: bool,
    /// Keep a failed load cached for inspection.
    pub keep_failed_load: bool,
    /// Buffered notifications per change subscriber before it is dropped.
    pub change_buffer: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::new(),
            max_batch_size: 1024,
            sync_on_commit: true,
            keep_failed_load: false,
            change_buffer: 16 * 1024,
        }
    }
}

impl DatabaseConfig {
    /// Sets the batch size limit (at least one).
    #[must_use]
    pub fn max_batch_size(mut self, value: usize) -> Self {
        self.max_batch_size = value.max(1);
        self
    }

    /// Sets whether durability writes `fsync`.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets whether failed loads stay cached.
    #[must_use]
    pub const fn keep_failed_load(mut self, value: bool) -> Self {
        self.keep_failed_load = value;
        self
    }

    /// Sets the per-subscriber notification buffer.
    #[must_use]
    pub fn change_buffer(mut self, value: usize) -> Self {
        self.change_buffer = value.max(1);
        self
    }

    /// Applies `Section.Key = value` overrides.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::InvalidSetting`] for unknown keys or values
    /// that do not parse.
    pub fn apply_settings(&mut self, settings: &BTreeMap<String, String>) -> ServerResult<()> {
        for (key, value) in settings {
            let invalid = |reason: &str| ServerError::InvalidSetting {
                key: key.clone(),
                value: value.clone(),
                reason: reason.to_string(),
            };
            match key.as_str() {
                SYNC_ON_COMMIT => {
                    self.sync_on_commit =
                        parse_bool(value).ok_or_else(|| invalid("expected true or false"))?;
                }
                KEEP_FAILED_LOAD => {
                    self.keep_failed_load =
                        parse_bool(value).ok_or_else(|| invalid("expected true or false"))?;
                }
                MAX_BATCH_SIZE => {
                    let size: usize = value
                        .trim()
                        .parse()
                        .map_err(|_| invalid("expected a positive integer"))?;
                    if size == 0 {
                        return Err(invalid("expected a positive integer"));
                    }
                    self.max_batch_size = size;
                }
                _ => return Err(invalid("unknown setting")),
            }
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}
