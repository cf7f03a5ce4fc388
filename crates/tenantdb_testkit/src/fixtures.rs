//! Test fixtures and server helpers.

use crate::faults::RecordingNotifier;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tenantdb_server::{
    DatabaseConfig, DatabaseRecord, DeletionStatus, FileStorageProvider, InMemoryStorageProvider,
    Landlord, MemoryTopology, ServerConfig, ServerResult, StorageProvider,
};

/// Node tag every fixture server runs as.
pub const NODE: &str = "A";

/// A landlord wired to an in-memory topology and a recording notifier.
///
/// File-backed servers keep their temporary directory alive for as long as
/// the fixture lives.
pub struct TestServer {
    /// The landlord under test.
    pub landlord: Arc<Landlord>,
    /// The authoritative records it reads.
    pub topology: Arc<MemoryTopology>,
    /// Removal notifications it sent.
    pub cluster: Arc<RecordingNotifier>,
    _temp_dir: Option<TempDir>,
}

impl TestServer {
    /// Starts building a server.
    #[must_use]
    pub fn builder() -> TestServerBuilder {
        TestServerBuilder::new()
    }

    /// Creates an in-memory server hosting the given databases.
    #[must_use]
    pub fn with_databases(names: &[&str]) -> Self {
        names
            .iter()
            .fold(Self::builder(), |builder, name| builder.database(name))
            .build()
    }

    /// Returns the data directory of a file-backed server.
    #[must_use]
    pub fn data_dir(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Adds or replaces a record.
    pub fn put_record(&self, record: DatabaseRecord) {
        self.topology.put(record);
    }

    /// Disables `name` in its record.
    ///
    /// # Panics
    ///
    /// Panics if there is no record for `name`.
    pub fn disable(&self, name: &str) {
        assert!(self.topology.update(name, |r| r.disabled = true), "no record for {name}");
    }

    /// Marks a deletion of `name` in progress on this node.
    ///
    /// # Panics
    ///
    /// Panics if there is no record for `name`.
    pub fn mark_deleted(&self, name: &str, status: DeletionStatus) {
        let updated = self.topology.update(name, |r| {
            r.deletion_in_progress.insert(NODE.to_string(), status);
        });
        assert!(updated, "no record for {name}");
    }

    /// Removes the record of `name`.
    pub fn remove_record(&self, name: &str) {
        self.topology.remove(name);
    }

    /// Tells the landlord the record of `name` changed.
    ///
    /// # Errors
    ///
    /// Returns the landlord's error.
    pub async fn topology_changed(&self, name: &str) -> ServerResult<()> {
        self.landlord.on_topology_changed(name).await
    }

    /// Shuts the landlord down and waits for deferred disposals.
    ///
    /// # Errors
    ///
    /// Returns the aggregated disposal error.
    pub async fn shutdown(&self) -> ServerResult<()> {
        let result = self.landlord.shutdown().await;
        self.landlord.wait_deferred().await;
        result
    }
}

/// Builder for [`TestServer`].
///
/// Defaults: node [`NODE`], no fsync on commit, in-memory storage.
pub struct TestServerBuilder {
    config: ServerConfig,
    records: Vec<DatabaseRecord>,
    provider: Option<Arc<dyn StorageProvider>>,
    on_disk: bool,
}

impl Default for TestServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestServerBuilder {
    /// Creates a builder with test defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ServerConfig::new()
                .node_tag(NODE)
                .in_memory(true)
                .database(DatabaseConfig::default().sync_on_commit(false)),
            records: Vec::new(),
            provider: None,
            on_disk: false,
        }
    }

    /// Adjusts the server configuration.
    #[must_use]
    pub fn config(mut self, f: impl FnOnce(ServerConfig) -> ServerConfig) -> Self {
        self.config = f(self.config);
        self
    }

    /// Hosts `name` on this node.
    #[must_use]
    pub fn database(self, name: &str) -> Self {
        self.record(DatabaseRecord::new(name, &[NODE]))
    }

    /// Adds an authoritative record as is.
    #[must_use]
    pub fn record(mut self, record: DatabaseRecord) -> Self {
        self.records.push(record);
        self
    }

    /// Uses `provider` for storage.
    #[must_use]
    pub fn provider<P: StorageProvider>(mut self, provider: Arc<P>) -> Self {
        self.provider = Some(provider as Arc<dyn StorageProvider>);
        self
    }

    /// Stores databases in files under a temporary directory.
    #[must_use]
    pub fn on_disk(mut self) -> Self {
        self.on_disk = true;
        self
    }

    /// Builds the server.
    ///
    /// # Panics
    ///
    /// Panics if the temporary directory cannot be created.
    #[must_use]
    pub fn build(self) -> TestServer {
        let topology = Arc::new(MemoryTopology::new());
        for record in self.records {
            topology.put(record);
        }
        let cluster = Arc::new(RecordingNotifier::new());

        let mut config = self.config;
        let mut temp_dir = None;
        let provider = match (self.provider, self.on_disk) {
            (Some(provider), _) => provider,
            (None, true) => {
                let dir = tempfile::tempdir().expect("Failed to create temp dir");
                config = config.data_dir(dir.path()).in_memory(false);
                temp_dir = Some(dir);
                Arc::new(FileStorageProvider) as Arc<dyn StorageProvider>
            }
            (None, false) => Arc::new(InMemoryStorageProvider::new()),
        };

        let landlord = Landlord::new(config, topology.clone(), cluster.clone(), provider);
        TestServer {
            landlord,
            topology,
            cluster,
            _temp_dir: temp_dir,
        }
    }
}
