//! Authoritative database records and the cluster-side collaborators.
//!
//! The landlord never owns topology. It reads a [`DatabaseRecord`] through a
//! [`TopologyStore`] and reports finished removals through a
//! [`ClusterNotifier`].

use crate::error::{ServerError, ServerResult};
use crate::name::DatabaseName;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

/// Deletion state of a database on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DeletionStatus {
    /// Not being deleted.
    #[default]
    No,
    /// Remove from the node but keep the files.
    SoftDelete,
    /// Remove from the node and delete the files.
    HardDelete,
}

/// Expiration settings stored in the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpirationConfig {
    /// Whether the cleaner runs.
    pub active: bool,
    /// Seconds between sweeps; 60 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_frequency_secs: Option<u64>,
}

impl ExpirationConfig {
    /// Default sweep period in seconds.
    pub const DEFAULT_FREQUENCY_SECS: u64 = 60;

    /// Returns the effective sweep period.
    #[must_use]
    pub fn period(&self) -> std::time::Duration {
        let secs = self.delete_frequency_secs.unwrap_or(Self::DEFAULT_FREQUENCY_SECS);
        std::time::Duration::from_secs(secs)
    }
}

/// The cluster's authoritative description of one database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DatabaseRecord {
    /// Database name.
    pub name: String,
    /// Disabled databases are not loaded.
    #[serde(default)]
    pub disabled: bool,
    /// Per-node deletion state.
    #[serde(default)]
    pub deletion_in_progress: BTreeMap<String, DeletionStatus>,
    /// Tags of the nodes hosting the database.
    #[serde(default)]
    pub topology: Vec<String>,
    /// `Section.Key` overrides of the database configuration.
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    /// Expired documents cleaner settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<ExpirationConfig>,
}

impl DatabaseRecord {
    /// Creates an enabled record hosted on `nodes`.
    pub fn new(name: impl Into<String>, nodes: &[&str]) -> Self {
        Self {
            name: name.into(),
            topology: nodes.iter().map(|n| (*n).to_string()).collect(),
            ..Self::default()
        }
    }

    /// Returns true if `node` hosts the database.
    #[must_use]
    pub fn is_relevant_for(&self, node: &str) -> bool {
        self.topology.iter().any(|n| n == node)
    }

    /// Returns the deletion state on `node`, if one is in progress.
    #[must_use]
    pub fn deletion_on(&self, node: &str) -> Option<DeletionStatus> {
        self.deletion_in_progress
            .get(node)
            .copied()
            .filter(|status| *status != DeletionStatus::No)
    }
}

/// Read access to authoritative records.
pub trait TopologyStore: Send + Sync + 'static {
    /// Reads the record for `name`. `None` means the database does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store cannot be read.
    fn read_record(&self, name: &DatabaseName) -> ServerResult<Option<DatabaseRecord>>;

    /// Lists the names of every known database.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata store cannot be read.
    fn database_names(&self) -> ServerResult<Vec<String>>;
}

/// Reports to the cluster leader.
pub trait ClusterNotifier: Send + Sync + 'static {
    /// Tells the leader that `node` has finished removing `name`.
    ///
    /// The landlord spawns the returned future and only logs its failure.
    fn notify_leader_removed(
        &self,
        name: &DatabaseName,
        node: &str,
    ) -> BoxFuture<'static, ServerResult<()>>;
}

/// A topology store held in memory, optionally loaded from a JSON file.
#[derive(Debug, Default)]
pub struct MemoryTopology {
    records: RwLock<BTreeMap<String, DatabaseRecord>>,
}

impl MemoryTopology {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON array of records.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_json_file(path: &Path) -> ServerResult<Self> {
        let failed = |e: &dyn std::fmt::Display| {
            ServerError::collaborator("topology store", format!("{}: {e}", path.display()))
        };
        let bytes = std::fs::read(path).map_err(|e| failed(&e))?;
        let records: Vec<DatabaseRecord> =
            serde_json::from_slice(&bytes).map_err(|e| failed(&e))?;
        let store = Self::new();
        for record in records {
            store.put(record);
        }
        Ok(store)
    }

    /// Inserts or replaces a record.
    pub fn put(&self, record: DatabaseRecord) {
        self.records.write().insert(record.name.to_lowercase(), record);
    }

    /// Removes a record.
    pub fn remove(&self, name: &str) -> Option<DatabaseRecord> {
        self.records.write().remove(&name.to_lowercase())
    }

    /// Applies `f` to the stored record, if any.
    pub fn update(&self, name: &str, f: impl FnOnce(&mut DatabaseRecord)) -> bool {
        match self.records.write().get_mut(&name.to_lowercase()) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }
}

impl TopologyStore for MemoryTopology {
    fn read_record(&self, name: &DatabaseName) -> ServerResult<Option<DatabaseRecord>> {
        Ok(self.records.read().get(name.key()).cloned())
    }

    fn database_names(&self) -> ServerResult<Vec<String>> {
        Ok(self.records.read().values().map(|r| r.name.clone()).collect())
    }
}

/// A cluster notifier for single-node deployments: it only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandaloneNotifier;

impl ClusterNotifier for StandaloneNotifier {
    fn notify_leader_removed(
        &self,
        name: &DatabaseName,
        node: &str,
    ) -> BoxFuture<'static, ServerResult<()>> {
        info!(database = %name, node, "database removed from node");
        futures::future::ready(Ok(())).boxed()
    }
}
