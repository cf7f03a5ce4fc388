//! Error types for the TenantDB server core.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Root cause attached to a load failure.
pub type ErrorSource = Arc<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by the landlord, the transaction merger and their
/// collaborators.
///
/// The type is `Clone`: a single load or commit failure is observed by
/// every caller awaiting the same shared task.
#[derive(Debug, Clone, Error)]
pub enum ServerError {
    /// No admission token became free within the configured timeout.
    #[error("too many concurrent loads, timed out after {waited:?} waiting to load '{name}'")]
    ConcurrentLoadTimeout {
        /// Database that was being loaded.
        name: String,
        /// How long the caller waited.
        waited: Duration,
    },

    /// The database is disabled in its authoritative record.
    #[error("database '{name}' has been disabled")]
    InstanceDisabled {
        /// Database name.
        name: String,
    },

    /// The database is being deleted on this node.
    #[error("database '{name}' is currently being deleted on node {node}")]
    InstanceBeingDeleted {
        /// Database name.
        name: String,
        /// This node's tag.
        node: String,
    },

    /// This node is not part of the database topology.
    #[error("database '{name}' is not relevant for node {node}")]
    NotRelevant {
        /// Database name.
        name: String,
        /// This node's tag.
        node: String,
    },

    /// No authoritative record exists for the database.
    #[error("database '{name}' does not exist")]
    DatabaseNotFound {
        /// Database name.
        name: String,
    },

    /// The instance is being unloaded and accepts no more work.
    #[error("database '{name}' is unloading")]
    InstanceUnloading {
        /// Database name.
        name: String,
    },

    /// The operation needs a loaded instance but construction is in flight.
    #[error("database '{name}' is still loading")]
    StillLoading {
        /// Database name.
        name: String,
    },

    /// Construction failed.
    #[error("failed to load database '{name}': {source}")]
    LoadFailure {
        /// Database name.
        name: String,
        /// What went wrong.
        #[source]
        source: ErrorSource,
    },

    /// The shared load did not finish within the database load timeout.
    #[error("database '{name}' did not load within {timeout:?}")]
    DatabaseLoadTimeout {
        /// Database name.
        name: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// A durability write failed; the instance refuses batches until reloaded.
    #[error("commit failed for database '{name}': {reason}")]
    StorageCommitFailure {
        /// Database name.
        name: String,
        /// The storage error, rendered.
        reason: String,
    },

    /// The landlord is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// The database name is not acceptable.
    #[error("invalid database name '{name}': {reason}")]
    InvalidName {
        /// The rejected name.
        name: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// A per-database setting could not be applied.
    #[error("invalid setting {key}={value}: {reason}")]
    InvalidSetting {
        /// Setting key.
        key: String,
        /// Setting value.
        value: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A merged command failed while applying.
    #[error("command failed: {message}")]
    Command {
        /// Description of the failure.
        message: String,
    },

    /// Another command in the same batch failed, so this one was rolled back.
    #[error("batch aborted in database '{name}' because another command failed")]
    BatchAborted {
        /// Database name.
        name: String,
    },

    /// The operation was canceled.
    #[error("operation canceled")]
    Canceled,

    /// One or more databases failed to dispose during shutdown.
    #[error("failed to dispose {} database(s)", errors.len())]
    DisposeFailed {
        /// `(database, error)` pairs.
        errors: Vec<(String, String)>,
    },

    /// Storage layer error outside of a durability write.
    #[error("storage error: {0}")]
    Storage(Arc<tenantdb_storage::StorageError>),

    /// A collaborator (topology store, cluster layer) failed.
    #[error("{component} failed: {message}")]
    Collaborator {
        /// Which collaborator.
        component: &'static str,
        /// Description of the failure.
        message: String,
    },
}

impl From<tenantdb_storage::StorageError> for ServerError {
    fn from(e: tenantdb_storage::StorageError) -> Self {
        Self::Storage(Arc::new(e))
    }
}

impl ServerError {
    /// Wraps a construction failure.
    pub fn load_failure(
        name: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::LoadFailure {
            name: name.into(),
            source: Arc::new(source),
        }
    }

    /// Creates a command failure.
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Creates a collaborator failure.
    pub fn collaborator(component: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            component,
            message: message.into(),
        }
    }

    /// Returns true if retrying later may succeed without outside changes.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentLoadTimeout { .. }
                | Self::InstanceUnloading { .. }
                | Self::StillLoading { .. }
                | Self::DatabaseLoadTimeout { .. }
                | Self::BatchAborted { .. }
        )
    }

    /// Returns true if the request cannot succeed until the authoritative
    /// record changes.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InstanceDisabled { .. }
                | Self::InstanceBeingDeleted { .. }
                | Self::NotRelevant { .. }
                | Self::DatabaseNotFound { .. }
                | Self::InvalidName { .. }
        )
    }

    /// Returns true if the instance must be reloaded before it accepts writes.
    #[must_use]
    pub fn requires_reload(&self) -> bool {
        matches!(self, Self::StorageCommitFailure { .. })
    }
}
