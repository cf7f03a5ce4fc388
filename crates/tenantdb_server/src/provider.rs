//! Opening and deleting the storage of a database.

use crate::config::DatabaseConfig;
use crate::error::{ServerError, ServerResult};
use crate::name::DatabaseName;
use dashmap::DashMap;
use tenantdb_storage::{DatabaseDir, Environment, EnvironmentOptions, InMemoryBackend};

/// Construction collaborator: produces the storage environment of a database.
///
/// Calls may block on I/O; the landlord runs them off the async workers.
pub trait StorageProvider: Send + Sync + 'static {
    /// Opens (creating if needed) the storage of `name`.
    ///
    /// # Errors
    ///
    /// Returns the storage error that prevented opening.
    fn open_storage(
        &self,
        name: &DatabaseName,
        config: &DatabaseConfig,
    ) -> ServerResult<Environment>;

    /// Deletes every file of `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if the files cannot be removed.
    fn delete_storage(&self, name: &DatabaseName, config: &DatabaseConfig) -> ServerResult<()>;
}

fn options(name: &DatabaseName, config: &DatabaseConfig) -> EnvironmentOptions {
    EnvironmentOptions::new(name.as_str()).sync_on_commit(config.sync_on_commit)
}

/// Stores each database in its own locked directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStorageProvider;

impl StorageProvider for FileStorageProvider {
    fn open_storage(
        &self,
        name: &DatabaseName,
        config: &DatabaseConfig,
    ) -> ServerResult<Environment> {
        Ok(Environment::open_dir(&config.data_dir, options(name, config))?)
    }

    fn delete_storage(&self, _name: &DatabaseName, config: &DatabaseConfig) -> ServerResult<()> {
        Ok(DatabaseDir::delete_files(&config.data_dir)?)
    }
}

/// Keeps each database's journal in memory for the provider's lifetime, so
/// an unloaded database reloads with its data.
#[derive(Debug, Default)]
pub struct InMemoryStorageProvider {
    journals: DashMap<String, InMemoryBackend>,
}

impl InMemoryStorageProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if storage exists for `name`.
    #[must_use]
    pub fn contains(&self, name: &DatabaseName) -> bool {
        self.journals.contains_key(name.key())
    }
}

impl StorageProvider for InMemoryStorageProvider {
    fn open_storage(
        &self,
        name: &DatabaseName,
        config: &DatabaseConfig,
    ) -> ServerResult<Environment> {
        let backend = self.journals.entry(name.key().to_string()).or_default().clone();
        Ok(Environment::open(Box::new(backend), options(name, config))?)
    }

    fn delete_storage(&self, name: &DatabaseName, _config: &DatabaseConfig) -> ServerResult<()> {
        if self.journals.remove(name.key()).is_none() {
            return Err(ServerError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_reopen_keeps_data() {
        let provider = InMemoryStorageProvider::new();
        let name = DatabaseName::new("db").unwrap();
        let config = DatabaseConfig::default();

        let env = provider.open_storage(&name, &config).unwrap();
        let mut tx = env.begin_write().unwrap();
        tx.put("docs", "a", b"1".to_vec());
        tx.commit().unwrap();
        env.close().unwrap();
        drop(env);

        let env = provider.open_storage(&name, &config).unwrap();
        assert_eq!(env.get("docs", "a"), Some(b"1".to_vec()));
        drop(env);

        provider.delete_storage(&name, &config).unwrap();
        assert!(!provider.contains(&name));
    }

    #[test]
    fn file_provider_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let name = DatabaseName::new("db").unwrap();
        let config = DatabaseConfig {
            data_dir: tmp.path().join("db"),
            sync_on_commit: false,
            ..DatabaseConfig::default()
        };

        let env = FileStorageProvider.open_storage(&name, &config).unwrap();
        assert!(FileStorageProvider.open_storage(&name, &config).is_err());
        env.close().unwrap();
        drop(env);

        FileStorageProvider.delete_storage(&name, &config).unwrap();
        assert!(!config.data_dir.exists());
    }
}
