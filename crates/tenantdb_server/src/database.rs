//! A loaded database instance.

use crate::changes::{DocumentChange, DocumentsChanges, Subscription};
use crate::commands::MergedCommand;
use crate::config::DatabaseConfig;
use crate::documents::{self, Document};
use crate::error::{ServerError, ServerResult};
use crate::expiration::ExpiredDocumentsCleaner;
use crate::merger::TransactionMerger;
use crate::name::DatabaseName;
use crate::record::{DatabaseRecord, TopologyStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tenantdb_storage::Environment;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// One loaded database: its storage environment, transaction merger,
/// change notifier and maintenance workers.
///
/// Instances are shared as `Arc<DocumentDatabase>`. Once
/// [`dispose`](Self::dispose) has started, writes fail with
/// [`ServerError::InstanceUnloading`].
pub struct DocumentDatabase {
    id: Uuid,
    name: DatabaseName,
    config: DatabaseConfig,
    env: Environment,
    merger: TransactionMerger,
    changes: DocumentsChanges,
    shutdown: CancellationToken,
    record: Mutex<DatabaseRecord>,
    expiration: Mutex<Option<Arc<ExpiredDocumentsCleaner>>>,
    topology: Arc<dyn TopologyStore>,
    disposed: AtomicBool,
    started_at: DateTime<Utc>,
}

impl std::fmt::Debug for DocumentDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentDatabase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("generation", &self.env.generation())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl DocumentDatabase {
    /// Wraps an opened environment and starts the merger and the workers
    /// configured by `record`.
    ///
    /// Must be called inside a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if there is no current runtime or the merger thread cannot be
    /// spawned.
    pub fn open(
        name: DatabaseName,
        config: DatabaseConfig,
        record: DatabaseRecord,
        env: Environment,
        topology: Arc<dyn TopologyStore>,
        parent: &CancellationToken,
    ) -> ServerResult<Arc<Self>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| ServerError::load_failure(name.as_str(), e))?;
        let changes = DocumentsChanges::new(config.change_buffer);
        let merger = TransactionMerger::start(
            name.as_str(),
            env.clone(),
            changes.clone(),
            config.max_batch_size,
            runtime,
        )?;

        let database = Arc::new(Self {
            id: Uuid::new_v4(),
            name,
            config,
            env,
            merger,
            changes,
            shutdown: parent.child_token(),
            record: Mutex::new(record.clone()),
            expiration: Mutex::new(None),
            topology,
            disposed: AtomicBool::new(false),
            started_at: Utc::now(),
        });
        let cleaner = ExpiredDocumentsCleaner::load_configuration(&database, &record, None);
        *database.expiration.lock() = cleaner;

        info!(
            database = %database.name,
            id = %database.id,
            generation = database.env.generation(),
            "database opened"
        );
        Ok(database)
    }

    /// Returns the instance id; a reload gets a new one.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Returns the database name.
    #[must_use]
    pub fn name(&self) -> &DatabaseName {
        &self.name
    }

    /// Returns the configuration the instance was loaded with.
    #[must_use]
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Returns the storage environment.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Returns the transaction merger.
    #[must_use]
    pub fn merger(&self) -> &TransactionMerger {
        &self.merger
    }

    /// Returns the change notifier.
    #[must_use]
    pub fn changes(&self) -> &DocumentsChanges {
        &self.changes
    }

    /// Returns the token cancelled when the instance is disposed.
    #[must_use]
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Returns the record the instance last reconciled with.
    #[must_use]
    pub fn record(&self) -> DatabaseRecord {
        self.record.lock().clone()
    }

    /// Returns when the instance finished opening.
    #[must_use]
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Returns the running expired documents cleaner, if any.
    #[must_use]
    pub fn expiration_cleaner(&self) -> Option<Arc<ExpiredDocumentsCleaner>> {
        self.expiration.lock().clone()
    }

    /// Runs `command` through the merger.
    ///
    /// # Errors
    ///
    /// See [`TransactionMerger::enqueue`].
    pub async fn submit<C: MergedCommand>(&self, command: C) -> ServerResult<usize> {
        if self.is_disposed() {
            return Err(ServerError::InstanceUnloading {
                name: self.name.to_string(),
            });
        }
        self.merger.enqueue(command).await
    }

    /// Reads a committed document.
    ///
    /// # Errors
    ///
    /// Fails if the stored bytes are not a document.
    pub fn get_document(&self, id: &str) -> ServerResult<Option<Document>> {
        documents::read_committed(&self.env, id)
    }

    /// Subscribes to committed changes matching `filter`.
    pub fn subscribe(
        &self,
        filter: impl Fn(&DocumentChange) -> bool + Send + Sync + 'static,
    ) -> Subscription {
        self.changes.subscribe(filter)
    }

    /// Returns when the merger last finished a batch.
    #[must_use]
    pub fn last_work_time(&self) -> Instant {
        self.merger.last_work_time()
    }

    /// Returns the storage footprint in bytes.
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.env.allocated_size()
    }

    /// Returns the effective time of last activity: the later of
    /// `last_used` and the last batch, pushed forward by one millisecond per
    /// KiB of storage so large databases stay loaded longer.
    #[must_use]
    pub fn last_work(&self, last_used: Option<Instant>) -> Instant {
        let last_work = self.last_work_time();
        let latest = last_used.map_or(last_work, |used| used.max(last_work));
        latest + Duration::from_millis(self.allocated_size() / 1024)
    }

    /// Returns how long the instance has been idle. See
    /// [`last_work`](Self::last_work).
    #[must_use]
    pub fn idle_time(&self, last_used: Option<Instant>) -> Duration {
        Instant::now().saturating_duration_since(self.last_work(last_used))
    }

    /// Returns true while the merger has queued or in-flight work.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.merger.is_busy()
    }

    /// Returns true once disposal has started.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Re-reads the authoritative record and reconciles the maintenance
    /// workers with it. A missing record changes nothing; the landlord
    /// unloads removed databases.
    ///
    /// # Errors
    ///
    /// Returns the topology store's error.
    pub fn state_changed(self: &Arc<Self>) -> ServerResult<()> {
        let Some(record) = self.topology.read_record(&self.name)? else {
            return Ok(());
        };
        if record.settings != self.record.lock().settings {
            debug!(database = %self.name, "settings changed, they apply on next load");
        }

        let mut expiration = self.expiration.lock();
        let current = expiration.take();
        *expiration = ExpiredDocumentsCleaner::load_configuration(self, &record, current);
        drop(expiration);

        *self.record.lock() = record;
        debug!(database = %self.name, "database state updated");
        Ok(())
    }

    /// Stops the workers, drains the merger and closes the environment.
    /// Idempotent.
    ///
    /// # Errors
    ///
    /// Returns the error of the final storage sync.
    pub async fn dispose(self: &Arc<Self>) -> ServerResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let started = Instant::now();
        self.shutdown.cancel();
        let cleaner = self.expiration.lock().take();
        if let Some(cleaner) = cleaner {
            cleaner.worker().stop_and_wait().await;
        }

        let database = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            database.merger.dispose();
            database.env.close()
        })
        .await
        .map_err(|e| ServerError::collaborator("database dispose", e.to_string()))??;

        info!(
            database = %self.name,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "database disposed"
        );
        Ok(())
    }
}
