//! The landlord: owns every database instance of the process.
//!
//! ## Loading
//!
//! A request for a database that is not cached is validated against its
//! authoritative record, then waits for an admission token. With a token
//! in hand it inserts a construction task into the cache if the slot is
//! still vacant. Only the caller whose insert wins starts the task; a
//! loser releases its token at once and awaits the winner's task. The
//! token is held until construction ends, so at most
//! `max_concurrent_loads` databases are ever under construction.
//!
//! A failed construction removes its own cache entry so the next request
//! retries, unless the database is configured to keep failed loads for
//! inspection; such an entry is evicted by the next request instead.
//!
//! ## Unloading
//!
//! [`Landlord::unload`] disposes an idle instance and clears its cache entry
//! and last-used timestamp together. While disposal runs the slot holds a
//! disposing entry; requests for the name wait for it and then construct a
//! fresh instance. The idle sweeper unloads every instance idle longer than
//! `idle_unload_after`.
//!
//! ## Shutdown
//!
//! [`Landlord::shutdown`] takes the drain lock exclusively. Requests that
//! race with it fail fast with [`ServerError::ShuttingDown`] instead of
//! queueing behind it.

use crate::admission::{AdmissionGate, AdmissionToken};
use crate::background::BackgroundWorker;
use crate::cache::{EntryState, InstanceCache, Registration, SharedLoad};
use crate::config::{DatabaseConfig, ServerConfig};
use crate::database::DocumentDatabase;
use crate::error::{ServerError, ServerResult};
use crate::name::DatabaseName;
use crate::notifications::{DatabaseChangeKind, ServerNotificationCenter};
use crate::provider::StorageProvider;
use crate::record::{ClusterNotifier, DatabaseRecord, DeletionStatus, TopologyStore};
use crate::stats::LandlordStats;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A loaded database as handed out by the landlord.
pub type Database = Arc<DocumentDatabase>;

/// Predicate that keeps an instance loaded when it returns true.
pub type SkipPredicate<'a> = &'a (dyn Fn(&DocumentDatabase) -> bool + Sync);

/// Removes a construction's cache entry unless disarmed.
///
/// Dropped when the construction task ends, including when the task itself
/// is dropped before completing.
struct EvictOnFailure {
    landlord: Weak<Landlord>,
    key: String,
    generation: u64,
    armed: bool,
}

impl EvictOnFailure {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for EvictOnFailure {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(landlord) = self.landlord.upgrade() {
            if landlord.cache.remove_if_generation(&self.key, self.generation).is_some() {
                debug!(database = %self.key, "evicted failed construction");
            }
        }
    }
}

/// Owner of every database instance in the process.
pub struct Landlord {
    config: ServerConfig,
    topology: Arc<dyn TopologyStore>,
    cluster: Arc<dyn ClusterNotifier>,
    provider: Arc<dyn StorageProvider>,
    cache: InstanceCache<Database>,
    admission: AdmissionGate,
    notifications: ServerNotificationCenter,
    stats: LandlordStats,
    disposing: RwLock<()>,
    shutting_down: AtomicBool,
    shutdown: CancellationToken,
    deferred: Mutex<Vec<JoinHandle<()>>>,
    sweeper: Mutex<Option<BackgroundWorker>>,
}

impl std::fmt::Debug for Landlord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Landlord")
            .field("node", &self.config.node_tag)
            .field("cached", &self.cache.len())
            .field("loading", &self.admission.in_use())
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

impl Landlord {
    /// Creates a landlord. Nothing is loaded until requested.
    pub fn new(
        config: ServerConfig,
        topology: Arc<dyn TopologyStore>,
        cluster: Arc<dyn ClusterNotifier>,
        provider: Arc<dyn StorageProvider>,
    ) -> Arc<Self> {
        let admission =
            AdmissionGate::new(config.max_concurrent_loads, config.concurrent_load_timeout);
        Arc::new(Self {
            config,
            topology,
            cluster,
            provider,
            cache: InstanceCache::new(),
            admission,
            notifications: ServerNotificationCenter::default(),
            stats: LandlordStats::new(),
            disposing: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            deferred: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        })
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Returns the server-wide lifecycle notifications.
    #[must_use]
    pub fn notifications(&self) -> &ServerNotificationCenter {
        &self.notifications
    }

    /// Returns the landlord's counters.
    #[must_use]
    pub fn stats(&self) -> &LandlordStats {
        &self.stats
    }

    /// Returns the admission gate.
    #[must_use]
    pub fn admission(&self) -> &AdmissionGate {
        &self.admission
    }

    /// Returns true once shutdown has started.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Returns every loaded instance.
    #[must_use]
    pub fn loaded_databases(&self) -> Vec<Database> {
        self.cache
            .snapshot()
            .into_iter()
            .filter_map(|(_, entry)| match entry.state() {
                EntryState::Loaded(db) => Some(db),
                EntryState::Loading | EntryState::Faulted(_) => None,
            })
            .collect()
    }

    /// Returns the cache state of `name`, if it has an entry.
    #[must_use]
    pub fn database_state(&self, name: &str) -> Option<EntryState<Database>> {
        self.cache.get(&name.to_lowercase()).map(|entry| entry.state())
    }

    /// Returns the last recorded activity on `name`.
    #[must_use]
    pub fn last_used(&self, name: &str) -> Option<Instant> {
        self.cache.last_used(&name.to_lowercase())
    }

    /// Validates `name` against its authoritative record and builds its
    /// configuration.
    ///
    /// # Errors
    ///
    /// - [`ServerError::InvalidName`] for unacceptable names
    /// - [`ServerError::DatabaseNotFound`] if there is no record
    /// - [`ServerError::InstanceDisabled`], [`ServerError::InstanceBeingDeleted`]
    ///   or [`ServerError::NotRelevant`] as the record dictates
    /// - [`ServerError::InvalidSetting`] for bad record settings
    pub fn create_database_configuration(
        &self,
        name: &str,
        ignore_disabled: bool,
        ignore_being_deleted: bool,
    ) -> ServerResult<(DatabaseName, DatabaseRecord, DatabaseConfig)> {
        let name = DatabaseName::new(name)?;
        let record = self
            .topology
            .read_record(&name)?
            .ok_or_else(|| ServerError::DatabaseNotFound {
                name: name.to_string(),
            })?;
        let config =
            self.configuration_for_record(&name, &record, ignore_disabled, ignore_being_deleted)?;
        Ok((name, record, config))
    }

    fn configuration_for_record(
        &self,
        name: &DatabaseName,
        record: &DatabaseRecord,
        ignore_disabled: bool,
        ignore_being_deleted: bool,
    ) -> ServerResult<DatabaseConfig> {
        let node = &self.config.node_tag;
        if record.disabled && !ignore_disabled {
            return Err(ServerError::InstanceDisabled {
                name: name.to_string(),
            });
        }
        let being_deleted = record.deletion_on(node).is_some();
        if being_deleted && !ignore_being_deleted {
            return Err(ServerError::InstanceBeingDeleted {
                name: name.to_string(),
                node: node.clone(),
            });
        }
        if !record.is_relevant_for(node) && !being_deleted {
            return Err(ServerError::NotRelevant {
                name: name.to_string(),
                node: node.clone(),
            });
        }
        self.config.database_config(name, &record.settings)
    }

    /// Returns the loaded instance of `name`, loading it if needed.
    ///
    /// # Errors
    ///
    /// Returns the validation, admission or construction error. Every
    /// caller awaiting the same construction sees the same error.
    pub async fn get_or_create(self: &Arc<Self>, name: &str) -> ServerResult<Database> {
        self.try_get_or_create(name, false).await?.await
    }

    /// Like [`get_or_create`](Self::get_or_create) but gives up after
    /// `database_load_timeout`. The load goes on in the background.
    ///
    /// # Errors
    ///
    /// [`ServerError::DatabaseLoadTimeout`] when the wait runs out, plus
    /// every error of `get_or_create`.
    pub async fn get_database(self: &Arc<Self>, name: &str) -> ServerResult<Database> {
        let load = self.try_get_or_create(name, false).await?;
        let timeout = self.config.database_load_timeout;
        match tokio::time::timeout(timeout, load).await {
            Ok(result) => result,
            Err(_) => Err(ServerError::DatabaseLoadTimeout {
                name: name.to_string(),
                timeout,
            }),
        }
    }

    /// Returns the shared construction task of `name`, starting one if
    /// there is none. The returned future resolves to the instance.
    ///
    /// # Errors
    ///
    /// Fails without a task when the landlord is shutting down, validation
    /// fails, or no admission token frees up in time.
    #[instrument(skip(self), level = "debug")]
    pub async fn try_get_or_create(
        self: &Arc<Self>,
        name: &str,
        ignore_disabled: bool,
    ) -> ServerResult<SharedLoad<Database>> {
        let _drain = self.disposing.try_read().map_err(|_| ServerError::ShuttingDown)?;
        if self.is_shutting_down() {
            return Err(ServerError::ShuttingDown);
        }

        let key = name.to_lowercase();
        while let Some(entry) = self.cache.get(&key) {
            if entry.is_disposing() {
                debug!(database = name, "waiting for the previous instance to be disposed");
                let _ = entry.task().await;
                self.cache.remove_if_generation(&key, entry.generation());
                continue;
            }
            match entry.state() {
                EntryState::Loaded(_) => {
                    self.cache.touch(&key);
                    return Ok(entry.task());
                }
                EntryState::Loading => return Ok(entry.task()),
                EntryState::Faulted(e) => {
                    debug!(database = name, error = %e, "evicting faulted entry before retrying");
                    self.cache.remove_if_generation(&key, entry.generation());
                    break;
                }
            }
        }

        let (name, record, config) =
            self.create_database_configuration(name, ignore_disabled, false)?;
        let token = match self.admission.acquire(&name, &self.shutdown).await {
            Ok(token) => token,
            Err(e) => {
                if matches!(e, ServerError::ConcurrentLoadTimeout { .. }) {
                    self.stats.record_admission_timeout();
                    warn!(database = %name, "timed out waiting for a concurrent load slot");
                }
                return Err(e);
            }
        };

        match self
            .cache
            .register(&key, |generation| self.construct(name, record, config, token, generation))
        {
            Registration::Registered(entry) => {
                let task = entry.task();
                tokio::spawn(task.clone().map(drop));
                Ok(task)
            }
            // The token moved into the unused closure and is already released.
            Registration::Existing(entry) => Ok(entry.task()),
        }
    }

    fn construct(
        self: &Arc<Self>,
        name: DatabaseName,
        record: DatabaseRecord,
        config: DatabaseConfig,
        token: AdmissionToken,
        generation: u64,
    ) -> SharedLoad<Database> {
        let landlord = Arc::downgrade(self);
        let topology = Arc::clone(&self.topology);
        let provider = Arc::clone(&self.provider);
        let shutdown = self.shutdown.clone();
        async move {
            let _token = token;
            let mut evict = EvictOnFailure {
                landlord: landlord.clone(),
                key: name.key().to_string(),
                generation,
                armed: true,
            };
            let keep_failed_load = config.keep_failed_load;
            let started = Instant::now();

            let opened = {
                let (name, config) = (name.clone(), config.clone());
                let open =
                    tokio::task::spawn_blocking(move || provider.open_storage(&name, &config));
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => Err(ServerError::ShuttingDown),
                    joined = open => joined.unwrap_or_else(|e| {
                        Err(ServerError::collaborator("storage provider", e.to_string()))
                    }),
                }
            };
            let result = opened.and_then(|env| {
                DocumentDatabase::open(name.clone(), config, record, env, topology, &shutdown)
            });

            let Some(landlord) = landlord.upgrade() else {
                return Err(ServerError::ShuttingDown);
            };
            match result {
                Ok(database) => {
                    evict.disarm();
                    landlord.stats.record_load();
                    landlord.cache.touch(name.key());
                    landlord.notifications.add(name.as_str(), DatabaseChangeKind::Load);
                    info!(
                        database = %name,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "database loaded"
                    );
                    Ok(database)
                }
                Err(ServerError::ShuttingDown) => Err(ServerError::ShuttingDown),
                Err(e) => {
                    landlord.stats.record_load_failure();
                    if keep_failed_load {
                        evict.disarm();
                    }
                    warn!(
                        database = %name,
                        error = %e,
                        keep_failed_load,
                        "failed to load database"
                    );
                    Err(match e {
                        ServerError::LoadFailure { .. } => e,
                        other => ServerError::load_failure(name.as_str(), other),
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Disposes the loaded instance of `name`.
    ///
    /// Nothing happens if it was active within `min_idle`, if `should_skip`
    /// returns true, or if it is not loaded. A faulted entry is just
    /// removed. Returns true if an instance was disposed.
    ///
    /// # Errors
    ///
    /// [`ServerError::StillLoading`] while the instance is under
    /// construction.
    #[instrument(skip(self, should_skip), level = "debug")]
    pub async fn unload(
        &self,
        name: &str,
        min_idle: Option<Duration>,
        should_skip: Option<SkipPredicate<'_>>,
    ) -> ServerResult<bool> {
        let key = name.to_lowercase();
        let Some(entry) = self.cache.get(&key) else {
            self.cache.remove(&key);
            return Ok(false);
        };
        if entry.is_disposing() {
            let _ = entry.task().await;
            self.cache.remove_if_generation(&key, entry.generation());
            return Ok(false);
        }
        let database = match entry.state() {
            EntryState::Loaded(database) => database,
            EntryState::Faulted(_) => {
                self.cache.remove_if_generation(&key, entry.generation());
                return Ok(false);
            }
            EntryState::Loading => {
                return Err(ServerError::StillLoading {
                    name: name.to_string(),
                })
            }
        };

        if let Some(min_idle) = min_idle {
            if database.is_busy() || database.idle_time(self.cache.last_used(&key)) < min_idle {
                return Ok(false);
            }
        }
        if should_skip.is_some_and(|skip| skip(&*database)) {
            return Ok(false);
        }
        // The slot stays occupied until the storage is released, so a
        // concurrent request waits instead of opening over it.
        let disposal = || dispose_in_place(Arc::clone(&database));
        let Some(disposing) = self.cache.begin_disposal(&key, entry.generation(), disposal) else {
            return Ok(false);
        };
        tokio::spawn(disposing.task().map(drop));
        let _ = disposing.task().await;
        self.cache.remove_if_generation(&key, disposing.generation());

        self.stats.record_unload();
        info!(database = %database.name(), "database unloaded");
        Ok(true)
    }

    /// Unloads `name`, waiting for an in-flight construction first.
    async fn unload_now(&self, name: &str) -> ServerResult<()> {
        match self.unload(name, None, None).await {
            Err(ServerError::StillLoading { .. }) => {
                if let Some(entry) = self.cache.get(&name.to_lowercase()) {
                    let _ = entry.task().await;
                }
                self.unload(name, None, None).await.map(drop)
            }
            other => other.map(drop),
        }
    }

    /// Unloads every instance idle for at least `min_idle`. Returns how
    /// many were disposed.
    pub async fn unload_idle(&self, min_idle: Duration) -> usize {
        let mut unloaded = 0;
        for (name, entry) in self.cache.snapshot() {
            if !matches!(entry.state(), EntryState::Loaded(_)) {
                continue;
            }
            match self.unload(&name, Some(min_idle), None).await {
                Ok(true) => unloaded += 1,
                Ok(false) => {}
                Err(e) => debug!(database = %name, error = %e, "skipped idle unload"),
            }
        }
        if unloaded > 0 {
            info!(unloaded, "unloaded idle databases");
        }
        unloaded
    }

    /// Starts the periodic idle sweep. Returns false if already started.
    pub fn start_idle_sweeper(self: &Arc<Self>) -> bool {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return false;
        }
        let worker = BackgroundWorker::new(
            "idle-sweeper",
            self.config.idle_sweep_interval,
            &self.shutdown,
        );
        let landlord = Arc::downgrade(self);
        let min_idle = self.config.idle_unload_after;
        worker.start(move |_| {
            let landlord = landlord.clone();
            async move {
                if let Some(landlord) = landlord.upgrade() {
                    landlord.unload_idle(min_idle).await;
                }
                Ok(())
            }
        });
        *sweeper = Some(worker);
        true
    }

    /// Reacts to a change of the authoritative record of `name`.
    ///
    /// - record removed or database disabled: unload
    /// - deletion in progress on this node: unload, delete the files on a
    ///   hard delete, announce the removal and tell the leader
    /// - otherwise, a loaded instance re-reads its record; a loading one
    ///   does so once loaded
    ///
    /// # Errors
    ///
    /// Returns topology store errors and file deletion errors.
    #[instrument(skip(self))]
    pub async fn on_topology_changed(&self, name: &str) -> ServerResult<()> {
        let database_name = DatabaseName::new(name)?;
        let Some(record) = self.topology.read_record(&database_name)? else {
            return self.unload_now(name).await;
        };

        let node = self.config.node_tag.clone();
        if let Some(status) = record.deletion_on(&node) {
            self.unload_now(name).await?;
            if status == DeletionStatus::HardDelete {
                let config = self.configuration_for_record(&database_name, &record, true, true)?;
                let provider = Arc::clone(&self.provider);
                let target = database_name.clone();
                tokio::task::spawn_blocking(move || provider.delete_storage(&target, &config))
                    .await
                    .map_err(|e| ServerError::collaborator("storage provider", e.to_string()))??;
                info!(database = %database_name, "database files deleted");
            }
            self.notifications.add(database_name.as_str(), DatabaseChangeKind::Delete);
            self.notify_leader_removed(&database_name, &node);
            return Ok(());
        }

        if !record.is_relevant_for(&node) {
            return Ok(());
        }
        if record.disabled {
            return self.unload_now(name).await;
        }

        let Some(entry) = self.cache.get(database_name.key()) else {
            return Ok(());
        };
        match entry.state() {
            EntryState::Loaded(database) => notify_state_change(&database),
            EntryState::Loading => {
                let task = entry.task();
                let handle = tokio::spawn(async move {
                    if let Ok(database) = task.await {
                        notify_state_change(&database);
                    }
                });
                self.track(handle);
            }
            EntryState::Faulted(_) => {}
        }
        Ok(())
    }

    fn notify_leader_removed(&self, name: &DatabaseName, node: &str) {
        let notify = self.cluster.notify_leader_removed(name, node);
        let (name, node) = (name.to_string(), node.to_string());
        tokio::spawn(async move {
            if let Err(e) = notify.await {
                warn!(database = %name, node, error = %e, "failed to notify leader about removal");
            }
        });
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut deferred = self.deferred.lock();
        deferred.retain(|h| !h.is_finished());
        deferred.push(handle);
    }

    /// Waits for deferred disposals and deferred state-change
    /// notifications to finish.
    pub async fn wait_deferred(&self) {
        let handles = std::mem::take(&mut *self.deferred.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "deferred task failed");
            }
        }
    }

    /// Disposes every instance and refuses new requests.
    ///
    /// Loaded instances are disposed `dispose_parallelism` at a time. An
    /// instance still loading is disposed once its load completes; see
    /// [`wait_deferred`](Self::wait_deferred). Idempotent.
    ///
    /// # Errors
    ///
    /// [`ServerError::DisposeFailed`] listing every instance that failed to
    /// dispose, after all of them were attempted.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> ServerResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let started = Instant::now();
        self.shutdown.cancel();
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.stop_and_wait().await;
        }

        let _drain = self.disposing.write().await;
        let mut loaded = Vec::new();
        for (name, entry) in self.cache.drain() {
            match entry.state() {
                EntryState::Loaded(database) => loaded.push(database),
                EntryState::Loading => {
                    let task = entry.task();
                    self.track(tokio::spawn(async move {
                        if let Ok(database) = task.await {
                            if let Err(e) = database.dispose().await {
                                warn!(
                                    database = %name,
                                    error = %e,
                                    "failure in deferred disposal of a database"
                                );
                            }
                        }
                    }));
                }
                EntryState::Faulted(_) => {}
            }
        }

        let count = loaded.len();
        let errors: Vec<(String, String)> = futures::stream::iter(loaded)
            .map(|database| async move {
                let result = database.dispose().await;
                (database.name().to_string(), result)
            })
            .buffer_unordered(self.config.dispose_parallelism.max(1))
            .filter_map(|(name, result)| async move {
                let e = result.err()?;
                warn!(database = %name, error = %e, "failed to dispose database");
                Some((name, e.to_string()))
            })
            .collect()
            .await;
        self.admission.close();

        info!(
            disposed = count - errors.len(),
            failed = errors.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "landlord shut down"
        );
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServerError::DisposeFailed { errors })
        }
    }
}

/// Disposes `database` and resolves to [`ServerError::InstanceUnloading`]
/// for anyone who reached its cache slot meanwhile.
fn dispose_in_place(database: Database) -> SharedLoad<Database> {
    async move {
        if let Err(e) = database.dispose().await {
            warn!(database = %database.name(), error = %e, "could not dispose database");
        }
        Err(ServerError::InstanceUnloading {
            name: database.name().to_string(),
        })
    }
    .boxed()
    .shared()
}

fn notify_state_change(database: &Database) {
    if let Err(e) = database.state_changed() {
        warn!(database = %database.name(), error = %e, "failed to update database about new state");
    }
}
