//! The storage environment of one database.
//!
//! An [`Environment`] owns the journal backend, the committed table state
//! that readers see, and a flusher thread that performs durability writes.
//!
//! ```text
//!   writer path                         flusher thread
//!   ───────────                         ──────────────
//!   WriteTransaction (gen N)
//!     └─ begin_async_commit_and_start_new()
//!          ├─ append record N ──────▶   flush (+ sync) record N
//!          └─ WriteTransaction (N+1)    publish N to readers
//!               chained after N         reply to AsyncCommit N
//! ```
//!
//! Committed state is published only after the durability write of its
//! record has finished. A failed durability write truncates the journal back
//! to its last durable length and fails the environment: every later commit
//! returns [`StorageError::Failed`] until the database is reopened.

use crate::backend::StorageBackend;
use crate::dir::DatabaseDir;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::journal::{self, JournalRecord};
use crate::memory::InMemoryBackend;
use crate::transaction::{AsyncCommit, WriteSet, WriteTransaction};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Committed tables: table name → ordered key/value map.
pub(crate) type Tables = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

/// Options for opening an environment.
#[derive(Debug, Clone)]
pub struct EnvironmentOptions {
    /// Name used in thread names and log fields.
    pub name: String,
    /// Whether each durability write ends with an `fsync`.
    pub sync_on_commit: bool,
}

impl EnvironmentOptions {
    /// Creates options for the named database with `fsync` on commit.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sync_on_commit: true,
        }
    }

    /// Sets whether durability writes `fsync`.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }
}

/// A durability write queued for the flusher thread.
pub(crate) struct FlushJob {
    pub(crate) generation: u64,
    pub(crate) writes: Option<Arc<WriteSet>>,
    pub(crate) start_len: u64,
    pub(crate) end_len: u64,
    pub(crate) reply: Sender<StorageResult<u64>>,
}

pub(crate) struct EnvInner {
    name: String,
    sync_on_commit: bool,
    backend: Mutex<Box<dyn StorageBackend>>,
    committed: RwLock<Tables>,
    published_generation: AtomicU64,
    next_generation: AtomicU64,
    durable_len: AtomicU64,
    failure: Mutex<Option<String>>,
    writer_active: AtomicBool,
    closed: AtomicBool,
    flusher: Mutex<Option<Sender<FlushJob>>>,
    flusher_thread: Mutex<Option<JoinHandle<()>>>,
    dir: Mutex<Option<DatabaseDir>>,
}

/// Handle to an open storage environment. Clones share the environment.
#[derive(Clone)]
pub struct Environment {
    pub(crate) inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("name", &self.inner.name)
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl Environment {
    /// Opens an environment over `backend`, replaying its journal.
    ///
    /// A torn or corrupt tail is truncated away before the environment is
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal cannot be read or truncated, or the
    /// flusher thread cannot be spawned.
    pub fn open(
        backend: Box<dyn StorageBackend>,
        options: EnvironmentOptions,
    ) -> StorageResult<Self> {
        Self::open_inner(backend, options, None)
    }

    /// Opens a fresh, empty in-memory environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the flusher thread cannot be spawned.
    pub fn open_in_memory(options: EnvironmentOptions) -> StorageResult<Self> {
        Self::open(Box::new(InMemoryBackend::new()), options)
    }

    /// Opens the environment stored in database directory `path`.
    ///
    /// The directory is created if missing and stays locked until the
    /// environment is closed or its last handle is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] if another environment holds the
    /// directory, or any error from [`Environment::open`].
    pub fn open_dir(path: &Path, options: EnvironmentOptions) -> StorageResult<Self> {
        let dir = DatabaseDir::open(path)?;
        let backend = FileBackend::open(&dir.journal_path())?;
        Self::open_inner(Box::new(backend), options, Some(dir))
    }

    fn open_inner(
        mut backend: Box<dyn StorageBackend>,
        options: EnvironmentOptions,
        dir: Option<DatabaseDir>,
    ) -> StorageResult<Self> {
        let scan = journal::scan(backend.as_ref())?;
        if scan.torn_tail {
            backend.truncate(scan.valid_len)?;
            backend.sync()?;
        }

        let mut tables = Tables::new();
        let mut generation = 0;
        for record in &scan.records {
            apply_record(&mut tables, record);
            generation = record.generation;
        }
        debug!(
            database = %options.name,
            records = scan.records.len(),
            generation,
            "journal replayed"
        );

        let (sender, receiver) = mpsc::channel();
        let inner = Arc::new(EnvInner {
            name: options.name,
            sync_on_commit: options.sync_on_commit,
            backend: Mutex::new(backend),
            committed: RwLock::new(tables),
            published_generation: AtomicU64::new(generation),
            next_generation: AtomicU64::new(generation + 1),
            durable_len: AtomicU64::new(scan.valid_len),
            failure: Mutex::new(None),
            writer_active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flusher: Mutex::new(Some(sender)),
            flusher_thread: Mutex::new(None),
            dir: Mutex::new(dir),
        });

        let weak = Arc::downgrade(&inner);
        let handle = std::thread::Builder::new()
            .name(format!("tenantdb-flush-{}", inner.name))
            .spawn(move || run_flusher(weak, receiver))?;
        *inner.flusher_thread.lock() = Some(handle);

        Ok(Self { inner })
    }

    /// Returns the database name this environment was opened for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the generation of the newest published commit.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.published_generation.load(Ordering::Acquire)
    }

    /// Returns the durable journal length in bytes.
    #[must_use]
    pub fn allocated_size(&self) -> u64 {
        self.inner.durable_len.load(Ordering::Acquire)
    }

    /// Returns the failure that poisoned the environment, if any.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        self.inner.failure.lock().clone()
    }

    /// Returns true once [`Environment::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Begins the single write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::WriterActive`] if a write transaction is
    /// already open, or [`StorageError::Closed`].
    pub fn begin_write(&self) -> StorageResult<WriteTransaction> {
        self.inner.ensure_open()?;
        if self
            .inner
            .writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StorageError::WriterActive);
        }
        Ok(WriteTransaction::new(self.clone(), Vec::new()))
    }

    /// Reads a committed value.
    #[must_use]
    pub fn get(&self, table: &str, key: &str) -> Option<Vec<u8>> {
        self.inner
            .committed
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    /// Returns committed entries of `table` with keys in `[start, end)`, in
    /// key order, at most `limit` of them.
    #[must_use]
    pub fn range(
        &self,
        table: &str,
        start: &str,
        end: &str,
        limit: usize,
    ) -> Vec<(String, Vec<u8>)> {
        let committed = self.inner.committed.read();
        let Some(entries) = committed.get(table) else {
            return Vec::new();
        };
        entries
            .range::<str, _>((Bound::Included(start), Bound::Excluded(end)))
            .take(limit)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns the number of committed keys in `table`.
    #[must_use]
    pub fn count(&self, table: &str) -> usize {
        self.inner.committed.read().get(table).map_or(0, BTreeMap::len)
    }

    /// Returns the names of all tables holding at least one key.
    #[must_use]
    pub fn tables(&self) -> Vec<String> {
        self.inner.committed.read().keys().cloned().collect()
    }

    /// Drains queued durability writes, stops the flusher and syncs the journal.
    ///
    /// The directory lock, if any, is released. Idempotent. Commits started
    /// afterwards fail with [`StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final sync fails.
    pub fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        drop(self.inner.flusher.lock().take());
        if let Some(handle) = self.inner.flusher_thread.lock().take() {
            if handle.join().is_err() {
                error!(database = %self.inner.name, "journal flusher panicked");
            }
        }
        let synced = if self.inner.failure.lock().is_none() {
            let mut backend = self.inner.backend.lock();
            backend.flush().and_then(|()| backend.sync())
        } else {
            Ok(())
        };
        drop(self.inner.dir.lock().take());
        info!(database = %self.inner.name, generation = self.generation(), "environment closed");
        synced
    }

    /// Appends the record for `writes` and queues its durability write.
    pub(crate) fn start_commit(
        &self,
        writes: WriteSet,
    ) -> StorageResult<(AsyncCommit, Option<(u64, Arc<WriteSet>)>)> {
        self.inner.ensure_usable()?;
        let (reply, receiver) = mpsc::channel();

        if writes.is_empty() {
            let len = self.inner.durable_len.load(Ordering::Acquire);
            self.inner.enqueue(FlushJob {
                generation: 0,
                writes: None,
                start_len: len,
                end_len: len,
                reply,
            })?;
            return Ok((AsyncCommit::new(receiver), None));
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::AcqRel);
        let record = writes.to_record(generation);
        let bytes = record.encode()?;
        let (start_len, end_len) = {
            let mut backend = self.inner.backend.lock();
            let start = backend.size()?;
            if let Err(e) = backend.append(&bytes) {
                let _ = backend.truncate(start);
                drop(backend);
                self.inner.poison(&e);
                return Err(e);
            }
            (start, start + bytes.len() as u64)
        };

        let writes = Arc::new(writes);
        self.inner.enqueue(FlushJob {
            generation,
            writes: Some(Arc::clone(&writes)),
            start_len,
            end_len,
            reply,
        })?;
        Ok((AsyncCommit::new(receiver), Some((generation, writes))))
    }

    pub(crate) fn release_writer(&self) {
        self.inner.writer_active.store(false, Ordering::Release);
    }

    pub(crate) fn read_committed(&self, table: &str, key: &str) -> Option<Vec<u8>> {
        self.get(table, key)
    }
}

impl EnvInner {
    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }
        Ok(())
    }

    fn ensure_usable(&self) -> StorageResult<()> {
        self.ensure_open()?;
        match self.failure.lock().as_ref() {
            Some(reason) => Err(StorageError::failed(reason.clone())),
            None => Ok(()),
        }
    }

    fn enqueue(&self, job: FlushJob) -> StorageResult<()> {
        match self.flusher.lock().as_ref() {
            Some(sender) => sender.send(job).map_err(|_| StorageError::Closed),
            None => Err(StorageError::Closed),
        }
    }

    fn poison(&self, cause: &StorageError) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            error!(
                database = %self.name,
                error = %cause,
                "durability write failed, environment refuses further commits"
            );
            *failure = Some(cause.to_string());
        }
    }

    fn complete(&self, job: &FlushJob) -> StorageResult<u64> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(StorageError::failed(reason));
        }
        let Some(writes) = job.writes.as_ref() else {
            return Ok(self.published_generation.load(Ordering::Acquire));
        };

        let flushed = {
            let mut backend = self.backend.lock();
            let result = backend.flush().and_then(|()| {
                if self.sync_on_commit {
                    backend.sync()
                } else {
                    Ok(())
                }
            });
            if result.is_err() {
                // Later records were appended after this one; all of them go.
                if let Err(e) = backend.truncate(job.start_len) {
                    error!(database = %self.name, error = %e, "failed to roll back journal tail");
                }
            }
            result
        };

        match flushed {
            Ok(()) => {
                {
                    let mut committed = self.committed.write();
                    writes.apply_to(&mut committed);
                }
                self.published_generation.store(job.generation, Ordering::Release);
                self.durable_len.store(job.end_len, Ordering::Release);
                Ok(job.generation)
            }
            Err(e) => {
                self.poison(&e);
                Err(e)
            }
        }
    }
}

fn run_flusher(env: Weak<EnvInner>, jobs: Receiver<FlushJob>) {
    while let Ok(job) = jobs.recv() {
        let result = match env.upgrade() {
            Some(inner) => inner.complete(&job),
            None => Err(StorageError::Closed),
        };
        let _ = job.reply.send(result);
    }
}

fn apply_record(tables: &mut Tables, record: &JournalRecord) {
    for write in &record.writes {
        match &write.value {
            Some(value) => {
                tables
                    .entry(write.table.clone())
                    .or_default()
                    .insert(write.key.clone(), value.clone());
            }
            None => {
                if let Some(table) = tables.get_mut(&write.table) {
                    table.remove(&write.key);
                    if table.is_empty() {
                        tables.remove(&write.table);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> EnvironmentOptions {
        EnvironmentOptions::new("test").sync_on_commit(false)
    }

    #[test]
    fn commit_publishes_after_durability() {
        let env = Environment::open_in_memory(options()).unwrap();
        let mut tx = env.begin_write().unwrap();
        tx.put("docs", "a", b"1".to_vec());
        assert_eq!(env.get("docs", "a"), None);

        let generation = tx.commit().unwrap();
        assert_eq!(generation, 1);
        assert_eq!(env.get("docs", "a"), Some(b"1".to_vec()));
        assert_eq!(env.generation(), 1);
    }

    #[test]
    fn single_writer() {
        let env = Environment::open_in_memory(options()).unwrap();
        let tx = env.begin_write().unwrap();
        assert!(matches!(env.begin_write(), Err(StorageError::WriterActive)));
        drop(tx);
        assert!(env.begin_write().is_ok());
    }

    #[test]
    fn reopen_replays_journal() {
        let backend = InMemoryBackend::new();
        {
            let env = Environment::open(Box::new(backend.clone()), options()).unwrap();
            let mut tx = env.begin_write().unwrap();
            tx.put("docs", "a", b"1".to_vec());
            tx.put("docs", "b", b"2".to_vec());
            tx.commit().unwrap();

            let mut tx = env.begin_write().unwrap();
            tx.delete("docs", "a");
            tx.commit().unwrap();
            env.close().unwrap();
        }

        let env = Environment::open(Box::new(backend), options()).unwrap();
        assert_eq!(env.generation(), 2);
        assert_eq!(env.get("docs", "a"), None);
        assert_eq!(env.get("docs", "b"), Some(b"2".to_vec()));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let backend = InMemoryBackend::new();
        {
            let env = Environment::open(Box::new(backend.clone()), options()).unwrap();
            let mut tx = env.begin_write().unwrap();
            tx.put("docs", "a", b"1".to_vec());
            tx.commit().unwrap();
        }
        let durable = backend.size().unwrap();
        let mut torn = backend.clone();
        torn.append(b"TJNL\x01\x00garbage").unwrap();

        let env = Environment::open(Box::new(backend.clone()), options()).unwrap();
        assert_eq!(env.allocated_size(), durable);
        assert_eq!(backend.size().unwrap(), durable);
        assert_eq!(env.get("docs", "a"), Some(b"1".to_vec()));
    }

    #[test]
    fn range_is_ordered_and_bounded() {
        let env = Environment::open_in_memory(options()).unwrap();
        let mut tx = env.begin_write().unwrap();
        for key in ["b", "a", "d", "c"] {
            tx.put("idx", key, key.as_bytes().to_vec());
        }
        tx.commit().unwrap();

        let keys: Vec<_> = env
            .range("idx", "a", "d", 10)
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, ["a", "b", "c"]);
        assert_eq!(env.range("idx", "a", "z", 2).len(), 2);
        assert_eq!(env.count("idx"), 4);
    }

    #[test]
    fn closed_environment_refuses_writes() {
        let env = Environment::open_in_memory(options()).unwrap();
        env.close().unwrap();
        env.close().unwrap();
        assert!(matches!(env.begin_write(), Err(StorageError::Closed)));
    }
}
