//! Write transactions and asynchronous commits.

use crate::environment::{Environment, Tables};
use crate::error::{StorageError, StorageResult};
use crate::journal::{JournalRecord, JournalWrite};
use std::collections::BTreeMap;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

/// Buffered writes of one transaction: table → key → new value (`None` deletes).
#[derive(Debug, Default, Clone)]
pub struct WriteSet {
    tables: BTreeMap<String, BTreeMap<String, Option<Vec<u8>>>>,
    len: usize,
}

impl WriteSet {
    /// Returns true if nothing was written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of distinct keys written.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    fn set(&mut self, table: &str, key: &str, value: Option<Vec<u8>>) {
        let entries = self.tables.entry(table.to_string()).or_default();
        if entries.insert(key.to_string(), value).is_none() {
            self.len += 1;
        }
    }

    /// `Some(None)` means the key was deleted in this set.
    fn lookup(&self, table: &str, key: &str) -> Option<Option<&Vec<u8>>> {
        self.tables
            .get(table)
            .and_then(|t| t.get(key))
            .map(Option::as_ref)
    }

    pub(crate) fn to_record(&self, generation: u64) -> JournalRecord {
        let writes = self
            .tables
            .iter()
            .flat_map(|(table, entries)| {
                entries.iter().map(move |(key, value)| JournalWrite {
                    table: table.clone(),
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect();
        JournalRecord { generation, writes }
    }

    pub(crate) fn apply_to(&self, committed: &mut Tables) {
        for (table, entries) in &self.tables {
            for (key, value) in entries {
                match value {
                    Some(value) => {
                        committed
                            .entry(table.clone())
                            .or_default()
                            .insert(key.clone(), value.clone());
                    }
                    None => {
                        if let Some(existing) = committed.get_mut(table) {
                            existing.remove(key);
                        }
                    }
                }
            }
            if committed.get(table).is_some_and(BTreeMap::is_empty) {
                committed.remove(table);
            }
        }
    }
}

/// The single write transaction of an environment.
///
/// Reads see this transaction's own writes, then the writes of every
/// earlier transaction in its chain whose durability write is still in
/// flight, then committed state. Dropping the transaction discards its
/// writes.
pub struct WriteTransaction {
    env: Environment,
    writes: WriteSet,
    /// Pending predecessors, oldest first.
    parents: Vec<(u64, Arc<WriteSet>)>,
    owns_writer: bool,
}

impl std::fmt::Debug for WriteTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteTransaction")
            .field("env", &self.env.name())
            .field("writes", &self.writes.len())
            .field("pending_parents", &self.parents.len())
            .finish()
    }
}

impl WriteTransaction {
    pub(crate) fn new(env: Environment, parents: Vec<(u64, Arc<WriteSet>)>) -> Self {
        Self {
            env,
            writes: WriteSet::default(),
            parents,
            owns_writer: true,
        }
    }

    /// Returns the environment this transaction writes to.
    #[must_use]
    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Writes `value` under `key` in `table`.
    pub fn put(&mut self, table: &str, key: &str, value: Vec<u8>) {
        self.writes.set(table, key, Some(value));
    }

    /// Removes `key` from `table`.
    pub fn delete(&mut self, table: &str, key: &str) {
        self.writes.set(table, key, None);
    }

    /// Reads `key` from `table` as this transaction sees it.
    #[must_use]
    pub fn get(&self, table: &str, key: &str) -> Option<Vec<u8>> {
        if let Some(value) = self.writes.lookup(table, key) {
            return value.cloned();
        }
        for (_, parent) in self.parents.iter().rev() {
            if let Some(value) = parent.lookup(table, key) {
                return value.cloned();
            }
        }
        self.env.read_committed(table, key)
    }

    /// Returns the number of keys this transaction has written.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Returns the number of chained predecessors not yet known to be published.
    #[must_use]
    pub fn pending_parents(&self) -> usize {
        self.parents.len()
    }

    /// Commits and waits for the durability write. Returns the generation
    /// now visible to readers.
    ///
    /// # Errors
    ///
    /// Returns the durability error, or [`StorageError::Failed`] if the
    /// environment was already failed.
    pub fn commit(mut self) -> StorageResult<u64> {
        let writes = std::mem::take(&mut self.writes);
        let (commit, _) = self.env.start_commit(writes)?;
        // The writer stays held until the record is published.
        commit.wait()
    }

    /// Queues this transaction's durability write and returns a new write
    /// transaction chained after it.
    ///
    /// The new transaction reads this one's writes before they are
    /// published. The durability write runs on the environment's flusher
    /// thread; [`AsyncCommit::wait`] reports its outcome. An empty
    /// transaction still queues a job so its completion orders after every
    /// earlier commit.
    ///
    /// # Errors
    ///
    /// Fails if the environment is closed or failed, or the append fails.
    /// The writer is released in that case.
    pub fn begin_async_commit_and_start_new(
        mut self,
    ) -> StorageResult<(AsyncCommit, WriteTransaction)> {
        let writes = std::mem::take(&mut self.writes);
        let (commit, layer) = self.env.start_commit(writes)?;

        let published = self.env.generation();
        let mut parents = std::mem::take(&mut self.parents);
        parents.retain(|(generation, _)| *generation > published);
        if let Some(layer) = layer {
            parents.push(layer);
        }

        self.owns_writer = false;
        let next = WriteTransaction::new(self.env.clone(), parents);
        Ok((commit, next))
    }
}

impl Drop for WriteTransaction {
    fn drop(&mut self) {
        if self.owns_writer {
            self.env.release_writer();
        }
    }
}

/// The outcome of a queued durability write.
#[derive(Debug)]
pub struct AsyncCommit {
    receiver: Receiver<StorageResult<u64>>,
}

impl AsyncCommit {
    pub(crate) fn new(receiver: Receiver<StorageResult<u64>>) -> Self {
        Self { receiver }
    }

    /// Blocks until the durability write finishes. Returns the published
    /// generation.
    ///
    /// # Errors
    ///
    /// Returns the durability error, or [`StorageError::Closed`] if the
    /// flusher stopped before answering.
    pub fn wait(self) -> StorageResult<u64> {
        self.receiver.recv().map_err(|_| StorageError::Closed)?
    }
}
