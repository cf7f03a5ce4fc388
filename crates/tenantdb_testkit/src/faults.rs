//! Collaborators that block, count or fail on demand.
//!
//! Storage providers are called on blocking threads, so every provider here
//! synchronizes with `parking_lot` primitives rather than async ones. A
//! test that closes a [`GatedProvider`] must release it before the runtime
//! shuts down; the gate reopens by itself after [`GATE_SAFETY_TIMEOUT`].

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenantdb_server::{
    ClusterNotifier, DatabaseConfig, DatabaseName, InMemoryStorageProvider, ServerError,
    ServerResult, StorageProvider,
};
use tenantdb_storage::{
    Environment, EnvironmentOptions, InMemoryBackend, StorageBackend, StorageError, StorageResult,
};

/// Longest time a closed gate holds an open.
pub const GATE_SAFETY_TIMEOUT: Duration = Duration::from_secs(30);

/// An in-memory provider whose opens block until the gate is released.
///
/// Counts every open and the highest number of opens in progress at once.
#[derive(Debug, Default)]
pub struct GatedProvider {
    inner: InMemoryStorageProvider,
    released: Mutex<bool>,
    changed: Condvar,
    opens: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl GatedProvider {
    /// Creates a provider whose opens block until [`release`](Self::release).
    #[must_use]
    pub fn closed() -> Self {
        Self::default()
    }

    /// Creates a provider whose opens pass straight through.
    #[must_use]
    pub fn released() -> Self {
        let provider = Self::default();
        provider.release();
        provider
    }

    /// Lets every blocked and future open proceed.
    pub fn release(&self) {
        *self.released.lock() = true;
        self.changed.notify_all();
    }

    /// Makes future opens block again.
    pub fn close(&self) {
        *self.released.lock() = false;
    }

    /// Number of opens started.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of opens currently blocked or running.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of opens ever in progress at once.
    pub fn max_concurrent(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Polls until `count` opens are in progress. Returns false on timeout.
    pub async fn wait_for_active(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.active() < count {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn wait_released(&self) {
        let deadline = Instant::now() + GATE_SAFETY_TIMEOUT;
        let mut released = self.released.lock();
        while !*released {
            if self.changed.wait_until(&mut released, deadline).timed_out() {
                tracing::warn!("gate was never released, letting the open through");
                break;
            }
        }
    }
}

impl StorageProvider for GatedProvider {
    fn open_storage(
        &self,
        name: &DatabaseName,
        config: &DatabaseConfig,
    ) -> ServerResult<Environment> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        self.wait_released();
        let result = self.inner.open_storage(name, config);
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn delete_storage(&self, name: &DatabaseName, config: &DatabaseConfig) -> ServerResult<()> {
        self.inner.delete_storage(name, config)
    }
}

/// An in-memory backend whose flushes fail while a shared switch is on.
#[derive(Debug, Clone)]
pub struct FlakyBackend {
    inner: InMemoryBackend,
    fail: Arc<AtomicBool>,
}

impl FlakyBackend {
    /// Wraps `inner`; flushes fail while `fail` is true.
    pub fn new(inner: InMemoryBackend, fail: Arc<AtomicBool>) -> Self {
        Self { inner, fail }
    }
}

impl StorageBackend for FlakyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other("injected flush failure")));
        }
        self.inner.flush()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// An in-memory provider that can fail opens and durability writes.
///
/// Journals outlive the environments opened over them, so a database
/// reloaded after a failure replays what was durable.
#[derive(Debug, Default)]
pub struct FaultInjectingProvider {
    journals: DashMap<String, InMemoryBackend>,
    fail_flush: Arc<AtomicBool>,
    failing_opens: AtomicUsize,
    opens: AtomicUsize,
    deleted: Mutex<Vec<String>>,
}

impl FaultInjectingProvider {
    /// Creates a provider that does not fail.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every durability write fail, or succeed again.
    pub fn fail_flushes(&self, fail: bool) {
        self.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Makes the next `count` opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Number of opens attempted.
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Names whose storage was deleted, in order.
    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    /// Returns true if a journal exists for `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.journals.contains_key(&name.to_lowercase())
    }

    fn take_open_failure(&self) -> bool {
        self.failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StorageProvider for FaultInjectingProvider {
    fn open_storage(
        &self,
        name: &DatabaseName,
        config: &DatabaseConfig,
    ) -> ServerResult<Environment> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.take_open_failure() {
            return Err(StorageError::Io(std::io::Error::other("injected open failure")).into());
        }
        let journal = self.journals.entry(name.key().to_string()).or_default().clone();
        let backend = FlakyBackend::new(journal, Arc::clone(&self.fail_flush));
        let options = EnvironmentOptions::new(name.as_str()).sync_on_commit(config.sync_on_commit);
        Ok(Environment::open(Box::new(backend), options)?)
    }

    fn delete_storage(&self, name: &DatabaseName, _config: &DatabaseConfig) -> ServerResult<()> {
        if self.journals.remove(name.key()).is_none() {
            return Err(ServerError::DatabaseNotFound {
                name: name.to_string(),
            });
        }
        self.deleted.lock().push(name.to_string());
        Ok(())
    }
}

/// A cluster notifier that records every removal it is told about.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    removals: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    /// Creates a notifier that accepts every notification.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes later notifications fail, or succeed again.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// `(database, node)` pairs in notification order.
    pub fn removals(&self) -> Vec<(String, String)> {
        self.removals.lock().clone()
    }
}

impl ClusterNotifier for RecordingNotifier {
    fn notify_leader_removed(
        &self,
        name: &DatabaseName,
        node: &str,
    ) -> BoxFuture<'static, ServerResult<()>> {
        self.removals.lock().push((name.to_string(), node.to_string()));
        let result = if self.fail.load(Ordering::SeqCst) {
            Err(ServerError::collaborator("cluster", "leader unreachable"))
        } else {
            Ok(())
        };
        futures::future::ready(result).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(n: &str) -> DatabaseName {
        DatabaseName::new(n).unwrap()
    }

    #[test]
    fn open_failures_are_consumed() {
        let provider = FaultInjectingProvider::new();
        provider.fail_next_opens(1);
        let config = DatabaseConfig::default().sync_on_commit(false);

        assert!(provider.open_storage(&name("db"), &config).is_err());
        let env = provider.open_storage(&name("db"), &config).unwrap();
        env.close().unwrap();
        assert_eq!(provider.opens(), 2);
        assert!(provider.contains("DB"));

        provider.delete_storage(&name("db"), &config).unwrap();
        assert_eq!(provider.deleted(), vec!["db".to_string()]);
        assert!(provider.delete_storage(&name("db"), &config).is_err());
    }

    #[test]
    fn released_gate_counts_opens() {
        let provider = GatedProvider::released();
        let config = DatabaseConfig::default().sync_on_commit(false);
        let env = provider.open_storage(&name("db"), &config).unwrap();
        env.close().unwrap();
        assert_eq!(provider.opens(), 1);
        assert_eq!(provider.max_concurrent(), 1);
        assert_eq!(provider.active(), 0);
    }

    #[test]
    fn notifier_records_in_order() {
        let notifier = RecordingNotifier::new();
        let first = notifier.notify_leader_removed(&name("a"), "A");
        notifier.fail(true);
        let second = notifier.notify_leader_removed(&name("b"), "A");
        assert!(futures::executor::block_on(first).is_ok());
        assert!(futures::executor::block_on(second).is_err());
        assert_eq!(
            notifier.removals(),
            vec![("a".to_string(), "A".to_string()), ("b".to_string(), "A".to_string())]
        );
    }
}
