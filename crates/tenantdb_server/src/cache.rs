//! Instance cache: name → shared construction task.
//!
//! Every entry holds a [`Shared`] future, so any number of callers can await
//! the same construction and see the same result. An entry is inserted only
//! into a vacant slot; whoever inserts it is the only one that starts the
//! task. The last-recently-used table lives beside the entries and is
//! cleared whenever an entry is removed.
//!
//! An instance being disposed keeps its slot occupied by a disposing entry
//! until its storage is released, so no new construction can start over it.

use crate::error::{ServerError, ServerResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::Instant;

/// A construction task shared by every caller waiting on it.
pub type SharedLoad<T> = Shared<BoxFuture<'static, ServerResult<T>>>;

/// One cache slot.
pub struct CacheEntry<T: Clone> {
    generation: u64,
    task: SharedLoad<T>,
    disposing: bool,
}

impl<T: Clone> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            task: self.task.clone(),
            disposing: self.disposing,
        }
    }
}

/// Observed state of an entry's task.
#[derive(Debug, Clone)]
pub enum EntryState<T> {
    /// Construction has not finished.
    Loading,
    /// Construction succeeded.
    Loaded(T),
    /// Construction failed.
    Faulted(ServerError),
}

impl<T: Clone> CacheEntry<T> {
    /// Distinguishes this entry from earlier and later entries of the same name.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns true for the entry of an instance being disposed. Its task
    /// completes once disposal has finished.
    #[must_use]
    pub fn is_disposing(&self) -> bool {
        self.disposing
    }

    /// Returns a handle to the shared task.
    #[must_use]
    pub fn task(&self) -> SharedLoad<T> {
        self.task.clone()
    }

    /// Returns the task state without waiting.
    #[must_use]
    pub fn state(&self) -> EntryState<T> {
        match self.task.peek() {
            None => EntryState::Loading,
            Some(Ok(value)) => EntryState::Loaded(value.clone()),
            Some(Err(e)) => EntryState::Faulted(e.clone()),
        }
    }
}

/// Outcome of [`InstanceCache::register`].
pub enum Registration<T: Clone> {
    /// The caller's task was inserted; the caller must start it.
    Registered(CacheEntry<T>),
    /// Another task already occupies the slot.
    Existing(CacheEntry<T>),
}

/// Concurrent name → task map with a last-recently-used table.
pub struct InstanceCache<T: Clone> {
    entries: DashMap<String, CacheEntry<T>>,
    last_recently_used: DashMap<String, Instant>,
    generations: AtomicU64,
}

impl<T: Clone> Default for InstanceCache<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
            last_recently_used: DashMap::new(),
            generations: AtomicU64::new(1),
        }
    }
}

impl<T: Clone> InstanceCache<T> {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Inserts the task built by `make` if `key` is vacant.
    ///
    /// `make` receives the new entry's generation and runs only when the slot
    /// is vacant, while the slot is locked; it must not poll anything.
    pub fn register(&self, key: &str, make: impl FnOnce(u64) -> SharedLoad<T>) -> Registration<T> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => Registration::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                let generation = self.generations.fetch_add(1, Ordering::Relaxed);
                let entry = CacheEntry {
                    generation,
                    task: make(generation),
                    disposing: false,
                };
                slot.insert(entry.clone());
                Registration::Registered(entry)
            }
        }
    }

    /// Removes the entry for `key` if it is still `generation`, together
    /// with its last-used timestamp.
    pub fn remove_if_generation(&self, key: &str, generation: u64) -> Option<CacheEntry<T>> {
        self.entries
            .remove_if(key, |_, entry| {
                let matches = entry.generation == generation;
                if matches {
                    self.last_recently_used.remove(key);
                }
                matches
            })
            .map(|(_, entry)| entry)
    }

    /// Replaces the entry for `key`, if it is still `generation`, with a
    /// disposing entry running `disposal`. The slot never becomes vacant in
    /// between. The last-used timestamp is cleared.
    ///
    /// `disposal` is built while the slot is locked; it must not poll anything.
    pub fn begin_disposal(
        &self,
        key: &str,
        generation: u64,
        disposal: impl FnOnce() -> SharedLoad<T>,
    ) -> Option<CacheEntry<T>> {
        let mut slot = self.entries.get_mut(key)?;
        if slot.generation != generation {
            return None;
        }
        let entry = CacheEntry {
            generation: self.generations.fetch_add(1, Ordering::Relaxed),
            task: disposal(),
            disposing: true,
        };
        *slot = entry.clone();
        self.last_recently_used.remove(key);
        Some(entry)
    }

    /// Removes the entry for `key` whatever its generation.
    pub fn remove(&self, key: &str) -> Option<CacheEntry<T>> {
        self.entries
            .remove_if(key, |_, _| {
                self.last_recently_used.remove(key);
                true
            })
            .map(|(_, entry)| entry)
            .or_else(|| {
                self.last_recently_used.remove(key);
                None
            })
    }

    /// Records activity on `key` now.
    pub fn touch(&self, key: &str) {
        self.last_recently_used.insert(key.to_string(), Instant::now());
    }

    /// Returns the last recorded activity on `key`.
    #[must_use]
    pub fn last_used(&self, key: &str) -> Option<Instant> {
        self.last_recently_used.get(key).map(|t| *t.value())
    }

    /// Returns every entry.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, CacheEntry<T>)> {
        self.entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<(String, CacheEntry<T>)> {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.remove(&key).map(|entry| (key, entry)))
            .collect()
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn ready(value: ServerResult<u32>) -> SharedLoad<u32> {
        futures::future::ready(value).boxed().shared()
    }

    #[test]
    fn second_registration_sees_first() {
        let cache = InstanceCache::new();
        let first = match cache.register("a", |_| ready(Ok(1))) {
            Registration::Registered(e) => e,
            Registration::Existing(_) => panic!("slot was vacant"),
        };
        let mut called = false;
        match cache.register("a", |_| {
            called = true;
            ready(Ok(2))
        }) {
            Registration::Existing(e) => assert_eq!(e.generation(), first.generation()),
            Registration::Registered(_) => panic!("slot was occupied"),
        }
        assert!(!called);
    }

    #[tokio::test]
    async fn state_follows_task() {
        let cache = InstanceCache::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
        let task = async move { rx.await.map_err(|_| ServerError::Canceled) }.boxed().shared();
        let entry = match cache.register("a", |_| task) {
            Registration::Registered(e) => e,
            Registration::Existing(_) => unreachable!(),
        };
        assert!(matches!(entry.state(), EntryState::Loading));

        let driver = tokio::spawn(entry.task());
        tx.send(7).unwrap();
        assert_eq!(driver.await.unwrap().unwrap(), 7);
        assert!(matches!(entry.state(), EntryState::Loaded(7)));
    }

    #[test]
    fn remove_if_generation_ignores_newer_entry() {
        let cache = InstanceCache::new();
        let old = match cache.register("a", |_| ready(Err(ServerError::Canceled))) {
            Registration::Registered(e) => e,
            Registration::Existing(_) => unreachable!(),
        };
        cache.remove("a");
        cache.register("a", |_| ready(Ok(1)));
        cache.touch("a");

        assert!(cache.remove_if_generation("a", old.generation()).is_none());
        assert_eq!(cache.len(), 1);
        assert!(cache.last_used("a").is_some());
    }

    #[test]
    fn removal_clears_last_used() {
        let cache = InstanceCache::new();
        let entry = match cache.register("a", |_| ready(Ok(1))) {
            Registration::Registered(e) => e,
            Registration::Existing(_) => unreachable!(),
        };
        cache.touch("a");
        assert!(cache.remove_if_generation("a", entry.generation()).is_some());
        assert!(cache.last_used("a").is_none());

        cache.touch("b");
        assert!(cache.remove("b").is_none());
        assert!(cache.last_used("b").is_none());
    }

    #[tokio::test]
    async fn disposal_keeps_the_slot_occupied() {
        let cache = InstanceCache::new();
        let loaded = match cache.register("a", |_| ready(Ok(1))) {
            Registration::Registered(e) => e,
            Registration::Existing(_) => unreachable!(),
        };
        cache.touch("a");

        let (done, finished) = tokio::sync::oneshot::channel::<()>();
        let disposal = async move {
            let _ = finished.await;
            Err(ServerError::InstanceUnloading { name: "a".into() })
        }
        .boxed()
        .shared();
        let disposing = cache.begin_disposal("a", loaded.generation(), || disposal).unwrap();
        assert!(disposing.is_disposing());
        assert_ne!(disposing.generation(), loaded.generation());
        assert!(cache.last_used("a").is_none());
        assert!(cache.begin_disposal("a", loaded.generation(), || ready(Ok(0))).is_none());

        match cache.register("a", |_| ready(Ok(2))) {
            Registration::Existing(e) => assert!(e.is_disposing()),
            Registration::Registered(_) => panic!("slot was occupied"),
        }
        assert!(matches!(cache.get("a").unwrap().state(), EntryState::Loading));

        done.send(()).unwrap();
        assert!(disposing.task().await.is_err());
        assert!(cache.remove_if_generation("a", disposing.generation()).is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn drain_empties_cache() {
        let cache = InstanceCache::new();
        cache.register("a", |_| ready(Ok(1)));
        cache.register("b", |_| ready(Ok(2)));
        let drained = cache.drain();
        assert_eq!(drained.len(), 2);
        assert!(cache.is_empty());
    }
}
