//! Landlord and merger counters.
//!
//! All counters are atomic and can be read while work is in progress.
//! [`LandlordStats::snapshot`] and [`MergerStats::snapshot`] return plain
//! copies.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters kept by the landlord.
#[derive(Debug, Default)]
pub struct LandlordStats {
    loads: AtomicU64,
    load_failures: AtomicU64,
    admission_timeouts: AtomicU64,
    unloads: AtomicU64,
}

impl LandlordStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_load(&self) {
        self.loads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_admission_timeout(&self) {
        self.admission_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_unload(&self) {
        self.unloads.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of successful constructions.
    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Returns the number of failed constructions.
    pub fn load_failures(&self) -> u64 {
        self.load_failures.load(Ordering::Relaxed)
    }

    /// Returns how often admission timed out.
    pub fn admission_timeouts(&self) -> u64 {
        self.admission_timeouts.load(Ordering::Relaxed)
    }

    /// Returns the number of instances unloaded.
    pub fn unloads(&self) -> u64 {
        self.unloads.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> LandlordStatsSnapshot {
        LandlordStatsSnapshot {
            loads: self.loads(),
            load_failures: self.load_failures(),
            admission_timeouts: self.admission_timeouts(),
            unloads: self.unloads(),
        }
    }
}

/// Point-in-time copy of [`LandlordStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LandlordStatsSnapshot {
    /// Successful constructions.
    pub loads: u64,
    /// Failed constructions.
    pub load_failures: u64,
    /// Admission timeouts.
    pub admission_timeouts: u64,
    /// Unloaded instances.
    pub unloads: u64,
}

/// Counters kept by one transaction merger.
#[derive(Debug, Default)]
pub struct MergerStats {
    batches: AtomicU64,
    commands: AtomicU64,
    largest_batch: AtomicU64,
    aborted_batches: AtomicU64,
    commit_failures: AtomicU64,
}

impl MergerStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_batch(&self, size: usize) {
        let size = size as u64;
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.commands.fetch_add(size, Ordering::Relaxed);
        self.largest_batch.fetch_max(size, Ordering::Relaxed);
    }

    pub(crate) fn record_aborted_batch(&self) {
        self.aborted_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit_failure(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of committed batches.
    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    /// Returns the number of committed commands.
    pub fn commands(&self) -> u64 {
        self.commands.load(Ordering::Relaxed)
    }

    /// Returns the size of the largest committed batch.
    pub fn largest_batch(&self) -> u64 {
        self.largest_batch.load(Ordering::Relaxed)
    }

    /// Returns the number of batches rolled back by a failing command.
    pub fn aborted_batches(&self) -> u64 {
        self.aborted_batches.load(Ordering::Relaxed)
    }

    /// Returns the number of failed durability writes.
    pub fn commit_failures(&self) -> u64 {
        self.commit_failures.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> MergerStatsSnapshot {
        MergerStatsSnapshot {
            batches: self.batches(),
            commands: self.commands(),
            largest_batch: self.largest_batch(),
            aborted_batches: self.aborted_batches(),
            commit_failures: self.commit_failures(),
        }
    }
}

/// Point-in-time copy of [`MergerStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MergerStatsSnapshot {
    /// Committed batches.
    pub batches: u64,
    /// Committed commands.
    pub commands: u64,
    /// Largest committed batch.
    pub largest_batch: u64,
    /// Batches rolled back by a failing command.
    pub aborted_batches: u64,
    /// Failed durability writes.
    pub commit_failures: u64,
}
