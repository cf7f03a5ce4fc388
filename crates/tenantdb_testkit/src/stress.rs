//! Stress workloads for TenantDB.
//!
//! These drive many concurrent writers through one instance's merger, or
//! many concurrent loads through one landlord.

use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tenantdb_server::{Database, Landlord, PutDocument};

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Merged batches the operations were committed in.
    pub batches: u64,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, batches: u64, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            batches,
            duration,
            ops_per_second,
        }
    }

    /// Average number of operations per batch.
    pub fn average_batch(&self) -> f64 {
        if self.batches == 0 {
            0.0
        } else {
            self.successful_ops as f64 / self.batches as f64
        }
    }

    /// Prints a summary of the test.
    pub fn print_summary(&self, name: &str) {
        println!("\n=== {} ===", name);
        println!("Total operations: {}", self.total_ops);
        println!("Successful: {}", self.successful_ops);
        println!("Failed: {}", self.failed_ops);
        println!("Batches: {} (avg {:.1} ops)", self.batches, self.average_batch());
        println!("Duration: {:?}", self.duration);
        println!("Throughput: {:.2} ops/sec", self.ops_per_second);
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Number of concurrent writers.
    pub writers: usize,
    /// Writes issued by each writer, one after another.
    pub ops_per_writer: usize,
    /// Size of the padding field in each document.
    pub payload_size: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            writers: 16,
            ops_per_writer: 100,
            payload_size: 128,
        }
    }
}

/// Runs concurrent writers against one instance.
///
/// Writer `w` puts `stress/{w}/{i}` for each of its operations, waiting for
/// each to commit before issuing the next.
pub async fn stress_concurrent_writes(db: &Database, config: &StressConfig) -> StressTestResult {
    let padding = "x".repeat(config.payload_size);
    let batches_before = db.merger().stats().batches();
    let start = Instant::now();

    let writers = (0..config.writers).map(|writer| {
        let db = Arc::clone(db);
        let padding = padding.clone();
        let ops = config.ops_per_writer;
        tokio::spawn(async move {
            let mut failed = 0usize;
            for i in 0..ops {
                let body = json!({ "i": i, "padding": padding });
                let put = PutDocument::new(format!("stress/{writer}/{i}"), body);
                if db.submit(put).await.is_err() {
                    failed += 1;
                }
            }
            (ops - failed, failed)
        })
    });

    let (successful, failed) = join_all(writers)
        .await
        .into_iter()
        .fold((0, 0), |(ok, err), joined| match joined {
            Ok((o, e)) => (ok + o, err + e),
            Err(_) => (ok, err + config.ops_per_writer),
        });
    let batches = db.merger().stats().batches() - batches_before;
    StressTestResult::new(successful, failed, batches, start.elapsed())
}

/// Loads `count` databases named `{prefix}{i}` concurrently.
///
/// Failed loads count as failed operations; the batch count is left at zero.
pub async fn stress_concurrent_loads(
    landlord: &Arc<Landlord>,
    prefix: &str,
    count: usize,
) -> StressTestResult {
    let start = Instant::now();
    let loads = (0..count).map(|i| {
        let landlord = Arc::clone(landlord);
        let name = format!("{prefix}{i}");
        async move { landlord.get_or_create(&name).await }
    });
    let results = join_all(loads).await;
    let successful = results.iter().filter(|r| r.is_ok()).count();
    StressTestResult::new(successful, count - successful, 0, start.elapsed())
}
