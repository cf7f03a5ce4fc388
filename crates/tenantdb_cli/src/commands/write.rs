//! Write command implementation.

use futures::future::join_all;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tenantdb_server::{
    DatabaseConfig, DatabaseRecord, FileStorageProvider, Landlord, MemoryTopology, PutDocument,
    ServerConfig, StandaloneNotifier,
};
use tracing::info;

/// Options of the write command.
#[derive(Debug)]
pub struct WriteOptions {
    /// Root data directory.
    pub data_dir: PathBuf,
    /// Node tag.
    pub node: String,
    /// Target database.
    pub database: String,
    /// Documents to put.
    pub count: usize,
    /// Concurrent writers.
    pub concurrency: usize,
    /// Fsync each commit.
    pub sync: bool,
}

/// Runs the write command.
pub async fn run(options: WriteOptions) -> Result<(), Box<dyn std::error::Error>> {
    let topology = Arc::new(MemoryTopology::new());
    topology.put(DatabaseRecord::new(&options.database, &[options.node.as_str()]));
    let config = ServerConfig::new()
        .data_dir(&options.data_dir)
        .node_tag(&options.node)
        .database(DatabaseConfig::default().sync_on_commit(options.sync));
    let landlord = Landlord::new(
        config,
        topology,
        Arc::new(StandaloneNotifier),
        Arc::new(FileStorageProvider),
    );

    let db = landlord.get_or_create(&options.database).await?;
    let before = db.merger().stats().snapshot();
    let writers = options.concurrency.max(1);
    let start = Instant::now();

    let tasks = (0..writers).map(|writer| {
        let db = Arc::clone(&db);
        let count = options.count;
        tokio::spawn(async move {
            let mut failed = 0usize;
            for i in (writer..count).step_by(writers) {
                let body = json!({ "writer": writer, "i": i });
                let put = PutDocument::new(format!("load/{i}"), body);
                if db.submit(put).await.is_err() {
                    failed += 1;
                }
            }
            failed
        })
    });
    let failed: usize = join_all(tasks).await.into_iter().map(|r| r.unwrap_or(0)).sum();
    let elapsed = start.elapsed();

    let after = db.merger().stats().snapshot();
    let batches = after.batches - before.batches;
    let committed = after.commands - before.commands;
    let throughput = if elapsed.as_secs_f64() > 0.0 {
        committed as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(database = %options.database, committed, failed, batches, "workload finished");

    println!("Database:       {}", db.name());
    println!("Documents:      {} committed, {} failed", committed, failed);
    println!("Writers:        {}", writers);
    println!(
        "Batches:        {} (largest {}, avg {:.1})",
        batches,
        after.largest_batch,
        if batches == 0 { 0.0 } else { committed as f64 / batches as f64 }
    );
    println!("Duration:       {:?}", elapsed);
    println!("Throughput:     {:.2} docs/sec", throughput);
    println!("Journal size:   {} bytes", db.allocated_size());

    drop(db);
    landlord.shutdown().await?;
    Ok(())
}
