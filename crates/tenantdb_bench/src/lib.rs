//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::sync::Arc;
use tenantdb_server::{
    Database, DatabaseConfig, DatabaseRecord, InMemoryStorageProvider, Landlord, MemoryTopology,
    ServerConfig, StandaloneNotifier,
};
use tokio::runtime::Runtime;

/// Builds a multi-threaded runtime for async benchmarks.
pub fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Generate a random alphanumeric string of the specified length.
pub fn random_text(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Generate a document body with a padding field of the specified size.
pub fn random_document(size: usize) -> Value {
    json!({ "padding": random_text(size) })
}

/// Loads an in-memory database named `name` on a fresh landlord.
///
/// Commits skip fsync so the numbers measure batching, not the disk.
pub fn open_database(runtime: &Runtime, name: &str) -> (Arc<Landlord>, Database) {
    let topology = Arc::new(MemoryTopology::new());
    topology.put(DatabaseRecord::new(name, &["A"]));
    let landlord = Landlord::new(
        ServerConfig::new()
            .node_tag("A")
            .in_memory(true)
            .database(DatabaseConfig::default().sync_on_commit(false)),
        topology,
        Arc::new(StandaloneNotifier),
        Arc::new(InMemoryStorageProvider::new()),
    );
    let database = runtime.block_on(landlord.get_or_create(name)).unwrap();
    (landlord, database)
}
