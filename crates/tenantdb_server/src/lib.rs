//! # TenantDB Server
//!
//! The multi-tenant core of TenantDB: many logical databases hosted in one
//! process.
//!
//! This crate provides:
//! - [`Landlord`]: admission-controlled lazy loading, idle unloading,
//!   topology reactions and graceful shutdown of database instances
//! - [`TransactionMerger`]: batches concurrent write commands into
//!   pipelined storage transactions
//! - [`DocumentsChanges`]: post-commit change notifications, split into a
//!   control plane raised on the commit path and a data plane raised after it
//! - [`BackgroundWorker`]: cancellable periodic maintenance, used by the
//!   expired documents cleaner and the idle sweeper
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use tenantdb_server::{
//!     DatabaseRecord, InMemoryStorageProvider, Landlord, MemoryTopology, PutDocument,
//!     ServerConfig, StandaloneNotifier,
//! };
//!
//! # async fn run() -> tenantdb_server::ServerResult<()> {
//! let topology = Arc::new(MemoryTopology::new());
//! topology.put(DatabaseRecord::new("orders", &["A"]));
//!
//! let landlord = Landlord::new(
//!     ServerConfig::new().node_tag("A"),
//!     topology,
//!     Arc::new(StandaloneNotifier),
//!     Arc::new(InMemoryStorageProvider::new()),
//! );
//! let orders = landlord.get_or_create("orders").await?;
//! orders.submit(PutDocument::new("orders/1", json!({"total": 42}))).await?;
//! landlord.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod admission;
mod background;
mod cache;
mod changes;
mod commands;
mod config;
mod database;
mod documents;
mod error;
mod expiration;
mod landlord;
mod merger;
mod name;
mod notifications;
mod provider;
mod record;
mod stats;

pub use admission::{AdmissionGate, AdmissionToken};
pub use background::{BackgroundWorker, WorkerState};
pub use cache::{CacheEntry, EntryState, InstanceCache, Registration, SharedLoad};
pub use changes::{
    is_system_id, DocumentChange, DocumentChangeKind, DocumentsChanges, Subscription, SYSTEM_PREFIX,
};
pub use commands::{BatchCommand, BatchOperation, DeleteDocument, MergedCommand, PutDocument};
pub use config::{DatabaseConfig, ServerConfig, KEEP_FAILED_LOAD, MAX_BATCH_SIZE, SYNC_ON_COMMIT};
pub use database::DocumentDatabase;
pub use documents::{
    Document, DocumentsTransaction, PendingNotifications, COLLECTION, DOCUMENTS_TABLE, METADATA,
};
pub use error::{ErrorSource, ServerError, ServerResult};
pub use expiration::{
    expires_at, DeleteExpiredDocuments, ExpiredDocumentsCleaner, EXPIRATION_TABLE, EXPIRES,
};
pub use landlord::{Database, Landlord, SkipPredicate};
pub use merger::TransactionMerger;
pub use name::DatabaseName;
pub use notifications::{DatabaseChangeKind, DatabaseChanged, ServerNotificationCenter};
pub use provider::{FileStorageProvider, InMemoryStorageProvider, StorageProvider};
pub use record::{
    ClusterNotifier, DatabaseRecord, DeletionStatus, ExpirationConfig, MemoryTopology,
    StandaloneNotifier, TopologyStore,
};
pub use stats::{LandlordStats, LandlordStatsSnapshot, MergerStats, MergerStatsSnapshot};
