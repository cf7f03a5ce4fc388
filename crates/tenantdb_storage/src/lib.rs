//! # TenantDB Storage
//!
//! The transactional storage environment behind each TenantDB database.
//!
//! An environment is a set of named tables of ordered string keys, backed
//! by an append-only commit journal. It has:
//!
//! - one write transaction at a time, with read-your-writes
//! - asynchronous commits: [`WriteTransaction::begin_async_commit_and_start_new`]
//!   hands the durability write to a flusher thread and returns a new
//!   transaction chained after the pending one
//! - readers that only ever see published (durable) state
//! - a fail-stop rule: after one failed durability write every later
//!   commit fails until the environment is reopened
//!
//! ## Example
//!
//! ```rust
//! use tenantdb_storage::{Environment, EnvironmentOptions};
//!
//! let env = Environment::open_in_memory(EnvironmentOptions::new("demo")).unwrap();
//! let mut tx = env.begin_write().unwrap();
//! tx.put("docs", "users/1", b"{}".to_vec());
//! tx.commit().unwrap();
//! assert_eq!(env.get("docs", "users/1"), Some(b"{}".to_vec()));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod dir;
mod environment;
mod error;
mod file;
pub mod journal;
mod memory;
mod transaction;

pub use backend::StorageBackend;
pub use dir::DatabaseDir;
pub use environment::{Environment, EnvironmentOptions};
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use transaction::{AsyncCommit, WriteSet, WriteTransaction};
