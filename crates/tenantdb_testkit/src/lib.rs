//! # TenantDB Testkit
//!
//! Test utilities for TenantDB.
//!
//! This crate provides:
//! - A [`TestServer`] fixture wiring a landlord to an in-memory topology
//! - Storage providers that block, count or fail on demand
//! - A cluster notifier that records every removal it is told about
//! - Property-based generators for document commands
//! - A concurrent write workload for stress runs
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tenantdb_testkit::prelude::*;
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn loads_once() {
//!     let server = TestServer::builder().database("orders").build();
//!     let db = server.landlord.get_or_create("orders").await.unwrap();
//!     // ... test operations
//!     server.shutdown().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
}

pub use faults::*;
pub use fixtures::*;
pub use generators::*;
pub use stress::*;
