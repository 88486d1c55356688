//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Connection descriptors and the connection-info table
//! - Driver resolution and database-specific pools
//! - The per-request connection registry
//! - Query execution with table prefixing, and transactions
//! - Per-key query logging
//! - System table installation

pub mod connection;
#[macro_use]
pub mod driver;
pub mod info;
pub mod log;
pub mod params;
pub mod registry;
pub mod schema;
pub mod transaction;
pub mod types;

pub use connection::Connection;
pub use driver::{DbPool, Driver};
pub use info::{ConnectionOptions, DEFAULT_KEY, DEFAULT_TARGET, DatabaseInfo, TablePrefix};
pub use log::{DatabaseLog, QueryRecord};
pub use params::QueryParam;
pub use registry::Database;
pub use transaction::Transaction;
pub use types::Row;
