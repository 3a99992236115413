//! # Pelta
//!
//! An embedded, schema-driven record database with full-text and vector search.
//!
//! ## Features
//!
//! - Typed tables with auto-incrementing primary keys and secondary indexes
//! - Atomic writes that keep records, the inverted index, vectors and
//!   statistics consistent
//! - Index-assisted structured queries with keyset pagination
//! - TF-IDF full-text search
//! - Exact and IVF (k-means) vector search with pluggable embedders
//! - Change notification, authorization hooks and field transforms
//! - Write-ahead log and snapshots on pluggable storage

pub mod analysis;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod index;
pub mod interceptor;
pub mod notify;
pub mod query;
pub mod record;
pub mod schema;
pub mod search;
pub mod stats;
pub mod storage;
pub mod store;
pub mod transfer;
pub mod vector;
pub mod write;

pub mod prelude {
    pub use crate::config::DatabaseConfig;
    pub use crate::database::Database;
    pub use crate::error::{PeltaError, Result};
    pub use crate::query::{Condition, FindOptions, Where};
    pub use crate::record::{Record, Value};
    pub use crate::schema::{ColumnType, Schema, TableDefinition};
    pub use crate::search::SearchOptions;
    pub use crate::store::{Direction, Key};
    pub use crate::vector::{DistanceMetric, VectorSearchOptions};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
