//! Database configuration.
//!
//! ```
//! use pelta::config::DatabaseConfig;
//!
//! let config = DatabaseConfig::new("chat")
//!     .with_version(2)
//!     .with_search_limit(20);
//! assert_eq!(config.find_limit, 1000);
//! ```

use serde::{Deserialize, Serialize};

use crate::storage::StorageConfig;

fn default_centroids() -> usize {
    16
}

fn default_iterations() -> usize {
    10
}

fn default_probe() -> usize {
    3
}

fn default_ivf_overfetch() -> usize {
    2
}

/// Clustering and probing parameters of the IVF index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IvfConfig {
    /// Centroids built when no count is given.
    #[serde(default = "default_centroids")]
    pub default_centroids: usize,

    /// Fixed k-means iteration count.
    #[serde(default = "default_iterations")]
    pub iterations: usize,

    /// Nearest centroids whose members are scored at query time.
    #[serde(default = "default_probe")]
    pub probe: usize,

    /// Candidates kept per requested result on the IVF path.
    #[serde(default = "default_ivf_overfetch")]
    pub overfetch: usize,
}

impl Default for IvfConfig {
    fn default() -> Self {
        IvfConfig {
            default_centroids: default_centroids(),
            iterations: default_iterations(),
            probe: default_probe(),
            overfetch: default_ivf_overfetch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,

    /// Schema version; raising it runs the upgrade on the next load.
    pub version: u32,

    pub storage: StorageConfig,

    /// Default `limit` of `find` and `get_all`.
    pub find_limit: usize,

    /// Default `limit` of `search`.
    pub search_limit: usize,

    /// Default `limit` of vector search.
    pub vector_limit: usize,

    /// Entries in the query-embedding cache.
    pub embedding_cache_capacity: usize,

    /// Candidates kept per requested result on the exact vector path.
    pub exact_overfetch: usize,

    pub ivf: IvfConfig,

    /// Commits between snapshots of the write-ahead log.
    pub wal_checkpoint_threshold: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            name: "pelta".to_string(),
            version: 1,
            storage: StorageConfig::default(),
            find_limit: 1000,
            search_limit: 50,
            vector_limit: 50,
            embedding_cache_capacity: 1000,
            exact_overfetch: 3,
            ivf: IvfConfig::default(),
            wal_checkpoint_threshold: 64,
        }
    }
}

impl DatabaseConfig {
    pub fn new<S: Into<String>>(name: S) -> Self {
        DatabaseConfig {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_find_limit(mut self, limit: usize) -> Self {
        self.find_limit = limit;
        self
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit;
        self
    }

    pub fn with_vector_limit(mut self, limit: usize) -> Self {
        self.vector_limit = limit;
        self
    }

    pub fn with_embedding_cache_capacity(mut self, capacity: usize) -> Self {
        self.embedding_cache_capacity = capacity;
        self
    }

    pub fn with_ivf(mut self, ivf: IvfConfig) -> Self {
        self.ivf = ivf;
        self
    }

    pub fn with_wal_checkpoint_threshold(mut self, threshold: usize) -> Self {
        self.wal_checkpoint_threshold = threshold;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.version, 1);
        assert_eq!(config.search_limit, 50);
        assert_eq!(config.vector_limit, 50);
        assert_eq!(config.embedding_cache_capacity, 1000);
        assert_eq!(config.ivf.default_centroids, 16);
        assert_eq!(config.ivf.iterations, 10);
        assert_eq!(config.ivf.probe, 3);
        assert_eq!(config.wal_checkpoint_threshold, 64);
        assert!(matches!(config.storage, StorageConfig::Memory(_)));
    }

    #[test]
    fn test_ivf_config_from_partial_json() {
        let config: IvfConfig = serde_json::from_str(r#"{"probe": 5}"#).unwrap();
        assert_eq!(config.probe, 5);
        assert_eq!(config.iterations, 10);
    }
}
