//! Vector storage, IVF maintenance and similarity search.
//!
//! Each table with a vector config has two stores: `_vec_{table}` maps a
//! record id to its embedding, and `_ivf_{table}` holds the clusters of an
//! optional IVF index. The vector store is authoritative; the IVF index is
//! derived. Between rebuilds it is kept usable incrementally: new vectors
//! join the member list of their nearest centroid and removed ids leave
//! theirs. Centroids only move when the index is rebuilt.

use std::cmp::Ordering;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::DatabaseConfig;
use crate::error::{PeltaError, Result};
use crate::interceptor::FieldTransform;
use crate::query::Where;
use crate::record::Record;
use crate::schema::{StoreName, StoreRole, TableDefinition};
use crate::store::{Direction, Key, KeyRange, ReadView, Transaction};

pub mod cache;
pub mod embedder;
pub mod ivf;
pub mod metric;

pub use cache::EmbeddingCache;
pub use embedder::{Embedder, EmbedderRegistry, FnEmbedder};
pub use ivf::{IvfCluster, KMeans};
pub use metric::DistanceMetric;

/// Stored form of one embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: Key,
    pub vector: Vec<f32>,
}

impl VectorEntry {
    fn decode(value: &JsonValue) -> Option<VectorEntry> {
        serde_json::from_value(value.clone()).ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct VectorSearchOptions {
    pub metric: DistanceMetric,
    /// Defaults to the configured vector limit.
    pub limit: Option<usize>,
    pub filter: Where,
    pub use_ivf: bool,
}

impl VectorSearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metric(mut self, metric: DistanceMetric) -> Self {
        self.metric = metric;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_filter(mut self, filter: Where) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_ivf(mut self, use_ivf: bool) -> Self {
        self.use_ivf = use_ivf;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorHit {
    pub id: Key,
    pub score: f32,
    pub record: Record,
}

/// The configured dimensionality of `table`, or an error if it has none.
pub fn dims_of(table: &str, definition: &TableDefinition) -> Result<usize> {
    definition.vector.as_ref().map(|v| v.dims).ok_or_else(|| {
        PeltaError::invalid_operation(format!("Table {table} has no vector configuration"))
    })
}

/// Every committed embedding of `table`, in id order.
pub fn stored_vectors(view: &ReadView<'_>, table: &str) -> Result<Vec<(Key, Vec<f32>)>> {
    let store = StoreName::of(table, StoreRole::VectorStore);
    Ok(view
        .scan(&store, &KeyRange::all(), Direction::Asc)?
        .filter_map(|(key, value)| VectorEntry::decode(value).map(|e| (key.clone(), e.vector)))
        .collect())
}

pub fn stored_vector(view: &ReadView<'_>, table: &str, id: &Key) -> Result<Option<Vec<f32>>> {
    let store = StoreName::of(table, StoreRole::VectorStore);
    Ok(view
        .get(&store, id)?
        .and_then(VectorEntry::decode)
        .map(|e| e.vector))
}

/// Committed IVF clusters; empty when no index was built.
pub fn load_clusters(view: &ReadView<'_>, table: &str) -> Result<Vec<IvfCluster>> {
    let store = StoreName::of(table, StoreRole::IvfIndex);
    view.scan(&store, &KeyRange::all(), Direction::Asc)?
        .map(|(_, value)| serde_json::from_value(value.clone()).map_err(PeltaError::from))
        .collect()
}

fn top(mut scored: Vec<(Key, f32)>, keep: usize) -> Vec<(Key, f32)> {
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored.truncate(keep);
    scored
}

/// Score every stored vector and keep the best `keep`.
pub fn exact_candidates(
    view: &ReadView<'_>,
    table: &str,
    query: &[f32],
    metric: DistanceMetric,
    keep: usize,
) -> Result<Vec<(Key, f32)>> {
    let vectors: Vec<(Key, Vec<f32>)> = stored_vectors(view, table)?
        .into_iter()
        .filter(|(_, v)| v.len() == query.len())
        .collect();
    let scores = metric.score_batch(query, &vectors);
    let scored = vectors.into_iter().map(|(k, _)| k).zip(scores).collect();
    Ok(top(scored, keep))
}

/// Score only the members of the `probe` centroids nearest to `query`.
///
/// Returns `None` when the table has no IVF index.
pub fn ivf_candidates(
    view: &ReadView<'_>,
    table: &str,
    query: &[f32],
    metric: DistanceMetric,
    probe: usize,
    keep: usize,
) -> Result<Option<Vec<(Key, f32)>>> {
    let clusters = load_clusters(view, table)?;
    if clusters.is_empty() {
        return Ok(None);
    }
    if let Some(bad) = clusters.iter().find(|c| c.centroid.len() != query.len()) {
        return Err(PeltaError::dimension_mismatch(query.len(), bad.centroid.len()));
    }

    let mut members = Vec::new();
    for index in ivf::nearest_n(&clusters, query, probe) {
        for id in &clusters[index].members {
            // Ids whose vector has gone are skipped.
            if let Some(vector) = stored_vector(view, table, id)? {
                if vector.len() == query.len() {
                    members.push((id.clone(), vector));
                }
            }
        }
    }
    let scores = metric.score_batch(query, &members);
    let scored = members.into_iter().map(|(k, _)| k).zip(scores).collect();
    Ok(Some(top(scored, keep)))
}

/// Similarity search over committed state.
pub fn search(
    view: &ReadView<'_>,
    table: &str,
    definition: &TableDefinition,
    transform: &dyn FieldTransform,
    config: &DatabaseConfig,
    query: &[f32],
    options: &VectorSearchOptions,
) -> Result<Vec<VectorHit>> {
    let dims = dims_of(table, definition)?;
    if query.len() != dims {
        return Err(PeltaError::dimension_mismatch(dims, query.len()));
    }
    let limit = options.limit.unwrap_or(config.vector_limit);

    let mut candidates = None;
    if options.use_ivf {
        let keep = limit.saturating_mul(config.ivf.overfetch);
        match ivf_candidates(view, table, query, options.metric, config.ivf.probe, keep) {
            Ok(Some(found)) if !found.is_empty() => candidates = Some(found),
            Ok(_) => debug!("no IVF candidates for {table}; scanning all vectors"),
            Err(e) => warn!("IVF search on {table} failed, falling back to exact scan: {e}"),
        }
    }
    let candidates = match candidates {
        Some(found) => found,
        None => {
            let keep = limit.saturating_mul(config.exact_overfetch);
            exact_candidates(view, table, query, options.metric, keep)?
        }
    };

    let primary = StoreName::of(table, StoreRole::Primary);
    let mut hits = Vec::new();
    for (id, score) in candidates {
        let Some(value) = view.get(&primary, &id)? else {
            continue;
        };
        let record = transform.decode(table, Record::denormalize(value, definition))?;
        if options.filter.matches(&record) {
            hits.push(VectorHit { id, score, record });
        }
    }
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
    Ok(hits)
}

/// Stages vector and IVF maintenance for one table inside a transaction.
pub struct VectorWriter<'t, 'e> {
    tx: &'t mut Transaction<'e>,
    vectors: String,
    clusters: String,
    dims: usize,
}

impl<'t, 'e> VectorWriter<'t, 'e> {
    pub fn new(tx: &'t mut Transaction<'e>, table: &str, dims: usize) -> Self {
        VectorWriter {
            tx,
            vectors: StoreName::of(table, StoreRole::VectorStore),
            clusters: StoreName::of(table, StoreRole::IvfIndex),
            dims,
        }
    }

    /// Store `vector` for `id` and move `id` to its nearest cluster.
    pub fn put(&mut self, id: &Key, vector: Vec<f32>) -> Result<()> {
        if vector.len() != self.dims {
            return Err(PeltaError::dimension_mismatch(self.dims, vector.len()));
        }
        let clusters = self.unassign(id)?;
        self.assign(id, &vector, clusters)?;
        let entry = VectorEntry {
            id: id.clone(),
            vector,
        };
        self.tx
            .put(&self.vectors, id.clone(), serde_json::to_value(entry)?)
    }

    /// Drop the vector for `id` and its IVF membership.
    pub fn remove(&mut self, id: &Key) -> Result<()> {
        self.unassign(id)?;
        self.tx.delete(&self.vectors, id)
    }

    /// Every vector as the transaction sees it.
    pub fn vectors(&self) -> Result<Vec<(Key, Vec<f32>)>> {
        Ok(self
            .tx
            .scan(&self.vectors)?
            .into_iter()
            .filter_map(|(key, value)| VectorEntry::decode(&value).map(|e| (key, e.vector)))
            .collect())
    }

    /// Replace the IVF index with `clusters`.
    pub fn replace_index(&mut self, clusters: &[IvfCluster]) -> Result<()> {
        self.tx.clear(&self.clusters)?;
        for (i, cluster) in clusters.iter().enumerate() {
            self.tx
                .put(&self.clusters, Key::Int(i as i64), serde_json::to_value(cluster)?)?;
        }
        Ok(())
    }

    /// Discard every vector and the IVF index.
    pub fn clear(&mut self) -> Result<()> {
        self.tx.clear(&self.vectors)?;
        self.tx.clear(&self.clusters)
    }

    fn load_clusters(&self) -> Result<Vec<(Key, IvfCluster)>> {
        self.tx
            .scan(&self.clusters)?
            .into_iter()
            .map(|(key, value)| -> Result<(Key, IvfCluster)> {
                Ok((key, serde_json::from_value(value)?))
            })
            .collect()
    }

    /// Remove `id` from whichever cluster lists it; returns the remaining clusters.
    fn unassign(&mut self, id: &Key) -> Result<Vec<(Key, IvfCluster)>> {
        let mut remaining = Vec::new();
        for (key, mut cluster) in self.load_clusters()? {
            if !cluster.members.remove(id) {
                remaining.push((key, cluster));
                continue;
            }
            if cluster.members.is_empty() {
                debug!("pruning empty IVF cluster {key} in {}", self.clusters);
                self.tx.delete(&self.clusters, &key)?;
            } else {
                self.tx
                    .put(&self.clusters, key.clone(), serde_json::to_value(&cluster)?)?;
                remaining.push((key, cluster));
            }
        }
        Ok(remaining)
    }

    fn assign(
        &mut self,
        id: &Key,
        vector: &[f32],
        mut clusters: Vec<(Key, IvfCluster)>,
    ) -> Result<()> {
        let positions: Vec<usize> = clusters
            .iter()
            .enumerate()
            .filter(|(_, (_, c))| c.centroid.len() == vector.len())
            .map(|(i, _)| i)
            .collect();
        let centroids: Vec<&[f32]> = positions
            .iter()
            .map(|&i| clusters[i].1.centroid.as_slice())
            .collect();
        let Some(nearest) = ivf::nearest(&centroids, vector) else {
            return Ok(());
        };
        let (key, mut cluster) = clusters.swap_remove(positions[nearest]);
        cluster.members.insert(id.clone());
        self.tx
            .put(&self.clusters, key, serde_json::to_value(&cluster)?)
    }
}
