//! Inverted-file (IVF) index built with k-means.
//!
//! The index is a set of centroids, each with the ids of the vectors closest
//! to it. It is derived data: the vector store stays authoritative and the
//! index can be rebuilt at any time.

use std::collections::BTreeSet;

use log::debug;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PeltaError, Result};
use crate::store::Key;
use crate::vector::metric::euclidean_distance;

/// Vectors assigned sequentially below this count.
const PARALLEL_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvfCluster {
    pub centroid: Vec<f32>,
    pub members: BTreeSet<Key>,
}

/// Index of the centroid nearest to `vector` by Euclidean distance.
pub fn nearest(centroids: &[&[f32]], vector: &[f32]) -> Option<usize> {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, euclidean_distance(c, vector)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(i, _)| i)
}

/// Indexes of the `n` centroids nearest to `query`, closest first.
pub fn nearest_n(clusters: &[IvfCluster], query: &[f32], n: usize) -> Vec<usize> {
    let mut ranked: Vec<(usize, f32)> = clusters
        .iter()
        .enumerate()
        .map(|(i, c)| (i, euclidean_distance(&c.centroid, query)))
        .collect();
    ranked.sort_by(|a, b| a.1.total_cmp(&b.1));
    ranked.into_iter().take(n).map(|(i, _)| i).collect()
}

/// Lloyd's k-means with a fixed iteration count.
#[derive(Debug, Clone)]
pub struct KMeans {
    k: usize,
    iterations: usize,
    seed: Option<u64>,
}

impl KMeans {
    pub fn new(k: usize, iterations: usize) -> Self {
        KMeans {
            k,
            iterations,
            seed: None,
        }
    }

    /// Fix the random initialization for reproducible clusterings.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Cluster `vectors`, returning only non-empty clusters.
    ///
    /// `k` is clamped to the number of vectors. Initial centroids are distinct
    /// vectors picked at random. An empty cluster keeps its previous centroid.
    pub fn fit(&self, vectors: &[(Key, Vec<f32>)]) -> Result<Vec<IvfCluster>> {
        if self.k == 0 {
            return Err(PeltaError::invalid_argument(
                "IVF centroid count must be positive",
            ));
        }
        if vectors.is_empty() {
            return Ok(Vec::new());
        }

        let k = self.k.min(vectors.len());
        let dims = vectors[0].1.len();
        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        let mut centroids: Vec<Vec<f32>> = rand::seq::index::sample(&mut rng, vectors.len(), k)
            .into_iter()
            .map(|i| vectors[i].1.clone())
            .collect();

        for _ in 0..self.iterations {
            let assignments = assign(&centroids, vectors);
            let mut sums = vec![vec![0.0f32; dims]; k];
            let mut counts = vec![0usize; k];
            for ((_, vector), &cluster) in vectors.iter().zip(assignments.iter()) {
                counts[cluster] += 1;
                for (sum, value) in sums[cluster].iter_mut().zip(vector.iter()) {
                    *sum += value;
                }
            }
            for (cluster, (sum, count)) in sums.into_iter().zip(counts).enumerate() {
                if count > 0 {
                    centroids[cluster] = sum.into_iter().map(|s| s / count as f32).collect();
                }
            }
        }

        let assignments = assign(&centroids, vectors);
        let mut clusters: Vec<IvfCluster> = centroids
            .into_iter()
            .map(|centroid| IvfCluster {
                centroid,
                members: BTreeSet::new(),
            })
            .collect();
        for ((key, _), cluster) in vectors.iter().zip(assignments) {
            clusters[cluster].members.insert(key.clone());
        }
        clusters.retain(|c| !c.members.is_empty());

        debug!(
            "k-means produced {} non-empty clusters from {} vectors",
            clusters.len(),
            vectors.len()
        );
        Ok(clusters)
    }
}

fn assign(centroids: &[Vec<f32>], vectors: &[(Key, Vec<f32>)]) -> Vec<usize> {
    let refs: Vec<&[f32]> = centroids.iter().map(Vec::as_slice).collect();
    let nearest_of = |v: &Vec<f32>| nearest(&refs, v).unwrap_or(0);
    if vectors.len() > PARALLEL_THRESHOLD {
        vectors.par_iter().map(|(_, v)| nearest_of(v)).collect()
    } else {
        vectors.iter().map(|(_, v)| nearest_of(v)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blobs() -> Vec<(Key, Vec<f32>)> {
        let mut vectors = Vec::new();
        for i in 0..10 {
            let jitter = i as f32 * 0.01;
            vectors.push((Key::Int(i), vec![jitter, jitter]));
            vectors.push((Key::Int(100 + i), vec![10.0 + jitter, 10.0 - jitter]));
        }
        vectors
    }

    #[test]
    fn test_two_blobs_separate() {
        let clusters = KMeans::new(2, 10).with_seed(7).fit(&blobs()).unwrap();
        assert_eq!(clusters.len(), 2);
        for cluster in &clusters {
            let low = cluster.members.iter().all(|k| k.as_int().unwrap() < 100);
            let high = cluster.members.iter().all(|k| k.as_int().unwrap() >= 100);
            assert!(low || high);
            assert_eq!(cluster.members.len(), 10);
        }
    }

    #[test]
    fn test_k_is_clamped_and_members_cover_all() {
        let vectors = vec![
            (Key::Int(1), vec![0.0, 0.0]),
            (Key::Int(2), vec![1.0, 1.0]),
        ];
        let clusters = KMeans::new(16, 10).fit(&vectors).unwrap();
        assert!(clusters.len() <= 2);
        let total: usize = clusters.iter().map(|c| c.members.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn test_zero_k_is_rejected() {
        assert!(KMeans::new(0, 10).fit(&blobs()).is_err());
    }

    #[test]
    fn test_empty_input() {
        assert!(KMeans::new(4, 10).fit(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_nearest_n() {
        let clusters: Vec<IvfCluster> = [0.0f32, 5.0, 10.0]
            .iter()
            .map(|x| IvfCluster {
                centroid: vec![*x],
                members: BTreeSet::new(),
            })
            .collect();
        assert_eq!(nearest_n(&clusters, &[9.0], 2), vec![2, 1]);
        assert_eq!(nearest_n(&clusters, &[0.0], 5).len(), 3);
    }
}
