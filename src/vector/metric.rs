//! Similarity metrics for vector search.
//!
//! Every metric is oriented so that a higher score means closer.

use std::fmt;
use std::str::FromStr;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PeltaError, Result};

/// Vectors scored sequentially below this count.
const PARALLEL_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `dot / (|a|·|b|)`, with a zero denominator treated as 1.
    #[default]
    Cosine,
    /// Raw dot product.
    Dot,
    /// Negative Euclidean distance.
    Euclidean,
}

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn norm(a: &[f32]) -> f32 {
    a.iter().map(|x| x * x).sum::<f32>().sqrt()
}

pub fn euclidean_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y).powi(2))
        .sum::<f32>()
        .sqrt()
}

impl DistanceMetric {
    /// Score `candidate` against `query`. Callers guarantee equal lengths.
    pub fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let denominator = norm(query) * norm(candidate);
                let denominator = if denominator == 0.0 { 1.0 } else { denominator };
                dot(query, candidate) / denominator
            }
            DistanceMetric::Dot => dot(query, candidate),
            DistanceMetric::Euclidean => -euclidean_distance(query, candidate),
        }
    }

    /// Score many candidates, in parallel for large batches.
    pub fn score_batch<T: Sync>(
        &self,
        query: &[f32],
        candidates: &[(T, Vec<f32>)],
    ) -> Vec<f32> {
        if candidates.len() < PARALLEL_THRESHOLD {
            candidates
                .iter()
                .map(|(_, v)| self.score(query, v))
                .collect()
        } else {
            candidates
                .par_iter()
                .map(|(_, v)| self.score(query, v))
                .collect()
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Dot => "dot",
            DistanceMetric::Euclidean => "euclidean",
        }
    }

    pub fn parse_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "cosine" => Ok(DistanceMetric::Cosine),
            "dot" | "dot_product" => Ok(DistanceMetric::Dot),
            "euclidean" | "l2" => Ok(DistanceMetric::Euclidean),
            _ => Err(PeltaError::invalid_argument(format!(
                "Unknown distance metric: {s}"
            ))),
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DistanceMetric {
    type Err = PeltaError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine() {
        let score = DistanceMetric::Cosine.score(&[1.0, 0.0], &[1.0, 0.0]);
        assert!((score - 1.0).abs() < 1e-6);
        let score = DistanceMetric::Cosine.score(&[1.0, 0.0], &[0.0, 1.0]);
        assert!(score.abs() < 1e-6);
        // Zero vectors score 0 instead of NaN.
        assert_eq!(DistanceMetric::Cosine.score(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn test_dot_and_euclidean() {
        assert_eq!(DistanceMetric::Dot.score(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert_eq!(DistanceMetric::Euclidean.score(&[0.0, 0.0], &[3.0, 4.0]), -5.0);
        assert!(
            DistanceMetric::Euclidean.score(&[0.0, 0.0], &[1.0, 0.0])
                > DistanceMetric::Euclidean.score(&[0.0, 0.0], &[2.0, 0.0])
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("L2".parse::<DistanceMetric>().unwrap(), DistanceMetric::Euclidean);
        assert_eq!(DistanceMetric::parse_str("dot").unwrap(), DistanceMetric::Dot);
        assert!(DistanceMetric::parse_str("manhattan").is_err());
    }

    #[test]
    fn test_score_batch_matches_single() {
        let candidates: Vec<(usize, Vec<f32>)> =
            (0..1500).map(|i| (i, vec![i as f32, 1.0])).collect();
        let scores = DistanceMetric::Dot.score_batch(&[1.0, 0.0], &candidates);
        assert_eq!(scores.len(), 1500);
        assert_eq!(scores[1499], 1499.0);
    }
}
