//! TF-IDF full-text search over the inverted index.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;

use crate::analysis::{idf, tokenize};
use crate::error::Result;
use crate::index;
use crate::interceptor::FieldTransform;
use crate::query::Where;
use crate::record::{Record, Value};
use crate::schema::{ColumnType, StoreName, StoreRole, TableDefinition};
use crate::stats;
use crate::store::{Direction, Key, KeyRange, ReadView};

/// Date column consulted by [`SearchOptions::time_range`].
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Inclusive bounds on the `timestamp` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        TimeRange { start, end }
    }

    fn admits(&self, definition: &TableDefinition, record: &Record) -> bool {
        if definition.column_type(TIMESTAMP_FIELD) != Some(ColumnType::Date) {
            return true;
        }
        match record.get(TIMESTAMP_FIELD) {
            Some(Value::Date(at)) => *at >= self.start && *at <= self.end,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Defaults to the configured search limit.
    pub limit: Option<usize>,
    pub time_range: Option<TimeRange>,
    /// Structured conditions applied to every candidate.
    pub filter: Where,
}

impl SearchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_time_range(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn with_filter(mut self, filter: Where) -> Self {
        self.filter = filter;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: Key,
    pub score: f64,
    pub record: Record,
}

/// Accumulated TF-IDF score per candidate id.
pub fn score_tokens(view: &ReadView<'_>, table: &str, tokens: &[String]) -> Result<BTreeMap<Key, f64>> {
    let total_docs = stats::read(view, table)?.count;
    let mut scores: BTreeMap<Key, f64> = BTreeMap::new();
    for token in tokens {
        let ids = index::lookup(view, table, token)?;
        let weight = idf(total_docs, ids.len());
        for id in ids {
            *scores.entry(id).or_insert(0.0) += weight;
        }
    }
    Ok(scores)
}

/// Rank records of `table` against `query`.
///
/// A query without tokens matches every record with score 0.
pub fn search(
    view: &ReadView<'_>,
    table: &str,
    definition: &TableDefinition,
    transform: &dyn FieldTransform,
    query: &str,
    options: &SearchOptions,
    limit: usize,
) -> Result<Vec<SearchHit>> {
    let tokens = tokenize(query);
    let primary = StoreName::of(table, StoreRole::Primary);

    let candidates: Vec<(Key, f64)> = if tokens.is_empty() {
        view.scan(&primary, &KeyRange::all(), Direction::Asc)?
            .map(|(key, _)| (key.clone(), 0.0))
            .collect()
    } else {
        score_tokens(view, table, &tokens)?.into_iter().collect()
    };
    debug!(
        "search on {table}: {} tokens, {} candidates",
        tokens.len(),
        candidates.len()
    );

    let mut hits = Vec::new();
    for (id, score) in candidates {
        // Posting lists may briefly reference ids that no longer exist.
        let Some(value) = view.get(&primary, &id)? else {
            continue;
        };
        let record = transform.decode(table, Record::denormalize(value, definition))?;
        if !options.filter.matches(&record) {
            continue;
        }
        if let Some(range) = &options.time_range {
            if !range.admits(definition, &record) {
                continue;
            }
        }
        hits.push(SearchHit { id, score, record });
    }

    hits.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    hits.truncate(limit);
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_time_range_requires_timestamp_column() {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 31, 0, 0, 0).unwrap(),
        );
        let inside = Record::new().with("timestamp", Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        let outside = Record::new().with("timestamp", Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap());

        let with_column = TableDefinition::new().column("timestamp", ColumnType::Date);
        assert!(range.admits(&with_column, &inside));
        assert!(!range.admits(&with_column, &outside));
        // Bounds are inclusive.
        let edge = Record::new().with("timestamp", range.end);
        assert!(range.admits(&with_column, &edge));

        let without_column = TableDefinition::new().column("text", ColumnType::String);
        assert!(range.admits(&without_column, &outside));
    }
}
