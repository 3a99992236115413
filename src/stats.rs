//! Incrementally maintained per-table statistics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::record::json_byte_size;
use crate::schema::{META_STATS_STORE, StoreName, StoreRole};
use crate::store::{Key, ReadView, Transaction};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    /// Live records.
    pub count: u64,
    /// Sum of the serialized sizes of the stored records.
    pub total_bytes: u64,
}

impl TableStats {
    /// Apply signed deltas, clamping at zero.
    pub fn apply(&mut self, count_delta: i64, bytes_delta: i64) {
        self.count = self.count.saturating_add_signed(count_delta);
        self.total_bytes = self.total_bytes.saturating_add_signed(bytes_delta);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseStats {
    pub total_tables: usize,
    pub tables: BTreeMap<String, TableStats>,
    pub overall_bytes: u64,
}

impl DatabaseStats {
    pub fn from_tables(tables: BTreeMap<String, TableStats>) -> Self {
        DatabaseStats {
            total_tables: tables.len(),
            overall_bytes: tables.values().map(|s| s.total_bytes).sum(),
            tables,
        }
    }
}

fn stats_key(table: &str) -> Key {
    Key::Str(format!("stats:{table}"))
}

fn decode(value: &serde_json::Value) -> TableStats {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

/// Committed statistics for `table`; zero when never written.
pub fn read(view: &ReadView<'_>, table: &str) -> Result<TableStats> {
    Ok(view
        .get(META_STATS_STORE, &stats_key(table))?
        .map(decode)
        .unwrap_or_default())
}

/// Stage a delta against the statistics as the transaction sees them.
pub fn apply_delta(
    tx: &mut Transaction<'_>,
    table: &str,
    count_delta: i64,
    bytes_delta: i64,
) -> Result<TableStats> {
    let key = stats_key(table);
    let mut stats = tx
        .get(META_STATS_STORE, &key)?
        .map(|value| decode(&value))
        .unwrap_or_default();
    stats.apply(count_delta, bytes_delta);
    tx.put(META_STATS_STORE, key, serde_json::to_value(stats)?)?;
    Ok(stats)
}

/// Recount `table` from its stored records and stage the result.
pub fn recompute(tx: &mut Transaction<'_>, table: &str) -> Result<TableStats> {
    let rows = tx.scan(&StoreName::of(table, StoreRole::Primary))?;
    let stats = TableStats {
        count: rows.len() as u64,
        total_bytes: rows.iter().map(|(_, value)| json_byte_size(value)).sum(),
    };
    tx.put(META_STATS_STORE, stats_key(table), serde_json::to_value(stats)?)?;
    Ok(stats)
}
