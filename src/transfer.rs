//! JSON export and import of whole tables.
//!
//! Export produces `table → [normalized record]`, optionally with each
//! record's embedding under `"vector"`. Import runs in a single transaction:
//! every row is validated and re-inserted, the inverted index is rebuilt from
//! scratch, embedded vectors are restored and statistics are recounted. A
//! bad row fails the whole import.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::database::Database;
use crate::error::{PeltaError, Result};
use crate::index::InvertedIndexWriter;
use crate::interceptor::Operation;
use crate::record::Record;
use crate::schema::{StoreName, StoreRole};
use crate::stats;
use crate::store::{Direction, KeyRange};
use crate::vector::{self, VectorWriter};

/// Field carrying a record's embedding in exported rows.
pub const VECTOR_FIELD: &str = "vector";

/// Table → rows in storage form.
pub type ExportData = BTreeMap<String, Vec<JsonValue>>;

#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Tables to export; all tables when `None`.
    pub tables: Option<Vec<String>>,
    pub include_vectors: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportMode {
    /// Rows overwrite records with the same id; other records stay.
    #[default]
    Merge,
    /// Each imported table is emptied first.
    Replace,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Merge => f.write_str("merge"),
            ImportMode::Replace => f.write_str("replace"),
        }
    }
}

impl FromStr for ImportMode {
    type Err = PeltaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "merge" => Ok(ImportMode::Merge),
            "replace" => Ok(ImportMode::Replace),
            _ => Err(PeltaError::invalid_argument(format!(
                "Unknown import mode: {s}"
            ))),
        }
    }
}

/// Rows imported per table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub tables: BTreeMap<String, usize>,
}

impl ImportSummary {
    pub fn total(&self) -> usize {
        self.tables.values().sum()
    }
}

fn parse_vector(value: &JsonValue) -> Result<Vec<f32>> {
    let items = value
        .as_array()
        .ok_or_else(|| PeltaError::validation("vector must be an array of numbers"))?;
    items
        .iter()
        .map(|item| {
            item.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| PeltaError::validation("vector must be an array of numbers"))
        })
        .collect()
}

impl Database {
    pub async fn export(&self, options: ExportOptions) -> Result<ExportData> {
        let engine = self.engine()?;
        let tables = match options.tables {
            Some(tables) => tables,
            None => self.registry.read().table_names().cloned().collect(),
        };
        let transform = self.transform();

        let mut data = ExportData::new();
        for table in tables {
            let definition = self.table_definition(&table)?;
            self.auth.check(Operation::Read, &table, None)?;
            let store = StoreName::of(&table, StoreRole::Primary);
            let with_vectors = options.include_vectors && definition.vector.is_some();

            let rows = engine.read(|view| -> Result<Vec<JsonValue>> {
                let mut rows = Vec::new();
                for (id, value) in view.scan(&store, &KeyRange::all(), Direction::Asc)? {
                    let record =
                        transform.decode(&table, Record::denormalize(value, &definition))?;
                    let mut row = record.normalize();
                    if with_vectors {
                        if let (Some(vector), Some(object)) =
                            (vector::stored_vector(view, &table, id)?, row.as_object_mut())
                        {
                            object.insert(VECTOR_FIELD.to_string(), serde_json::to_value(vector)?);
                        }
                    }
                    rows.push(row);
                }
                Ok(rows)
            })?;
            data.insert(table, rows);
        }
        Ok(data)
    }

    pub async fn import(&self, data: ExportData, mode: ImportMode) -> Result<ImportSummary> {
        let engine = self.engine()?;
        let mut definitions = BTreeMap::new();
        for table in data.keys() {
            definitions.insert(table.clone(), self.table_definition(table)?);
        }

        // BTreeMap order gives a stable lock order across tables.
        let mut guards = Vec::with_capacity(definitions.len());
        for table in definitions.keys() {
            guards.push(self.lock_table(table).await);
        }

        let transform = self.transform();
        let mut summary = ImportSummary::default();
        let mut tx = engine.begin();
        for (table, rows) in data {
            let definition = &definitions[&table];
            let primary = StoreName::of(&table, StoreRole::Primary);
            let dims = definition.vector.as_ref().map(|v| v.dims);

            if mode == ImportMode::Replace {
                tx.clear(&primary)?;
                tx.clear(&StoreName::of(&table, StoreRole::InvertedIndex))?;
                if let Some(dims) = dims {
                    VectorWriter::new(&mut tx, &table, dims).clear()?;
                }
            }

            let count = rows.len();
            for mut row in rows {
                let vector = match (dims, row.as_object_mut()) {
                    (Some(_), Some(object)) => object.remove(VECTOR_FIELD),
                    _ => None,
                };
                let record = Record::from_json(&row, definition)?;
                self.auth.check(Operation::Insert, &table, Some(&record))?;
                definition.validate(&table, &record, false)?;

                let stored = transform.encode(&table, record.clone())?.normalize();
                let id = match record.key(&definition.primary_key) {
                    Some(id) => {
                        tx.put(&primary, id.clone(), stored)?;
                        id
                    }
                    None => tx.add(&primary, stored)?,
                };

                if let (Some(dims), Some(vector)) = (dims, vector.filter(|v| !v.is_null())) {
                    VectorWriter::new(&mut tx, &table, dims).put(&id, parse_vector(&vector)?)?;
                }
            }

            InvertedIndexWriter::new(&mut tx, &table).rebuild(
                &table,
                definition,
                transform.as_ref(),
            )?;
            stats::recompute(&mut tx, &table)?;
            summary.tables.insert(table, count);
        }
        tx.commit()?;
        drop(guards);

        info!(
            "imported {} rows into {} tables ({mode})",
            summary.total(),
            summary.tables.len()
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_mode_parse() {
        assert_eq!("Replace".parse::<ImportMode>().unwrap(), ImportMode::Replace);
        assert_eq!(ImportMode::default(), ImportMode::Merge);
        assert!("upsert".parse::<ImportMode>().is_err());
    }

    #[test]
    fn test_parse_vector() {
        assert_eq!(
            parse_vector(&serde_json::json!([1, 2.5])).unwrap(),
            vec![1.0, 2.5]
        );
        assert!(parse_vector(&serde_json::json!(["x"])).is_err());
        assert!(parse_vector(&serde_json::json!(3)).is_err());
    }
}
