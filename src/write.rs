//! The write path: insert, update, delete, upsert and their bulk variants.
//!
//! Every write stages the primary record, its inverted-index postings, its
//! vector and IVF membership, and the table statistics in one transaction.
//! Nothing becomes visible unless the whole set commits. Change events are
//! dispatched only after the commit.
//!
//! Embeddings are computed before the transaction starts, since embedders
//! are async. Writes to one table hold that table's lock from the first read
//! to the commit.

use log::debug;
use serde_json::Value as JsonValue;

use crate::database::Database;
use crate::error::{PeltaError, Result};
use crate::index::{InvertedIndexWriter, record_tokens};
use crate::interceptor::{AuthRegistry, FieldTransform, Operation};
use crate::notify::{ChangeEvent, ChangeKind};
use crate::record::{Record, Value, json_byte_size};
use crate::schema::{StoreName, StoreRole, TableDefinition};
use crate::stats;
use crate::store::{Key, Transaction};
use crate::vector::VectorWriter;

/// What an update does to the record's vector.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingChange {
    Keep,
    Set(Vec<f32>),
    Clear,
}

/// A failed item of a bulk operation.
#[derive(Debug)]
pub struct BulkError {
    pub error: PeltaError,
    /// The item as supplied; for deletes, a record holding only the id.
    pub record: Record,
}

#[derive(Debug, Default)]
pub struct BulkResult {
    pub success_count: usize,
    pub errors: Vec<BulkError>,
}

impl BulkResult {
    fn fail(&mut self, error: PeltaError, record: Record) {
        self.errors.push(BulkError { error, record });
    }
}

/// Per-table collaborators of one write.
pub(crate) struct WriteContext<'a> {
    pub table: &'a str,
    pub definition: &'a TableDefinition,
    pub transform: &'a dyn FieldTransform,
    pub auth: &'a AuthRegistry,
}

impl WriteContext<'_> {
    fn primary(&self) -> String {
        StoreName::of(self.table, StoreRole::Primary)
    }

    fn dims(&self) -> Option<usize> {
        self.definition.vector.as_ref().map(|v| v.dims)
    }

    pub fn check_insert(&self, record: &Record) -> Result<()> {
        self.auth.check(Operation::Insert, self.table, Some(record))?;
        self.definition.validate(self.table, record, false)
    }

    pub fn check_update(&self, changes: &Record) -> Result<()> {
        self.auth.check(Operation::Update, self.table, Some(changes))?;
        self.definition.validate(self.table, changes, true)
    }

    fn stored_size(&self, tx: &Transaction<'_>, id: &Key) -> Result<u64> {
        Ok(tx
            .get(&self.primary(), id)?
            .as_ref()
            .map_or(0, json_byte_size))
    }

    /// Load and decode the record as the transaction sees it.
    fn load(&self, tx: &Transaction<'_>, id: &Key) -> Result<(Record, JsonValue)> {
        let value = tx
            .get(&self.primary(), id)?
            .ok_or_else(|| PeltaError::record_not_found(self.table, id.clone()))?;
        let record = self
            .transform
            .decode(self.table, Record::denormalize(&value, self.definition))?;
        Ok((record, value))
    }

    /// Stage a checked record; returns its id and the insert event.
    pub fn stage_insert(
        &self,
        tx: &mut Transaction<'_>,
        mut record: Record,
        embedding: Option<Vec<f32>>,
    ) -> Result<(Key, ChangeEvent)> {
        let stored = self.transform.encode(self.table, record.clone())?;
        let id = tx.add(&self.primary(), stored.normalize())?;
        record.set(self.definition.primary_key.clone(), Value::from(&id));

        let tokens = record_tokens(self.definition, &record);
        InvertedIndexWriter::new(tx, self.table).add(&id, &tokens)?;

        if let (Some(vector), Some(dims)) = (embedding, self.dims()) {
            VectorWriter::new(tx, self.table, dims).put(&id, vector)?;
        }

        let size = self.stored_size(tx, &id)?;
        stats::apply_delta(tx, self.table, 1, size as i64)?;
        debug!("staged insert of {id} into {} ({} tokens)", self.table, tokens.len());

        Ok((
            id,
            ChangeEvent {
                table: self.table.to_string(),
                kind: ChangeKind::Insert,
                record,
                old_record: None,
            },
        ))
    }

    /// Stage a checked partial update of `id`.
    pub fn stage_update(
        &self,
        tx: &mut Transaction<'_>,
        id: &Key,
        changes: &Record,
        embedding: EmbeddingChange,
    ) -> Result<ChangeEvent> {
        let (old, old_value) = self.load(tx, id)?;
        let mut updated = old.clone();
        updated.merge(changes);

        let stored = self.transform.encode(self.table, updated.clone())?;
        tx.put(&self.primary(), id.clone(), stored.normalize())?;

        let old_tokens = record_tokens(self.definition, &old);
        let new_tokens = record_tokens(self.definition, &updated);
        InvertedIndexWriter::new(tx, self.table).replace(id, &old_tokens, &new_tokens)?;

        if let Some(dims) = self.dims() {
            let mut vectors = VectorWriter::new(tx, self.table, dims);
            match embedding {
                EmbeddingChange::Keep => {}
                EmbeddingChange::Set(vector) => vectors.put(id, vector)?,
                EmbeddingChange::Clear => vectors.remove(id)?,
            }
        }

        let delta = self.stored_size(tx, id)? as i64 - json_byte_size(&old_value) as i64;
        stats::apply_delta(tx, self.table, 0, delta)?;

        Ok(ChangeEvent {
            table: self.table.to_string(),
            kind: ChangeKind::Update,
            record: updated,
            old_record: Some(old),
        })
    }

    /// Stage removal of `id` and everything derived from it.
    pub fn stage_delete(&self, tx: &mut Transaction<'_>, id: &Key) -> Result<ChangeEvent> {
        let (old, old_value) = self.load(tx, id)?;
        self.auth.check(Operation::Delete, self.table, Some(&old))?;

        tx.delete(&self.primary(), id)?;
        let tokens = record_tokens(self.definition, &old);
        InvertedIndexWriter::new(tx, self.table).remove(id, &tokens)?;
        if let Some(dims) = self.dims() {
            VectorWriter::new(tx, self.table, dims).remove(id)?;
        }
        stats::apply_delta(tx, self.table, -1, -(json_byte_size(&old_value) as i64))?;

        Ok(ChangeEvent {
            table: self.table.to_string(),
            kind: ChangeKind::Delete,
            record: old,
            old_record: None,
        })
    }
}

fn source_text<'r>(definition: &TableDefinition, record: &'r Record) -> Option<&'r str> {
    let config = definition.vector.as_ref()?;
    record.get(&config.source_field).and_then(Value::as_str)
}

/// A record holding only its primary key, for reporting.
fn id_record(definition: &TableDefinition, id: &Key) -> Record {
    Record::new().with(definition.primary_key.clone(), id)
}

impl Database {
    async fn insert_embedding(
        &self,
        table: &str,
        definition: &TableDefinition,
        record: &Record,
    ) -> Result<Option<Vec<f32>>> {
        match source_text(definition, record) {
            Some(text) => self.embed_text(table, definition, text).await,
            None => Ok(None),
        }
    }

    async fn update_embedding(
        &self,
        table: &str,
        definition: &TableDefinition,
        changes: &Record,
    ) -> Result<EmbeddingChange> {
        let Some(config) = &definition.vector else {
            return Ok(EmbeddingChange::Keep);
        };
        if !changes.contains(&config.source_field) || !self.embedders.contains(table) {
            return Ok(EmbeddingChange::Keep);
        }
        let text = source_text(definition, changes).unwrap_or_default();
        Ok(match self.embed_text(table, definition, text).await? {
            Some(vector) => EmbeddingChange::Set(vector),
            None => EmbeddingChange::Clear,
        })
    }

    /// Insert a record, returning its primary key.
    pub async fn insert(&self, table: &str, record: Record) -> Result<Key> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        self.insert_locked(table, &definition, &engine, record).await
    }

    async fn insert_locked(
        &self,
        table: &str,
        definition: &TableDefinition,
        engine: &crate::store::Engine,
        record: Record,
    ) -> Result<Key> {
        let transform = self.transform();
        let ctx = WriteContext {
            table,
            definition,
            transform: transform.as_ref(),
            auth: &self.auth,
        };
        ctx.check_insert(&record)?;
        let embedding = self.insert_embedding(table, definition, &record).await?;

        let mut tx = engine.begin();
        let (id, event) = ctx.stage_insert(&mut tx, record, embedding)?;
        tx.commit()?;
        self.bus.dispatch(&[event]);
        Ok(id)
    }

    /// Apply `changes` to the record `id`, returning the updated record.
    pub async fn update(&self, table: &str, id: impl Into<Key>, changes: Record) -> Result<Record> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        self.update_locked(table, &definition, &engine, &id.into(), changes)
            .await
    }

    async fn update_locked(
        &self,
        table: &str,
        definition: &TableDefinition,
        engine: &crate::store::Engine,
        id: &Key,
        changes: Record,
    ) -> Result<Record> {
        let transform = self.transform();
        let ctx = WriteContext {
            table,
            definition,
            transform: transform.as_ref(),
            auth: &self.auth,
        };
        ctx.check_update(&changes)?;
        let embedding = self.update_embedding(table, definition, &changes).await?;

        let mut tx = engine.begin();
        let event = ctx.stage_update(&mut tx, id, &changes, embedding)?;
        tx.commit()?;
        let updated = event.record.clone();
        self.bus.dispatch(&[event]);
        Ok(updated)
    }

    pub async fn delete(&self, table: &str, id: impl Into<Key>) -> Result<()> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        let transform = self.transform();
        let ctx = WriteContext {
            table,
            definition: &definition,
            transform: transform.as_ref(),
            auth: &self.auth,
        };

        let mut tx = engine.begin();
        let event = ctx.stage_delete(&mut tx, &id.into())?;
        tx.commit()?;
        self.bus.dispatch(&[event]);
        Ok(())
    }

    /// Update the record if its primary key exists, otherwise insert it.
    pub async fn upsert(&self, table: &str, mut record: Record) -> Result<Key> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;

        let primary = StoreName::of(table, StoreRole::Primary);
        let existing = match record.key(&definition.primary_key) {
            Some(id) => {
                let exists = engine.read(|view| view.get(&primary, &id).map(|v| v.is_some()))?;
                exists.then_some(id)
            }
            None => None,
        };

        match existing {
            Some(id) => {
                record.remove(&definition.primary_key);
                self.update_locked(table, &definition, &engine, &id, record)
                    .await?;
                Ok(id)
            }
            None => self.insert_locked(table, &definition, &engine, record).await,
        }
    }

    /// Insert every record in one transaction, skipping the ones that fail.
    pub async fn bulk_insert(&self, table: &str, records: Vec<Record>) -> Result<BulkResult> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        let transform = self.transform();
        let ctx = WriteContext {
            table,
            definition: &definition,
            transform: transform.as_ref(),
            auth: &self.auth,
        };

        let mut result = BulkResult::default();
        let mut prepared = Vec::with_capacity(records.len());
        for record in records {
            let checked = match ctx.check_insert(&record) {
                Ok(()) => self.insert_embedding(table, &definition, &record).await,
                Err(e) => Err(e),
            };
            match checked {
                Ok(embedding) => prepared.push((record, embedding)),
                Err(e) => result.fail(e, record),
            }
        }

        let mut tx = engine.begin();
        let mut events = Vec::new();
        for (record, embedding) in prepared {
            tx.begin_item();
            match ctx.stage_insert(&mut tx, record.clone(), embedding) {
                Ok((_, event)) => {
                    tx.commit_item();
                    events.push(event);
                }
                Err(e) => {
                    tx.rollback_item();
                    result.fail(e, record);
                }
            }
        }
        tx.commit()?;

        result.success_count = events.len();
        debug!(
            "bulk insert into {table}: {} ok, {} failed",
            result.success_count,
            result.errors.len()
        );
        self.bus.dispatch(&events);
        Ok(result)
    }

    /// Apply each `(id, changes)` pair in one transaction, skipping failures.
    pub async fn bulk_update(
        &self,
        table: &str,
        updates: Vec<(Key, Record)>,
    ) -> Result<BulkResult> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        let transform = self.transform();
        let ctx = WriteContext {
            table,
            definition: &definition,
            transform: transform.as_ref(),
            auth: &self.auth,
        };
        let report = |id: &Key, changes: &Record| {
            let mut record = changes.clone();
            record.set(definition.primary_key.clone(), id);
            record
        };

        let mut result = BulkResult::default();
        let mut prepared = Vec::with_capacity(updates.len());
        for (id, changes) in updates {
            let checked = match ctx.check_update(&changes) {
                Ok(()) => self.update_embedding(table, &definition, &changes).await,
                Err(e) => Err(e),
            };
            match checked {
                Ok(embedding) => prepared.push((id, changes, embedding)),
                Err(e) => result.fail(e, report(&id, &changes)),
            }
        }

        let mut tx = engine.begin();
        let mut events = Vec::new();
        for (id, changes, embedding) in prepared {
            tx.begin_item();
            match ctx.stage_update(&mut tx, &id, &changes, embedding) {
                Ok(event) => {
                    tx.commit_item();
                    events.push(event);
                }
                Err(e) => {
                    tx.rollback_item();
                    result.fail(e, report(&id, &changes));
                }
            }
        }
        tx.commit()?;

        result.success_count = events.len();
        self.bus.dispatch(&events);
        Ok(result)
    }

    /// Delete each id in one transaction, skipping failures.
    pub async fn bulk_delete(&self, table: &str, ids: Vec<Key>) -> Result<BulkResult> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        let transform = self.transform();
        let ctx = WriteContext {
            table,
            definition: &definition,
            transform: transform.as_ref(),
            auth: &self.auth,
        };

        let mut result = BulkResult::default();
        let mut tx = engine.begin();
        let mut events = Vec::new();
        for id in ids {
            tx.begin_item();
            match ctx.stage_delete(&mut tx, &id) {
                Ok(event) => {
                    tx.commit_item();
                    events.push(event);
                }
                Err(e) => {
                    tx.rollback_item();
                    result.fail(e, id_record(&definition, &id));
                }
            }
        }
        tx.commit()?;

        result.success_count = events.len();
        self.bus.dispatch(&events);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::schema::{ColumnType, Schema};
    use crate::vector::FnEmbedder;
    use std::sync::Arc;

    fn schema() -> Schema {
        let mut schema = Schema::new();
        schema.insert(
            "notes".to_string(),
            TableDefinition::new()
                .column("text", ColumnType::String)
                .column("meta", ColumnType::Json)
                .with_vector("text", 2),
        );
        schema
    }

    async fn db() -> Database {
        let db = Database::new(DatabaseConfig::new("w"), schema()).unwrap();
        db.load().await.unwrap();
        db.register_embedder(
            "notes",
            Arc::new(FnEmbedder::new(|text: String| async move {
                if text == "bad" {
                    Ok::<_, PeltaError>(vec![1.0])
                } else {
                    Ok(vec![text.len() as f32, 1.0])
                }
            })),
        )
        .unwrap();
        db
    }

    #[tokio::test]
    async fn test_dimension_mismatch_fails_whole_insert() {
        let db = db().await;
        let result = db.insert("notes", Record::new().with("text", "bad")).await;
        assert!(matches!(result, Err(PeltaError::DimensionMismatch { .. })));
        assert!(db.get_all("notes", None).await.unwrap().is_empty());
        assert_eq!(db.get_stats("notes").await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_update_reembeds_and_clears() {
        let db = db().await;
        let id = db.insert("notes", Record::new().with("text", "abc")).await.unwrap();
        let engine = db.engine().unwrap();
        let vector = engine.read(|view| crate::vector::stored_vector(view, "notes", &id)).unwrap();
        assert_eq!(vector, Some(vec![3.0, 1.0]));

        db.update("notes", id.clone(), Record::new().with("text", "abcde"))
            .await
            .unwrap();
        let vector = engine.read(|view| crate::vector::stored_vector(view, "notes", &id)).unwrap();
        assert_eq!(vector, Some(vec![5.0, 1.0]));

        db.update("notes", id.clone(), Record::new().with("text", ""))
            .await
            .unwrap();
        let vector = engine.read(|view| crate::vector::stored_vector(view, "notes", &id)).unwrap();
        assert_eq!(vector, None);
    }

    #[tokio::test]
    async fn test_update_rejects_primary_key_change() {
        let db = db().await;
        let id = db.insert("notes", Record::new().with("text", "a")).await.unwrap();
        let result = db
            .update("notes", id, Record::new().with("id", 99).with("text", "b"))
            .await;
        assert!(matches!(result, Err(PeltaError::Validation(_))));
    }

    #[tokio::test]
    async fn test_bulk_insert_isolates_failures() {
        let db = db().await;
        let result = db
            .bulk_insert(
                "notes",
                vec![
                    Record::new().with("text", "one"),
                    Record::new().with("text", 5),
                    Record::new().with("text", "bad"),
                    Record::new().with("id", 1).with("text", "dup"),
                    Record::new().with("text", "two"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(result.success_count, 2);
        assert_eq!(result.errors.len(), 3);
        assert!(
            result
                .errors
                .iter()
                .any(|e| matches!(e.error, PeltaError::Constraint(_)))
        );
        assert_eq!(db.get_stats("notes").await.unwrap().count, 2);
    }

    #[tokio::test]
    async fn test_bulk_delete_reports_missing_ids() {
        let db = db().await;
        let id = db.insert("notes", Record::new().with("text", "x")).await.unwrap();
        let result = db
            .bulk_delete("notes", vec![id, Key::Int(404)])
            .await
            .unwrap();
        assert_eq!(result.success_count, 1);
        assert!(matches!(
            result.errors[0].error,
            PeltaError::RecordNotFound { .. }
        ));
        assert_eq!(result.errors[0].record.key("id"), Some(Key::Int(404)));
    }

    #[tokio::test]
    async fn test_upsert() {
        let db = db().await;
        let id = db.upsert("notes", Record::new().with("text", "first")).await.unwrap();
        let same = db
            .upsert("notes", Record::new().with("id", &id).with("text", "second"))
            .await
            .unwrap();
        assert_eq!(id, same);
        let record = db.get("notes", id).await.unwrap().unwrap();
        assert_eq!(record.get("text"), Some(&Value::from("second")));
        assert_eq!(db.get_stats("notes").await.unwrap().count, 1);
    }
}
