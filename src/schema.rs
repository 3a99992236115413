//! Table definitions and the schema registry.
//!
//! A [`TableDefinition`] declares a table's columns, primary key, full-text
//! searchable fields, secondary indexes, optional validator and optional
//! vector configuration. The [`SchemaRegistry`] owns the definitions, maps
//! each table onto its backing object stores and creates those stores during
//! a version upgrade.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{PeltaError, Result};
use crate::record::{Record, Value};
use crate::store::{Key, ReadView, StoreDef, Transaction, UpgradeContext};

/// Store holding the serializable copy of every table definition.
pub const META_SCHEMA_STORE: &str = "_meta_schema";

/// Store holding per-table statistics.
pub const META_STATS_STORE: &str = "_meta_stats";

pub const DEFAULT_PRIMARY_KEY: &str = "id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    String,
    Number,
    Boolean,
    Date,
    Json,
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnType::String => "string",
            ColumnType::Number => "number",
            ColumnType::Boolean => "boolean",
            ColumnType::Date => "date",
            ColumnType::Json => "json",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorConfig {
    /// Text column whose content is embedded.
    pub source_field: String,
    pub dims: usize,
}

/// Extra validation rules run after the column type check.
pub trait RecordValidator: Send + Sync {
    /// `partial` is true for update payloads, which carry only changed fields.
    fn validate(&self, record: &Record, partial: bool) -> std::result::Result<(), String>;
}

impl<F> RecordValidator for F
where
    F: Fn(&Record, bool) -> std::result::Result<(), String> + Send + Sync,
{
    fn validate(&self, record: &Record, partial: bool) -> std::result::Result<(), String> {
        self(record, partial)
    }
}

/// The role a backing object store plays for its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreRole {
    Primary,
    InvertedIndex,
    VectorStore,
    IvfIndex,
}

/// Typed mapping from (table, role) to object store name.
pub struct StoreName;

impl StoreName {
    pub fn of(table: &str, role: StoreRole) -> String {
        match role {
            StoreRole::Primary => table.to_string(),
            StoreRole::InvertedIndex => format!("_ii_{table}"),
            StoreRole::VectorStore => format!("_vec_{table}"),
            StoreRole::IvfIndex => format!("_ivf_{table}"),
        }
    }
}

fn default_primary_key() -> String {
    DEFAULT_PRIMARY_KEY.to_string()
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDefinition {
    pub columns: BTreeMap<String, ColumnType>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub searchable_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondary_indexes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorConfig>,
    #[serde(skip)]
    pub validator: Option<Arc<dyn RecordValidator>>,
}

impl fmt::Debug for TableDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableDefinition")
            .field("columns", &self.columns)
            .field("primary_key", &self.primary_key)
            .field("searchable_fields", &self.searchable_fields)
            .field("secondary_indexes", &self.secondary_indexes)
            .field("vector", &self.vector)
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

impl Default for TableDefinition {
    fn default() -> Self {
        TableDefinition {
            columns: BTreeMap::new(),
            primary_key: default_primary_key(),
            searchable_fields: None,
            secondary_indexes: Vec::new(),
            vector: None,
            validator: None,
        }
    }
}

impl TableDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column<S: Into<String>>(mut self, name: S, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    pub fn with_primary_key<S: Into<String>>(mut self, name: S) -> Self {
        self.primary_key = name.into();
        self
    }

    pub fn with_searchable_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.searchable_fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_index<S: Into<String>>(mut self, field: S) -> Self {
        let field = field.into();
        if !self.secondary_indexes.contains(&field) {
            self.secondary_indexes.push(field);
        }
        self
    }

    pub fn with_vector<S: Into<String>>(mut self, source_field: S, dims: usize) -> Self {
        self.vector = Some(VectorConfig {
            source_field: source_field.into(),
            dims,
        });
        self
    }

    pub fn with_validator<V: RecordValidator + 'static>(mut self, validator: V) -> Self {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn column_type(&self, field: &str) -> Option<ColumnType> {
        self.columns.get(field).copied()
    }

    /// Fields tokenized into the inverted index.
    pub fn searchable(&self) -> Vec<&str> {
        match &self.searchable_fields {
            Some(fields) => fields.iter().map(String::as_str).collect(),
            None => self
                .columns
                .iter()
                .filter(|(_, t)| **t == ColumnType::String)
                .map(|(name, _)| name.as_str())
                .collect(),
        }
    }

    /// Integer keys are generated when the primary key is undeclared or numeric.
    pub fn auto_increment(&self) -> bool {
        matches!(
            self.column_type(&self.primary_key),
            None | Some(ColumnType::Number)
        )
    }

    /// Whether `field` can drive an index traversal.
    pub fn is_indexed(&self, field: &str) -> bool {
        field == self.primary_key || self.secondary_indexes.iter().any(|f| f == field)
    }

    /// Structural checks run when a definition is registered.
    pub fn check(&self, table: &str) -> Result<()> {
        if table.is_empty() || table.starts_with('_') {
            return Err(PeltaError::schema(format!(
                "Invalid table name {table:?}: names must be non-empty and not start with '_'"
            )));
        }
        match self.column_type(&self.primary_key) {
            None | Some(ColumnType::Number) | Some(ColumnType::String) => {}
            Some(other) => {
                return Err(PeltaError::schema(format!(
                    "Primary key {}.{} must be a number or string column, not {other}",
                    table, self.primary_key
                )));
            }
        }
        if let Some(fields) = &self.searchable_fields {
            for field in fields {
                if !self.columns.contains_key(field) {
                    return Err(PeltaError::schema(format!(
                        "Searchable field {table}.{field} is not a declared column"
                    )));
                }
            }
        }
        for field in &self.secondary_indexes {
            if !self.columns.contains_key(field) && *field != self.primary_key {
                return Err(PeltaError::schema(format!(
                    "Indexed field {table}.{field} is not a declared column"
                )));
            }
        }
        if let Some(vector) = &self.vector {
            if vector.dims == 0 {
                return Err(PeltaError::schema(format!(
                    "Vector dims for {table} must be positive"
                )));
            }
            if self.column_type(&vector.source_field) != Some(ColumnType::String) {
                return Err(PeltaError::schema(format!(
                    "Vector source field {table}.{} must be a string column",
                    vector.source_field
                )));
            }
        }
        Ok(())
    }

    /// Column types and vector dims are fixed once persisted.
    pub fn check_compatible(&self, table: &str, persisted: &TableDefinition) -> Result<()> {
        for (column, persisted_type) in &persisted.columns {
            if let Some(current) = self.column_type(column) {
                if current != *persisted_type {
                    return Err(PeltaError::schema(format!(
                        "Column {table}.{column} was {persisted_type}, cannot change to {current}"
                    )));
                }
            }
        }
        if self.primary_key != persisted.primary_key {
            return Err(PeltaError::schema(format!(
                "Primary key of {table} cannot change from {} to {}",
                persisted.primary_key, self.primary_key
            )));
        }
        if let (Some(current), Some(old)) = (&self.vector, &persisted.vector) {
            if current.dims != old.dims {
                return Err(PeltaError::schema(format!(
                    "Vector dims of {table} cannot change from {} to {}",
                    old.dims, current.dims
                )));
            }
        }
        Ok(())
    }

    /// Check a full record (primary key optional) or an update payload.
    pub fn validate(&self, table: &str, record: &Record, partial: bool) -> Result<()> {
        for (field, value) in record.fields() {
            if *field == self.primary_key {
                if partial {
                    return Err(PeltaError::validation(format!(
                        "{table}.{field}: primary key cannot be updated"
                    )));
                }
                if value.is_null() {
                    continue;
                }
                let key_ok = match self.column_type(field) {
                    Some(ColumnType::String) => matches!(value, Value::String(_)),
                    _ => value.to_key().is_some_and(|k| matches!(k, Key::Int(_))),
                };
                if !key_ok {
                    return Err(PeltaError::validation(format!(
                        "{table}.{field}: invalid primary key {}",
                        value.to_json()
                    )));
                }
                continue;
            }
            let Some(column_type) = self.column_type(field) else {
                return Err(PeltaError::validation(format!(
                    "{table}.{field}: unknown column"
                )));
            };
            if !value.conforms_to(column_type) {
                return Err(PeltaError::validation(format!(
                    "{table}.{field}: expected {column_type}, got {}",
                    value.type_name()
                )));
            }
        }

        if !partial {
            for (column, column_type) in &self.columns {
                if *column == self.primary_key || *column_type == ColumnType::Json {
                    continue;
                }
                if !record.contains(column) {
                    return Err(PeltaError::validation(format!(
                        "{table}.{column}: required"
                    )));
                }
            }
        }

        if let Some(validator) = &self.validator {
            validator
                .validate(record, partial)
                .map_err(|msg| PeltaError::validation(format!("{table}: {msg}")))?;
        }
        Ok(())
    }
}

/// Table name → definition.
pub type Schema = BTreeMap<String, TableDefinition>;

/// Registered table definitions and their mapping onto object stores.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    tables: Schema,
}

impl SchemaRegistry {
    pub fn new(tables: Schema) -> Result<Self> {
        let mut registry = SchemaRegistry::default();
        registry.define(tables)?;
        Ok(registry)
    }

    /// Add or replace definitions.
    pub fn define(&mut self, tables: Schema) -> Result<()> {
        for (table, definition) in &tables {
            definition.check(table)?;
        }
        self.tables.extend(tables);
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.tables
    }

    pub fn table_names(&self) -> impl Iterator<Item = &String> {
        self.tables.keys()
    }

    pub fn get(&self, table: &str) -> Option<&TableDefinition> {
        self.tables.get(table)
    }

    pub fn table(&self, table: &str) -> Result<&TableDefinition> {
        self.tables
            .get(table)
            .ok_or_else(|| PeltaError::table_not_found(table))
    }

    /// Object stores required by the registered tables.
    pub fn required_stores(&self) -> Vec<StoreDef> {
        let mut stores = vec![
            StoreDef::out_of_line(META_SCHEMA_STORE),
            StoreDef::out_of_line(META_STATS_STORE),
        ];
        for (table, definition) in &self.tables {
            let mut primary = StoreDef::keyed(
                StoreName::of(table, StoreRole::Primary),
                definition.primary_key.clone(),
                definition.auto_increment(),
            );
            primary.indexes = definition.secondary_indexes.iter().cloned().collect();
            primary.indexes.remove(&definition.primary_key);
            stores.push(primary);
            stores.push(StoreDef::out_of_line(StoreName::of(
                table,
                StoreRole::InvertedIndex,
            )));
            if definition.vector.is_some() {
                stores.push(StoreDef::out_of_line(StoreName::of(
                    table,
                    StoreRole::VectorStore,
                )));
                stores.push(StoreDef::out_of_line(StoreName::of(table, StoreRole::IvfIndex)));
            }
        }
        stores
    }

    /// Whether the stores and indexes of every table already exist.
    pub fn is_materialized(&self, view: &ReadView<'_>) -> bool {
        self.required_stores().iter().all(|def| {
            view.has_store(&def.name)
                && def.indexes.iter().all(|field| view.has_index(&def.name, field))
        })
    }

    /// Create missing stores and indexes. Existing data is never touched.
    pub fn apply_upgrade(&self, ctx: &mut UpgradeContext<'_>) -> Result<()> {
        for def in self.required_stores() {
            let indexes = def.indexes.clone();
            let name = def.name.clone();
            if !ctx.has_store(&name) {
                debug!("schema upgrade: creating {name}");
                let mut bare = def;
                bare.indexes.clear();
                ctx.create_store(bare)?;
            }
            for field in &indexes {
                ctx.create_index(&name, field)?;
            }
        }
        Ok(())
    }

    /// Read the persisted definitions.
    pub fn load_persisted(view: &ReadView<'_>) -> Result<Schema> {
        if !view.has_store(META_SCHEMA_STORE) {
            return Ok(Schema::new());
        }
        let mut schema = Schema::new();
        for (key, value) in view.scan(META_SCHEMA_STORE, &Default::default(), Default::default())? {
            let definition: TableDefinition = serde_json::from_value(value.clone())?;
            schema.insert(key.to_string(), definition);
        }
        Ok(schema)
    }

    /// Reject definitions that change persisted column types or dims.
    pub fn check_against(&self, persisted: &Schema) -> Result<()> {
        for (table, definition) in &self.tables {
            if let Some(old) = persisted.get(table) {
                definition.check_compatible(table, old)?;
            }
        }
        Ok(())
    }

    /// Stage the serializable copy of every definition.
    pub fn persist(&self, tx: &mut Transaction<'_>) -> Result<()> {
        for (table, definition) in &self.tables {
            let value: JsonValue = serde_json::to_value(definition)?;
            tx.put(META_SCHEMA_STORE, Key::from(table.as_str()), value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn messages() -> TableDefinition {
        TableDefinition::new()
            .column("id", ColumnType::Number)
            .column("text", ColumnType::String)
            .column("userId", ColumnType::Number)
            .column("createdAt", ColumnType::Date)
            .with_index("userId")
    }

    #[test]
    fn test_searchable_defaults_to_string_columns() {
        let def = messages();
        assert_eq!(def.searchable(), vec!["text"]);
        let def = def.with_searchable_fields(["text"]);
        assert_eq!(def.searchable(), vec!["text"]);
    }

    #[test]
    fn test_validate_full_record() {
        let def = messages();
        let ok = Record::new()
            .with("text", "hi")
            .with("userId", 1)
            .with("createdAt", Utc::now());
        def.validate("messages", &ok, false).unwrap();

        let missing = Record::new().with("text", "hi");
        assert!(matches!(
            def.validate("messages", &missing, false),
            Err(PeltaError::Validation(_))
        ));

        let wrong_type = ok.clone().with("userId", "one");
        assert!(def.validate("messages", &wrong_type, false).is_err());

        let unknown = ok.clone().with("extra", 1);
        assert!(def.validate("messages", &unknown, false).is_err());

        let null = ok.with("text", Value::Null);
        assert!(def.validate("messages", &null, false).is_err());
    }

    #[test]
    fn test_validate_partial_record() {
        let def = messages();
        def.validate("messages", &Record::new().with("text", "x"), true)
            .unwrap();
        assert!(def
            .validate("messages", &Record::new().with("id", 3), true)
            .is_err());
    }

    #[test]
    fn test_custom_validator() {
        let def = messages().with_validator(|record: &Record, _partial: bool| {
            match record.get("text").and_then(Value::as_str) {
                Some(text) if text.len() > 5 => Err("text too long".to_string()),
                _ => Ok(()),
            }
        });
        let record = Record::new()
            .with("text", "far too long")
            .with("userId", 1)
            .with("createdAt", Utc::now());
        let err = def.validate("messages", &record, false).unwrap_err();
        assert!(err.to_string().contains("text too long"));
    }

    #[test]
    fn test_check_rejects_bad_definitions() {
        assert!(messages().check("_private").is_err());
        assert!(messages().with_vector("userId", 3).check("messages").is_err());
        assert!(messages().with_vector("text", 0).check("messages").is_err());
        assert!(messages().with_index("nope").check("messages").is_err());
        assert!(messages()
            .with_primary_key("createdAt")
            .check("messages")
            .is_err());
    }

    #[test]
    fn test_compatibility() {
        let old = messages().with_vector("text", 3);
        let changed_type = messages()
            .column("userId", ColumnType::String)
            .with_vector("text", 3);
        assert!(changed_type.check_compatible("messages", &old).is_err());

        let changed_dims = messages().with_vector("text", 4);
        assert!(changed_dims.check_compatible("messages", &old).is_err());

        let added_column = messages()
            .column("extra", ColumnType::Json)
            .with_vector("text", 3);
        added_column.check_compatible("messages", &old).unwrap();
    }

    #[test]
    fn test_required_stores() {
        let mut schema = Schema::new();
        schema.insert("messages".into(), messages().with_vector("text", 3));
        let registry = SchemaRegistry::new(schema).unwrap();
        let names: Vec<String> = registry
            .required_stores()
            .into_iter()
            .map(|def| def.name)
            .collect();
        assert!(names.contains(&"messages".to_string()));
        assert!(names.contains(&"_ii_messages".to_string()));
        assert!(names.contains(&"_vec_messages".to_string()));
        assert!(names.contains(&"_ivf_messages".to_string()));
        assert!(names.contains(&META_STATS_STORE.to_string()));
        assert!(matches!(
            registry.table("nope"),
            Err(PeltaError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_definition_serde_skips_validator() {
        let def = messages().with_validator(|_: &Record, _: bool| Ok(()));
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["primaryKey"], "id");
        assert_eq!(json["columns"]["createdAt"], "date");
        let back: TableDefinition = serde_json::from_value(json).unwrap();
        assert!(back.validator.is_none());
        assert_eq!(back.columns, def.columns);
    }
}
