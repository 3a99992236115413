//! Records and typed column values.
//!
//! A [`Record`] is an ordered column→[`Value`] map. Records are stored
//! normalized as JSON objects (dates become RFC 3339 UTC strings with
//! millisecond precision) and are denormalized on read according to the
//! table's column types.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::error::{PeltaError, Result};
use crate::schema::{ColumnType, TableDefinition};
use crate::store::Key;

/// A checked column value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Date(DateTime<Utc>),
    Json(JsonValue),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Json(_) => "json",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<&DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(d),
            _ => None,
        }
    }

    /// Whether the value conforms to a declared column type.
    pub fn conforms_to(&self, column_type: ColumnType) -> bool {
        matches!(
            (column_type, self),
            (ColumnType::String, Value::String(_))
                | (ColumnType::Number, Value::Number(_))
                | (ColumnType::Boolean, Value::Bool(_))
                | (ColumnType::Date, Value::Date(_))
                | (ColumnType::Json, _)
        )
    }

    /// Storage representation.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => JsonValue::String(s.clone()),
            Value::Date(d) => JsonValue::String(format_date(d)),
            Value::Json(j) => j.clone(),
        }
    }

    /// Interpret stored JSON without type information.
    pub fn from_json(value: &JsonValue) -> Value {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map_or(Value::Null, Value::Number),
            JsonValue::String(s) => Value::String(s.clone()),
            other => Value::Json(other.clone()),
        }
    }

    /// Interpret JSON according to a column type, parsing dates.
    pub fn from_json_typed(value: &JsonValue, column_type: ColumnType) -> Result<Value> {
        match (column_type, value) {
            (ColumnType::Json, v) => Ok(Value::Json(v.clone())),
            (_, JsonValue::Null) => Ok(Value::Null),
            (ColumnType::Date, JsonValue::String(s)) => parse_date(s).map(Value::Date),
            (ColumnType::Date, JsonValue::Number(n)) => n
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .map(Value::Date)
                .ok_or_else(|| PeltaError::validation(format!("invalid timestamp {n}"))),
            (_, v) => Ok(Value::from_json(v)),
        }
    }

    /// Order two values of the same type; mixed types are incomparable.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// The primary key this value denotes, if any.
    pub fn to_key(&self) -> Option<Key> {
        match self {
            Value::Number(_) => Key::from_json(&self.to_json()),
            Value::String(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        JsonValue::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)
    }
}

/// RFC 3339, UTC, millisecond precision.
pub fn format_date(date: &DateTime<Utc>) -> String {
    date.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_date(text: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| PeltaError::validation(format!("invalid date {text:?}: {e}")))
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Date(value)
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::Json(value)
    }
}

impl From<&Key> for Value {
    fn from(key: &Key) -> Self {
        match key {
            Key::Int(i) => Value::Number(*i as f64),
            Key::Str(s) => Value::String(s.clone()),
        }
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        Value::from(&key)
    }
}

/// A row of a table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Record::default()
    }

    /// Builder-style setter.
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, field: K, value: V) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, field: K, value: V) {
        self.fields.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The primary key stored under `primary_key`, if it is a valid key.
    pub fn key(&self, primary_key: &str) -> Option<Key> {
        self.get(primary_key).and_then(Value::to_key)
    }

    /// Copy every field of `other` over this record.
    pub fn merge(&mut self, other: &Record) {
        for (field, value) in other.fields() {
            self.fields.insert(field.clone(), value.clone());
        }
    }

    /// Storage form: a JSON object with dates as strings.
    pub fn normalize(&self) -> JsonValue {
        let object: JsonMap<String, JsonValue> = self
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        JsonValue::Object(object)
    }

    /// Serialized byte size of the normalized record.
    pub fn byte_size(&self) -> u64 {
        json_byte_size(&self.normalize())
    }

    /// Rebuild a record from storage form, typing fields by column.
    ///
    /// Fields without a declared column are inferred from the JSON shape.
    pub fn denormalize(value: &JsonValue, definition: &TableDefinition) -> Record {
        let mut record = Record::new();
        if let Some(object) = value.as_object() {
            for (field, raw) in object {
                let typed = match definition.column_type(field) {
                    Some(column_type) => Value::from_json_typed(raw, column_type)
                        .unwrap_or_else(|_| Value::from_json(raw)),
                    None => Value::from_json(raw),
                };
                record.fields.insert(field.clone(), typed);
            }
        }
        record
    }

    /// Parse caller-supplied JSON according to the table's columns.
    pub fn from_json(value: &JsonValue, definition: &TableDefinition) -> Result<Record> {
        let object = value
            .as_object()
            .ok_or_else(|| PeltaError::validation("records must be JSON objects"))?;
        let mut record = Record::new();
        for (field, raw) in object {
            let typed = match definition.column_type(field) {
                Some(column_type) => Value::from_json_typed(raw, column_type)?,
                None => Value::from_json(raw),
            };
            record.fields.insert(field.clone(), typed);
        }
        Ok(record)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Record {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

pub fn json_byte_size(value: &JsonValue) -> u64 {
    serde_json::to_string(value).map_or(0, |s| s.len() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn definition() -> TableDefinition {
        TableDefinition::new()
            .column("text", ColumnType::String)
            .column("count", ColumnType::Number)
            .column("createdAt", ColumnType::Date)
            .column("meta", ColumnType::Json)
    }

    #[test]
    fn test_normalize_dates_to_millis() {
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        let record = Record::new().with("createdAt", date).with("count", 3);
        let normalized = record.normalize();
        assert_eq!(normalized["createdAt"], "2024-03-01T12:30:00.123Z");
        assert_eq!(normalized["count"], json!(3));
    }

    #[test]
    fn test_denormalize_by_column_type() {
        let stored = json!({
            "id": 1,
            "text": "hi",
            "createdAt": "2024-03-01T12:30:00.123Z",
            "meta": {"a": [1, 2]}
        });
        let record = Record::denormalize(&stored, &definition());
        assert_eq!(record.get("text"), Some(&Value::from("hi")));
        assert!(matches!(record.get("createdAt"), Some(Value::Date(_))));
        assert_eq!(record.get("meta"), Some(&Value::Json(json!({"a": [1, 2]}))));
        assert_eq!(record.key("id"), Some(Key::Int(1)));
    }

    #[test]
    fn test_byte_size_matches_serialized_json() {
        let record = Record::new().with("text", "hello");
        assert_eq!(record.byte_size(), r#"{"text":"hello"}"#.len() as u64);
    }

    #[test]
    fn test_compare_is_same_type_only() {
        assert_eq!(
            Value::from(1).compare(&Value::from(2)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::from("b").compare(&Value::from("a")), Some(Ordering::Greater));
        assert_eq!(Value::from(1).compare(&Value::from("1")), None);
    }

    #[test]
    fn test_from_json_rejects_bad_dates() {
        let bad = json!({"createdAt": "yesterday"});
        assert!(Record::from_json(&bad, &definition()).is_err());
    }

    #[test]
    fn test_value_to_key() {
        assert_eq!(Value::from(4).to_key(), Some(Key::Int(4)));
        assert_eq!(Value::from(4.5).to_key(), None);
        assert_eq!(Value::from("k").to_key(), Some(Key::from("k")));
        assert_eq!(Value::Bool(true).to_key(), None);
    }
}
