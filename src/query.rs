//! Structured queries: predicates, planning and pagination.
//!
//! A [`Where`] clause is an ordered list of field conditions. The planner
//! picks one access path:
//!
//! 1. the index on the `order_by` field, when one exists;
//! 2. otherwise the index on the first indexed `where` field whose condition
//!    can be expressed as a single key range;
//! 3. otherwise a full scan in primary-key order.
//!
//! The primary key always counts as indexed. Whatever the path, every record
//! is re-checked against all conditions, so the plan only affects speed and
//! the natural order of results.

use std::cmp::Ordering;
use std::ops::Bound;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{PeltaError, Result};
use crate::interceptor::FieldTransform;
use crate::record::{Record, Value, format_date};
use crate::schema::{ColumnType, StoreName, StoreRole, TableDefinition};
use crate::store::{Direction, IndexKey, Key, KeyRange, ReadView};

/// Operator form of a condition; every present operator must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RangeCondition {
    pub gt: Option<Value>,
    pub gte: Option<Value>,
    pub lt: Option<Value>,
    pub lte: Option<Value>,
    pub any_of: Option<Vec<Value>>,
}

impl RangeCondition {
    pub fn gt<V: Into<Value>>(mut self, value: V) -> Self {
        self.gt = Some(value.into());
        self
    }

    pub fn gte<V: Into<Value>>(mut self, value: V) -> Self {
        self.gte = Some(value.into());
        self
    }

    pub fn lt<V: Into<Value>>(mut self, value: V) -> Self {
        self.lt = Some(value.into());
        self
    }

    pub fn lte<V: Into<Value>>(mut self, value: V) -> Self {
        self.lte = Some(value.into());
        self
    }

    pub fn any_of<I, V>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.any_of = Some(values.into_iter().map(Into::into).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Range(RangeCondition),
}

impl Condition {
    /// Start an operator condition.
    pub fn range() -> RangeCondition {
        RangeCondition::default()
    }

    pub fn matches(&self, value: Option<&Value>) -> bool {
        match self {
            Condition::Eq(expected) => value == Some(expected),
            Condition::Range(range) => {
                let Some(value) = value else {
                    return false;
                };
                let holds = |bound: &Option<Value>, accept: fn(Ordering) -> bool| {
                    bound
                        .as_ref()
                        .is_none_or(|b| value.compare(b).is_some_and(accept))
                };
                holds(&range.gt, |o| o == Ordering::Greater)
                    && holds(&range.gte, |o| o != Ordering::Less)
                    && holds(&range.lt, |o| o == Ordering::Less)
                    && holds(&range.lte, |o| o != Ordering::Greater)
                    && range
                        .any_of
                        .as_ref()
                        .is_none_or(|values| values.contains(value))
            }
        }
    }

    /// The single key range this condition selects, if expressible.
    fn key_range<K: Ord + Clone>(&self, convert: impl Fn(&Value) -> Option<K>) -> Option<KeyRange<K>> {
        match self {
            Condition::Eq(value) => convert(value).map(KeyRange::only),
            Condition::Range(range) => {
                let mut keys = KeyRange::all();
                if let Some(v) = &range.gt {
                    keys = keys.with_lower(Bound::Excluded(convert(v)?));
                }
                if let Some(v) = &range.gte {
                    keys = keys.with_lower(Bound::Included(convert(v)?));
                }
                if let Some(v) = &range.lt {
                    keys = keys.with_upper(Bound::Excluded(convert(v)?));
                }
                if let Some(v) = &range.lte {
                    keys = keys.with_upper(Bound::Included(convert(v)?));
                }
                match range.any_of.as_deref() {
                    None => {}
                    Some([only]) => {
                        let k = convert(only)?;
                        keys = keys
                            .with_lower(Bound::Included(k.clone()))
                            .with_upper(Bound::Included(k));
                    }
                    Some(_) => return None,
                }
                Some(keys)
            }
        }
    }
}

impl From<RangeCondition> for Condition {
    fn from(range: RangeCondition) -> Self {
        Condition::Range(range)
    }
}

/// Ordered field conditions, all of which must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where {
    conditions: Vec<(String, Condition)>,
}

impl Where {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an equality condition.
    pub fn eq<F: Into<String>, V: Into<Value>>(self, field: F, value: V) -> Self {
        self.and(field, Condition::Eq(value.into()))
    }

    /// Add any condition.
    pub fn and<F: Into<String>, C: Into<Condition>>(mut self, field: F, condition: C) -> Self {
        self.conditions.push((field.into(), condition.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Condition)> {
        self.conditions.iter().map(|(f, c)| (f.as_str(), c))
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions
            .iter()
            .all(|(field, condition)| condition.matches(record.get(field)))
    }

    /// Parse `{"field": value | {"$gt": .., "$in": [..]}}` using column types.
    pub fn from_json(value: &JsonValue, definition: &TableDefinition) -> Result<Where> {
        let object = value
            .as_object()
            .ok_or_else(|| PeltaError::query("where clause must be a JSON object"))?;

        let typed = |field: &str, raw: &JsonValue| -> Result<Value> {
            match definition.column_type(field) {
                Some(column_type) => Value::from_json_typed(raw, column_type)
                    .map_err(|e| PeltaError::query(e.to_string())),
                None => Ok(Value::from_json(raw)),
            }
        };

        let mut clause = Where::new();
        for (field, raw) in object {
            let operators = raw
                .as_object()
                .filter(|o| !o.is_empty() && o.keys().all(|k| k.starts_with('$')));
            let condition = match operators {
                None => Condition::Eq(typed(field, raw)?),
                Some(ops) => {
                    let mut range = RangeCondition::default();
                    for (op, operand) in ops {
                        match op.as_str() {
                            "$gt" => range.gt = Some(typed(field, operand)?),
                            "$gte" => range.gte = Some(typed(field, operand)?),
                            "$lt" => range.lt = Some(typed(field, operand)?),
                            "$lte" => range.lte = Some(typed(field, operand)?),
                            "$in" => {
                                let items = operand.as_array().ok_or_else(|| {
                                    PeltaError::query(format!("{field}: $in expects an array"))
                                })?;
                                range.any_of = Some(
                                    items
                                        .iter()
                                        .map(|item| typed(field, item))
                                        .collect::<Result<Vec<_>>>()?,
                                );
                            }
                            other => {
                                return Err(PeltaError::query(format!(
                                    "{field}: unsupported operator {other}"
                                )));
                            }
                        }
                    }
                    Condition::Range(range)
                }
            };
            clause.conditions.push((field.clone(), condition));
        }
        Ok(clause)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    pub filter: Where,
    pub order_by: Option<OrderBy>,
    /// Defaults to the configured find limit.
    pub limit: Option<usize>,
    pub offset: usize,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_filter(mut self, filter: Where) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_order<S: Into<String>>(mut self, field: S, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// How records are reached.
#[derive(Debug, Clone, PartialEq)]
pub enum Access {
    /// Primary-key order over a key range.
    PrimaryKey(KeyRange<Key>),
    /// Secondary-index order over an index key range.
    Index {
        field: String,
        range: KeyRange<IndexKey>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryPlan {
    /// Traverse the index on the `order_by` field.
    IndexOrder { access: Access, direction: Direction },
    /// Traverse an index restricted by a `where` condition.
    IndexRange { access: Access },
    /// Scan every record by primary key.
    FullScan,
}

impl QueryPlan {
    /// Whether traversal order already satisfies the requested ordering.
    pub fn is_ordered(&self, order_by: Option<&OrderBy>) -> bool {
        matches!(self, QueryPlan::IndexOrder { .. }) || order_by.is_none()
    }
}

fn index_key(value: &Value) -> Option<IndexKey> {
    match value {
        Value::Bool(b) => Some(IndexKey::Bool(*b)),
        Value::Number(n) => Some(IndexKey::Number(*n)),
        Value::String(s) => Some(IndexKey::Text(s.clone())),
        Value::Date(d) => Some(IndexKey::Text(format_date(d))),
        Value::Null | Value::Json(_) => None,
    }
}

fn access_for(
    definition: &TableDefinition,
    field: &str,
    condition: Option<&Condition>,
) -> Option<Access> {
    if field == definition.primary_key {
        let range = match condition {
            Some(c) => c.key_range(Value::to_key)?,
            None => KeyRange::all(),
        };
        Some(Access::PrimaryKey(range))
    } else {
        let range = match condition {
            Some(c) => c.key_range(index_key)?,
            None => KeyRange::all(),
        };
        Some(Access::Index {
            field: field.to_string(),
            range,
        })
    }
}

/// Json columns are optional and objects get no index key, so traversing
/// their index would skip rows.
fn keys_every_row(definition: &TableDefinition, field: &str) -> bool {
    field == definition.primary_key || definition.column_type(field) != Some(ColumnType::Json)
}

/// Choose the access path for `options` against `definition`.
pub fn plan(definition: &TableDefinition, options: &FindOptions) -> QueryPlan {
    let condition_on = |field: &str| {
        options
            .filter
            .conditions()
            .find(|(f, _)| *f == field)
            .map(|(_, c)| c)
    };

    if let Some(order) = &options.order_by {
        if definition.is_indexed(&order.field) && keys_every_row(definition, &order.field) {
            let access = access_for(definition, &order.field, condition_on(&order.field))
                .or_else(|| access_for(definition, &order.field, None));
            if let Some(access) = access {
                return QueryPlan::IndexOrder {
                    access,
                    direction: order.direction,
                };
            }
        }
    }

    for (field, condition) in options.filter.conditions() {
        if !definition.is_indexed(field) {
            continue;
        }
        if let Some(access) = access_for(definition, field, Some(condition)) {
            return QueryPlan::IndexRange { access };
        }
    }

    QueryPlan::FullScan
}

fn compare_field(a: &Record, b: &Record, field: &str) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) => x.compare(y).unwrap_or(Ordering::Equal),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Run `options` against committed state. `limit` is already resolved.
pub fn execute(
    view: &ReadView<'_>,
    table: &str,
    definition: &TableDefinition,
    transform: &dyn FieldTransform,
    options: &FindOptions,
    limit: usize,
) -> Result<Vec<Record>> {
    let store = StoreName::of(table, StoreRole::Primary);
    // Secondary indexes hold encoded values, which plaintext predicates cannot match.
    let plan = if transform.is_identity() {
        plan(definition, options)
    } else {
        QueryPlan::FullScan
    };
    debug!("find on {table}: {plan:?}");

    let rows = match &plan {
        QueryPlan::IndexOrder { access, direction } => traverse(view, &store, access, *direction)?,
        QueryPlan::IndexRange { access } => traverse(view, &store, access, Direction::Asc)?,
        QueryPlan::FullScan => view.scan(&store, &KeyRange::all(), Direction::Asc)?,
    };

    let ordered = plan.is_ordered(options.order_by.as_ref());
    let mut skipped = 0;
    let mut results = Vec::new();
    for (_, value) in rows {
        if ordered && results.len() >= limit {
            break;
        }
        let record = transform.decode(table, Record::denormalize(value, definition))?;
        if !options.filter.matches(&record) {
            continue;
        }
        if ordered && skipped < options.offset {
            skipped += 1;
            continue;
        }
        results.push(record);
    }

    if !ordered {
        if let Some(order) = &options.order_by {
            results.sort_by(|a, b| {
                let ordering = compare_field(a, b, &order.field);
                match (order.direction, a.get(&order.field), b.get(&order.field)) {
                    (Direction::Desc, Some(_), Some(_)) => ordering.reverse(),
                    _ => ordering,
                }
            });
        }
        results = results
            .into_iter()
            .skip(options.offset)
            .take(limit)
            .collect();
    }
    Ok(results)
}

fn traverse<'a>(
    view: &ReadView<'a>,
    store: &str,
    access: &Access,
    direction: Direction,
) -> Result<crate::store::Rows<'a>> {
    match access {
        Access::PrimaryKey(range) => view.scan(store, range, direction),
        Access::Index { field, range } => view.index_scan(store, field, range, direction),
    }
}

/// One page of keyset pagination.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub records: Vec<Record>,
    /// Present when the page was full.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorPayload {
    last_id: Key,
}

/// Opaque cursor carrying the last-seen primary key.
pub fn encode_cursor(last_id: &Key) -> Result<String> {
    let payload = serde_json::to_vec(&CursorPayload {
        last_id: last_id.clone(),
    })?;
    Ok(BASE64.encode(payload))
}

pub fn decode_cursor(cursor: &str) -> Result<Key> {
    let bytes = BASE64
        .decode(cursor)
        .map_err(|e| PeltaError::query(format!("malformed cursor: {e}")))?;
    let payload: CursorPayload = serde_json::from_slice(&bytes)
        .map_err(|e| PeltaError::query(format!("malformed cursor: {e}")))?;
    Ok(payload.last_id)
}

/// Restrict `options` to records after the cursor's id.
pub fn after_cursor(
    definition: &TableDefinition,
    options: &FindOptions,
    cursor: Option<&str>,
) -> Result<FindOptions> {
    let mut options = options.clone();
    if let Some(cursor) = cursor {
        let last_id = decode_cursor(cursor)?;
        options.filter = options.filter.and(
            definition.primary_key.clone(),
            Condition::range().gt(Value::from(last_id)),
        );
    }
    Ok(options)
}

/// Build the page, with a cursor only when the page is full.
pub fn make_page(definition: &TableDefinition, records: Vec<Record>, limit: usize) -> Result<Page> {
    let next_cursor = if limit > 0 && records.len() == limit {
        records
            .last()
            .and_then(|r| r.key(&definition.primary_key))
            .map(|key| encode_cursor(&key))
            .transpose()?
    } else {
        None
    };
    Ok(Page {
        records,
        next_cursor,
    })
}
