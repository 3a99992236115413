//! Primary keys, secondary index keys and key ranges.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A primary-key value. Integers order before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Int(i64),
    Str(String),
}

impl Key {
    /// Interpret a JSON value as a key. Only integral numbers and strings qualify.
    pub fn from_json(value: &JsonValue) -> Option<Key> {
        match value {
            JsonValue::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Key::Int(i))
                } else {
                    n.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15)
                        .map(|f| Key::Int(f as i64))
                }
            }
            JsonValue::String(s) => Some(Key::Str(s.clone())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Key::Int(i) => JsonValue::from(*i),
            Key::Str(s) => JsonValue::String(s.clone()),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Key::Int(i) => Some(*i),
            Key::Str(_) => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(i) => write!(f, "{i}"),
            Key::Str(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Int(value)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Int(value as i64)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Str(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Str(value)
    }
}

/// A secondary index key. Booleans order before numbers, numbers before text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexKey {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl IndexKey {
    pub fn from_json(value: &JsonValue) -> Option<IndexKey> {
        match value {
            JsonValue::Bool(b) => Some(IndexKey::Bool(*b)),
            JsonValue::Number(n) => n.as_f64().map(IndexKey::Number),
            JsonValue::String(s) => Some(IndexKey::Text(s.clone())),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Bool(_) => 0,
            IndexKey::Number(_) => 1,
            IndexKey::Text(_) => 2,
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexKey::Bool(a), IndexKey::Bool(b)) => a.cmp(b),
            (IndexKey::Number(a), IndexKey::Number(b)) => a.total_cmp(b),
            (IndexKey::Text(a), IndexKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Traversal direction for ordered scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

/// A possibly unbounded interval of keys.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange<K> {
    pub lower: Bound<K>,
    pub upper: Bound<K>,
}

impl<K: Ord + Clone> Default for KeyRange<K> {
    fn default() -> Self {
        KeyRange::all()
    }
}

impl<K: Ord + Clone> KeyRange<K> {
    pub fn all() -> Self {
        KeyRange {
            lower: Bound::Unbounded,
            upper: Bound::Unbounded,
        }
    }

    pub fn only(key: K) -> Self {
        KeyRange {
            lower: Bound::Included(key.clone()),
            upper: Bound::Included(key),
        }
    }

    pub fn new(lower: Bound<K>, upper: Bound<K>) -> Self {
        KeyRange { lower, upper }
    }

    pub fn contains(&self, key: &K) -> bool {
        let above = match &self.lower {
            Bound::Included(l) => key >= l,
            Bound::Excluded(l) => key > l,
            Bound::Unbounded => true,
        };
        let below = match &self.upper {
            Bound::Included(u) => key <= u,
            Bound::Excluded(u) => key < u,
            Bound::Unbounded => true,
        };
        above && below
    }

    /// True when no key can fall inside the range.
    ///
    /// `BTreeMap::range` panics on such ranges, so callers check this first.
    pub fn is_empty(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Bound::Included(l), Bound::Included(u)) => l > u,
            (Bound::Included(l), Bound::Excluded(u))
            | (Bound::Excluded(l), Bound::Included(u))
            | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
            _ => false,
        }
    }

    pub fn as_bounds(&self) -> (Bound<&K>, Bound<&K>) {
        (self.lower.as_ref(), self.upper.as_ref())
    }

    /// Narrow the lower bound, keeping the tighter of the two.
    pub fn with_lower(mut self, bound: Bound<K>) -> Self {
        self.lower = tighter_lower(self.lower, bound);
        self
    }

    /// Narrow the upper bound, keeping the tighter of the two.
    pub fn with_upper(mut self, bound: Bound<K>) -> Self {
        self.upper = tighter_upper(self.upper, bound);
        self
    }
}

fn tighter_lower<K: Ord>(a: Bound<K>, b: Bound<K>) -> Bound<K> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other,
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.max(y)),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.max(y)),
        (Bound::Included(i), Bound::Excluded(e)) | (Bound::Excluded(e), Bound::Included(i)) => {
            if i > e {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
    }
}

fn tighter_upper<K: Ord>(a: Bound<K>, b: Bound<K>) -> Bound<K> {
    match (a, b) {
        (Bound::Unbounded, other) | (other, Bound::Unbounded) => other,
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.min(y)),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.min(y)),
        (Bound::Included(i), Bound::Excluded(e)) | (Bound::Excluded(e), Bound::Included(i)) => {
            if i < e {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_ordering() {
        assert!(Key::Int(10) < Key::Int(11));
        assert!(Key::Int(i64::MAX) < Key::Str(String::new()));
        assert!(Key::from("a") < Key::from("b"));
    }

    #[test]
    fn test_key_from_json() {
        assert_eq!(Key::from_json(&json!(3)), Some(Key::Int(3)));
        assert_eq!(Key::from_json(&json!(3.0)), Some(Key::Int(3)));
        assert_eq!(Key::from_json(&json!(3.5)), None);
        assert_eq!(Key::from_json(&json!("x")), Some(Key::from("x")));
        assert_eq!(Key::from_json(&json!(null)), None);
    }

    #[test]
    fn test_key_serde_untagged() {
        let keys = vec![Key::Int(1), Key::from("two")];
        let text = serde_json::to_string(&keys).unwrap();
        assert_eq!(text, r#"[1,"two"]"#);
        let back: Vec<Key> = serde_json::from_str(&text).unwrap();
        assert_eq!(back, keys);
    }

    #[test]
    fn test_index_key_ordering() {
        assert!(IndexKey::Bool(true) < IndexKey::Number(-1.0));
        assert!(IndexKey::Number(2.0) < IndexKey::Number(10.0));
        assert!(IndexKey::Number(1e9) < IndexKey::Text("0".into()));
        assert_eq!(IndexKey::Number(1.0), IndexKey::Number(1.0));
    }

    #[test]
    fn test_range_contains_and_empty() {
        let range = KeyRange::new(Bound::Excluded(1), Bound::Included(5));
        assert!(!range.contains(&1));
        assert!(range.contains(&5));
        assert!(!range.is_empty());

        assert!(KeyRange::new(Bound::Excluded(3), Bound::Excluded(3)).is_empty());
        assert!(KeyRange::new(Bound::Included(4), Bound::Included(3)).is_empty());
        assert!(!KeyRange::only(3).is_empty());
    }

    #[test]
    fn test_range_tightening() {
        let range = KeyRange::all()
            .with_lower(Bound::Included(2))
            .with_lower(Bound::Excluded(2))
            .with_upper(Bound::Included(9))
            .with_upper(Bound::Excluded(7));
        assert_eq!(range.lower, Bound::Excluded(2));
        assert_eq!(range.upper, Bound::Excluded(7));
    }
}
