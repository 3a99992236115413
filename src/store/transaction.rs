//! Multi-store write transactions.
//!
//! A transaction buffers writes in an overlay and reads through it, so a
//! write path can stage changes to several stores, read its own writes, and
//! then commit them as one write-ahead log record. Dropping an uncommitted
//! transaction discards everything it staged.
//!
//! Item layers give bulk operations savepoints: `begin_item` opens a layer,
//! `rollback_item` throws it away and `commit_item` folds it into the layer
//! below.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

use crate::error::{PeltaError, Result};
use crate::store::key::Key;
use crate::store::wal::WalOp;
use crate::store::{Direction, Engine, KeyRange, StoreDef};

#[derive(Debug, Clone, Default)]
struct StoreOverlay {
    cleared: bool,
    writes: BTreeMap<Key, Option<JsonValue>>,
    next_id: Option<i64>,
}

type Layer = BTreeMap<String, StoreOverlay>;

fn merge_layer(below: &mut Layer, top: Layer) {
    for (store, overlay) in top {
        let target = below.entry(store).or_default();
        if overlay.cleared {
            target.cleared = true;
            target.writes.clear();
        }
        target.writes.extend(overlay.writes);
        if let Some(next) = overlay.next_id {
            target.next_id = Some(target.next_id.map_or(next, |current| current.max(next)));
        }
    }
}

pub struct Transaction<'e> {
    engine: &'e Engine,
    base: Layer,
    items: Vec<Layer>,
}

impl<'e> Transaction<'e> {
    pub(crate) fn new(engine: &'e Engine) -> Self {
        Transaction {
            engine,
            base: Layer::new(),
            items: Vec::new(),
        }
    }

    fn store_def(&self, store: &str) -> Result<StoreDef> {
        self.engine.read(|view| view.store_def(store).cloned())
    }

    /// Layers from oldest to newest.
    fn layers(&self) -> impl DoubleEndedIterator<Item = &Layer> {
        std::iter::once(&self.base).chain(self.items.iter())
    }

    fn top(&mut self, store: &str) -> &mut StoreOverlay {
        let layer = match self.items.last_mut() {
            Some(layer) => layer,
            None => &mut self.base,
        };
        layer.entry(store.to_string()).or_default()
    }

    /// Read a value as this transaction sees it.
    pub fn get(&self, store: &str, key: &Key) -> Result<Option<JsonValue>> {
        for layer in self.layers().rev() {
            if let Some(overlay) = layer.get(store) {
                if let Some(write) = overlay.writes.get(key) {
                    return Ok(write.clone());
                }
                if overlay.cleared {
                    return Ok(None);
                }
            }
        }
        self.engine
            .read(|view| view.get(store, key).map(|value| value.cloned()))
    }

    pub fn contains(&self, store: &str, key: &Key) -> Result<bool> {
        Ok(self.get(store, key)?.is_some())
    }

    /// Every row as this transaction sees it, in key order.
    pub fn scan(&self, store: &str) -> Result<Vec<(Key, JsonValue)>> {
        let cleared = self
            .layers()
            .any(|layer| layer.get(store).is_some_and(|overlay| overlay.cleared));

        let mut rows: BTreeMap<Key, JsonValue> = if cleared {
            self.store_def(store)?;
            BTreeMap::new()
        } else {
            self.engine.read(|view| {
                view.scan(store, &KeyRange::all(), Direction::Asc)
                    .map(|iter| iter.map(|(k, v)| (k.clone(), v.clone())).collect())
            })?
        };

        for layer in self.layers() {
            if let Some(overlay) = layer.get(store) {
                if overlay.cleared {
                    rows.clear();
                }
                for (key, write) in &overlay.writes {
                    match write {
                        Some(value) => {
                            rows.insert(key.clone(), value.clone());
                        }
                        None => {
                            rows.remove(key);
                        }
                    }
                }
            }
        }
        Ok(rows.into_iter().collect())
    }

    /// Stage a write under an explicit key.
    ///
    /// For stores with a key path the key is also written into the object.
    pub fn put(&mut self, store: &str, key: Key, mut value: JsonValue) -> Result<()> {
        let def = self.store_def(store)?;
        if let (Some(key_path), Some(object)) = (&def.key_path, value.as_object_mut()) {
            object.insert(key_path.clone(), key.to_json());
        }
        if def.auto_increment {
            if let Key::Int(i) = key {
                let next = self.next_id(store)?.max(i.saturating_add(1));
                self.top(store).next_id = Some(next);
            }
        }
        self.top(store).writes.insert(key, Some(value));
        Ok(())
    }

    /// Stage an insert into a store with a key path.
    ///
    /// Missing keys are assigned from the auto-increment counter. An existing
    /// key is a constraint error.
    pub fn add(&mut self, store: &str, mut value: JsonValue) -> Result<Key> {
        let def = self.store_def(store)?;
        let key_path = def.key_path.clone().ok_or_else(|| {
            PeltaError::invalid_operation(format!("Object store {store} has no key path"))
        })?;

        let supplied = value.get(&key_path).filter(|v| !v.is_null());
        let key = match supplied {
            Some(raw) => Key::from_json(raw).ok_or_else(|| {
                PeltaError::validation(format!(
                    "{key_path} must be an integer or a string, got {raw}"
                ))
            })?,
            None if def.auto_increment => Key::Int(self.next_id(store)?),
            None => {
                return Err(PeltaError::validation(format!("{key_path} is required")));
            }
        };

        if self.contains(store, &key)? {
            return Err(PeltaError::constraint(format!(
                "Key {key} already exists in {store}"
            )));
        }

        if let Some(object) = value.as_object_mut() {
            object.insert(key_path, key.to_json());
        } else {
            return Err(PeltaError::validation("records must be JSON objects"));
        }
        self.put(store, key.clone(), value)?;
        Ok(key)
    }

    pub fn delete(&mut self, store: &str, key: &Key) -> Result<()> {
        self.store_def(store)?;
        self.top(store).writes.insert(key.clone(), None);
        Ok(())
    }

    pub fn clear(&mut self, store: &str) -> Result<()> {
        self.store_def(store)?;
        let overlay = self.top(store);
        overlay.cleared = true;
        overlay.writes.clear();
        Ok(())
    }

    fn next_id(&self, store: &str) -> Result<i64> {
        let committed = self.engine.read(|view| view.next_id(store))?;
        let staged = self
            .layers()
            .filter_map(|layer| layer.get(store).and_then(|overlay| overlay.next_id))
            .max();
        Ok(staged.map_or(committed, |s| s.max(committed)))
    }

    /// Open a savepoint for one item of a bulk operation.
    pub fn begin_item(&mut self) {
        self.items.push(Layer::new());
    }

    /// Keep the writes staged since `begin_item`.
    pub fn commit_item(&mut self) {
        if let Some(top) = self.items.pop() {
            let below = match self.items.last_mut() {
                Some(layer) => layer,
                None => &mut self.base,
            };
            merge_layer(below, top);
        }
    }

    /// Discard the writes staged since `begin_item`.
    pub fn rollback_item(&mut self) {
        self.items.pop();
    }

    pub fn is_empty(&self) -> bool {
        self.layers().all(|layer| layer.is_empty())
    }

    /// Apply every staged write atomically.
    pub fn commit(mut self) -> Result<()> {
        while !self.items.is_empty() {
            self.commit_item();
        }
        let base = std::mem::take(&mut self.base);

        let mut ops = Vec::new();
        for (store, overlay) in base {
            if overlay.cleared {
                ops.push(WalOp::Clear {
                    store: store.clone(),
                });
            }
            for (key, write) in overlay.writes {
                ops.push(match write {
                    Some(value) => WalOp::Put {
                        store: store.clone(),
                        key,
                        value,
                    },
                    None => WalOp::Delete {
                        store: store.clone(),
                        key,
                    },
                });
            }
            if let Some(next_id) = overlay.next_id {
                ops.push(WalOp::NextId { store, next_id });
            }
        }

        if ops.is_empty() {
            return Ok(());
        }
        self.engine.commit_ops(ops)?;
        Ok(())
    }
}
