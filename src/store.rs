//! Transactional, versioned, ordered key-value substrate.
//!
//! The substrate holds named object stores. Each store maps a [`Key`] to a
//! JSON object, may assign auto-incrementing integer keys, and may maintain
//! secondary indexes over top-level fields. All state lives in memory; every
//! committed [`Transaction`] is appended to a write-ahead log on a pluggable
//! [`Storage`] before it becomes visible, and a JSON snapshot is taken every
//! few commits so reopening only replays a short log.
//!
//! Stores and indexes are created only inside [`Engine::upgrade`], which runs
//! when the schema version increases.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{PeltaError, Result};
use crate::storage::Storage;

pub mod key;
pub mod snapshot;
pub mod transaction;
pub mod wal;

pub use key::{Direction, IndexKey, Key, KeyRange};
pub use transaction::Transaction;

use snapshot::Snapshot;
use wal::{SeqNumber, WalOp, WalRecord};

/// Definition of one object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDef {
    pub name: String,
    /// Field of the stored object holding its key; `None` for out-of-line keys.
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub auto_increment: bool,
    /// Fields with a secondary index.
    #[serde(default)]
    pub indexes: BTreeSet<String>,
}

impl StoreDef {
    /// A store whose objects carry their own key in `key_path`.
    pub fn keyed<S: Into<String>, K: Into<String>>(name: S, key_path: K, auto_increment: bool) -> Self {
        StoreDef {
            name: name.into(),
            key_path: Some(key_path.into()),
            auto_increment,
            indexes: BTreeSet::new(),
        }
    }

    /// A store whose keys are supplied by the caller.
    pub fn out_of_line<S: Into<String>>(name: S) -> Self {
        StoreDef {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            indexes: BTreeSet::new(),
        }
    }
}

type SecondaryIndex = BTreeMap<IndexKey, BTreeSet<Key>>;

#[derive(Debug, Clone)]
pub struct StoreData {
    pub(crate) def: StoreDef,
    pub(crate) rows: BTreeMap<Key, JsonValue>,
    pub(crate) indexes: BTreeMap<String, SecondaryIndex>,
    pub(crate) next_id: i64,
}

impl StoreData {
    pub(crate) fn new(def: StoreDef) -> Self {
        let indexes = def
            .indexes
            .iter()
            .map(|field| (field.clone(), SecondaryIndex::new()))
            .collect();
        StoreData {
            def,
            rows: BTreeMap::new(),
            indexes,
            next_id: 1,
        }
    }

    fn index_value(value: &JsonValue, field: &str) -> Option<IndexKey> {
        value.get(field).and_then(IndexKey::from_json)
    }

    fn unindex(&mut self, key: &Key, value: &JsonValue) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(ik) = Self::index_value(value, field) {
                if let Some(keys) = index.get_mut(&ik) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&ik);
                    }
                }
            }
        }
    }

    fn reindex(&mut self, key: &Key, value: &JsonValue) {
        for (field, index) in self.indexes.iter_mut() {
            if let Some(ik) = Self::index_value(value, field) {
                index.entry(ik).or_default().insert(key.clone());
            }
        }
    }

    pub(crate) fn put(&mut self, key: Key, value: JsonValue) {
        if self.def.auto_increment {
            if let Key::Int(i) = key {
                self.next_id = self.next_id.max(i.saturating_add(1));
            }
        }
        if let Some(old) = self.rows.remove(&key) {
            self.unindex(&key, &old);
        }
        self.reindex(&key, &value);
        self.rows.insert(key, value);
    }

    pub(crate) fn delete(&mut self, key: &Key) -> Option<JsonValue> {
        let old = self.rows.remove(key)?;
        self.unindex(key, &old);
        Some(old)
    }

    pub(crate) fn clear(&mut self) {
        self.rows.clear();
        for index in self.indexes.values_mut() {
            index.clear();
        }
    }

    fn create_index(&mut self, field: &str) {
        if self.indexes.contains_key(field) {
            return;
        }
        let mut index = SecondaryIndex::new();
        for (key, value) in &self.rows {
            if let Some(ik) = Self::index_value(value, field) {
                index.entry(ik).or_default().insert(key.clone());
            }
        }
        self.def.indexes.insert(field.to_string());
        self.indexes.insert(field.to_string(), index);
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub(crate) version: u32,
    pub(crate) stores: BTreeMap<String, StoreData>,
    pub(crate) last_seq: SeqNumber,
    pub(crate) commits_since_checkpoint: usize,
}

impl EngineState {
    fn apply(&mut self, ops: &[WalOp]) {
        for op in ops {
            let store = match op {
                WalOp::Clear { store }
                | WalOp::Put { store, .. }
                | WalOp::Delete { store, .. }
                | WalOp::NextId { store, .. } => store,
            };
            let Some(data) = self.stores.get_mut(store) else {
                warn!("skipping write to unknown object store {store}");
                continue;
            };
            match op {
                WalOp::Clear { .. } => data.clear(),
                WalOp::Put { key, value, .. } => data.put(key.clone(), value.clone()),
                WalOp::Delete { key, .. } => {
                    data.delete(key);
                }
                WalOp::NextId { next_id, .. } => data.next_id = data.next_id.max(*next_id),
            }
        }
    }
}

fn missing_store(name: &str) -> PeltaError {
    PeltaError::storage(format!("Object store not found: {name}"))
}

/// A consistent view of committed state.
pub struct ReadView<'a> {
    state: &'a EngineState,
}

pub type Rows<'a> = Box<dyn Iterator<Item = (&'a Key, &'a JsonValue)> + 'a>;

impl<'a> ReadView<'a> {
    pub fn version(&self) -> u32 {
        self.state.version
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.state.stores.contains_key(name)
    }

    pub fn store_def(&self, name: &str) -> Result<&'a StoreDef> {
        Ok(&self.data(name)?.def)
    }

    fn data(&self, name: &str) -> Result<&'a StoreData> {
        self.state.stores.get(name).ok_or_else(|| missing_store(name))
    }

    pub fn has_index(&self, name: &str, field: &str) -> bool {
        self.state
            .stores
            .get(name)
            .is_some_and(|data| data.indexes.contains_key(field))
    }

    pub fn next_id(&self, name: &str) -> Result<i64> {
        Ok(self.data(name)?.next_id)
    }

    pub fn get(&self, name: &str, key: &Key) -> Result<Option<&'a JsonValue>> {
        Ok(self.data(name)?.rows.get(key))
    }

    pub fn count(&self, name: &str) -> Result<usize> {
        Ok(self.data(name)?.rows.len())
    }

    /// Iterate rows by primary key within `range`.
    pub fn scan(&self, name: &str, range: &KeyRange<Key>, direction: Direction) -> Result<Rows<'a>> {
        let data = self.data(name)?;
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let iter = data.rows.range(range.as_bounds());
        Ok(match direction {
            Direction::Asc => Box::new(iter),
            Direction::Desc => Box::new(iter.rev()),
        })
    }

    /// Iterate rows in secondary-index order; equal index keys are visited by primary key.
    pub fn index_scan(
        &self,
        name: &str,
        field: &str,
        range: &KeyRange<IndexKey>,
        direction: Direction,
    ) -> Result<Rows<'a>> {
        let data = self.data(name)?;
        let index = data.indexes.get(field).ok_or_else(|| {
            PeltaError::storage(format!("Index {field} not found on object store {name}"))
        })?;
        if range.is_empty() {
            return Ok(Box::new(std::iter::empty()));
        }
        let rows = &data.rows;
        let entries = index.range(range.as_bounds());
        Ok(match direction {
            Direction::Asc => Box::new(
                entries
                    .flat_map(|(_, keys)| keys.iter())
                    .filter_map(move |k| rows.get_key_value(k)),
            ),
            Direction::Desc => Box::new(
                entries
                    .rev()
                    .flat_map(|(_, keys)| keys.iter().rev())
                    .filter_map(move |k| rows.get_key_value(k)),
            ),
        })
    }
}

/// Schema-change handle passed to [`Engine::upgrade`] callbacks.
pub struct UpgradeContext<'a> {
    state: &'a mut EngineState,
    old_version: u32,
    new_version: u32,
}

impl UpgradeContext<'_> {
    pub fn old_version(&self) -> u32 {
        self.old_version
    }

    pub fn new_version(&self) -> u32 {
        self.new_version
    }

    pub fn has_store(&self, name: &str) -> bool {
        self.state.stores.contains_key(name)
    }

    pub fn store_names(&self) -> Vec<String> {
        self.state.stores.keys().cloned().collect()
    }

    pub fn create_store(&mut self, def: StoreDef) -> Result<()> {
        if self.has_store(&def.name) {
            return Err(PeltaError::schema(format!(
                "Object store already exists: {}",
                def.name
            )));
        }
        debug!("creating object store {}", def.name);
        self.state.stores.insert(def.name.clone(), StoreData::new(def));
        Ok(())
    }

    pub fn delete_store(&mut self, name: &str) -> Result<()> {
        self.state
            .stores
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| missing_store(name))
    }

    /// Add a secondary index, building it from existing rows. Idempotent.
    pub fn create_index(&mut self, store: &str, field: &str) -> Result<()> {
        let data = self.state.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        if !data.indexes.contains_key(field) {
            debug!("creating index {field} on object store {store}");
            data.create_index(field);
        }
        Ok(())
    }

    pub fn rows(&self, store: &str) -> Result<Vec<(Key, JsonValue)>> {
        let data = self.state.stores.get(store).ok_or_else(|| missing_store(store))?;
        Ok(data.rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }

    pub fn put(&mut self, store: &str, key: Key, value: JsonValue) -> Result<()> {
        let data = self.state.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        data.put(key, value);
        Ok(())
    }

    pub fn delete(&mut self, store: &str, key: &Key) -> Result<()> {
        let data = self.state.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        data.delete(key);
        Ok(())
    }
}

/// The substrate handle.
#[derive(Debug)]
pub struct Engine {
    storage: Arc<dyn Storage>,
    state: RwLock<EngineState>,
    checkpoint_threshold: usize,
}

impl Engine {
    /// Load the latest snapshot and replay the write-ahead log.
    pub fn open(storage: Arc<dyn Storage>, checkpoint_threshold: usize) -> Result<Self> {
        let mut state = match snapshot::load(storage.as_ref())? {
            Some(snapshot) => snapshot.restore(),
            None => EngineState::default(),
        };

        let contents = wal::read_all(storage.as_ref())?;
        let mut replayed = 0;
        for record in contents.records {
            if record.seq <= state.last_seq {
                continue;
            }
            state.apply(&record.ops);
            state.last_seq = record.seq;
            replayed += 1;
        }
        state.commits_since_checkpoint = replayed;

        info!(
            "opened store at version {} ({} object stores, {} log records replayed)",
            state.version,
            state.stores.len(),
            replayed
        );

        let engine = Engine {
            storage,
            state: RwLock::new(state),
            checkpoint_threshold: checkpoint_threshold.max(1),
        };

        if contents.corrupt_tail {
            // Later appends would land behind the damaged line.
            engine.checkpoint()?;
        }

        Ok(engine)
    }

    pub fn version(&self) -> u32 {
        self.state.read().version
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Move to `target` version, running `upgrade` against a working copy.
    ///
    /// The new state replaces the old one only if the callback succeeds and
    /// the resulting snapshot is durable.
    pub fn upgrade<F>(&self, target: u32, upgrade: F) -> Result<()>
    where
        F: FnOnce(&mut UpgradeContext<'_>) -> Result<()>,
    {
        let mut state = self.state.write();
        if target < state.version {
            return Err(PeltaError::schema(format!(
                "Requested version {target} is lower than stored version {}",
                state.version
            )));
        }
        if target == state.version {
            return Ok(());
        }

        let mut working = state.clone();
        let old_version = state.version;
        {
            let mut ctx = UpgradeContext {
                state: &mut working,
                old_version,
                new_version: target,
            };
            upgrade(&mut ctx)?;
        }
        working.version = target;

        self.write_checkpoint(&mut working)?;
        *state = working;
        info!("upgraded store from version {old_version} to {target}");
        Ok(())
    }

    /// Run `f` against committed state under a shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&ReadView<'_>) -> R) -> R {
        let state = self.state.read();
        f(&ReadView { state: &state })
    }

    pub fn begin(&self) -> Transaction<'_> {
        Transaction::new(self)
    }

    /// Snapshot the current state and truncate the log.
    pub fn checkpoint(&self) -> Result<()> {
        let mut state = self.state.write();
        self.write_checkpoint(&mut state)
    }

    fn write_checkpoint(&self, state: &mut EngineState) -> Result<()> {
        snapshot::write(self.storage.as_ref(), &Snapshot::capture(state))?;
        wal::truncate(self.storage.as_ref())?;
        state.commits_since_checkpoint = 0;
        info!("checkpoint written at sequence {}", state.last_seq);
        Ok(())
    }

    /// Log `ops` durably, then apply them.
    pub(crate) fn commit_ops(&self, ops: Vec<WalOp>) -> Result<SeqNumber> {
        let mut state = self.state.write();
        for op in &ops {
            let store = match op {
                WalOp::Clear { store }
                | WalOp::Put { store, .. }
                | WalOp::Delete { store, .. }
                | WalOp::NextId { store, .. } => store,
            };
            if !state.stores.contains_key(store) {
                return Err(PeltaError::aborted(format!("Object store not found: {store}")));
            }
        }

        let record = WalRecord {
            seq: state.last_seq + 1,
            ops,
        };
        if let Err(e) = wal::append(self.storage.as_ref(), &record) {
            // A partial line may have been written; rewrite the log from state.
            if let Err(ce) = self.write_checkpoint(&mut state) {
                warn!("checkpoint after failed log append also failed: {ce}");
            }
            return Err(PeltaError::aborted(e.to_string()));
        }

        state.apply(&record.ops);
        state.last_seq = record.seq;
        state.commits_since_checkpoint += 1;
        debug!("committed sequence {} ({} ops)", record.seq, record.ops.len());

        if state.commits_since_checkpoint >= self.checkpoint_threshold {
            if let Err(e) = self.write_checkpoint(&mut state) {
                warn!("checkpoint failed; the log keeps growing: {e}");
            }
        }
        Ok(record.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use serde_json::json;
    use std::ops::Bound;

    fn open(storage: &MemoryStorage, threshold: usize) -> Engine {
        Engine::open(Arc::new(storage.clone()), threshold).unwrap()
    }

    fn setup(engine: &Engine) {
        engine
            .upgrade(1, |ctx| {
                let mut def = StoreDef::keyed("messages", "id", true);
                def.indexes.insert("userId".into());
                ctx.create_store(def)?;
                ctx.create_store(StoreDef::out_of_line("_meta_stats"))
            })
            .unwrap();
    }

    #[test]
    fn test_upgrade_creates_stores() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 64);
        assert_eq!(engine.version(), 0);
        setup(&engine);
        assert_eq!(engine.version(), 1);
        engine.read(|view| {
            assert!(view.has_store("messages"));
            assert!(view.has_index("messages", "userId"));
        });
    }

    #[test]
    fn test_downgrade_is_rejected() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 64);
        setup(&engine);
        assert!(engine.upgrade(0, |_| Ok(())).is_err());
    }

    #[test]
    fn test_failed_upgrade_leaves_state() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 64);
        let result = engine.upgrade(1, |ctx| {
            ctx.create_store(StoreDef::out_of_line("a"))?;
            Err(PeltaError::schema("boom"))
        });
        assert!(result.is_err());
        assert_eq!(engine.version(), 0);
        engine.read(|view| assert!(!view.has_store("a")));
    }

    #[test]
    fn test_commit_and_reopen() {
        let storage = MemoryStorage::new_default();
        {
            let engine = open(&storage, 64);
            setup(&engine);
            let mut tx = engine.begin();
            tx.add("messages", json!({"text": "a", "userId": 1})).unwrap();
            tx.add("messages", json!({"text": "b", "userId": 2})).unwrap();
            tx.commit().unwrap();
        }

        let engine = open(&storage, 64);
        assert_eq!(engine.version(), 1);
        engine.read(|view| {
            assert_eq!(view.count("messages").unwrap(), 2);
            assert_eq!(view.next_id("messages").unwrap(), 3);
            let row = view.get("messages", &Key::Int(2)).unwrap().unwrap();
            assert_eq!(row["text"], "b");
        });
    }

    #[test]
    fn test_checkpoint_threshold_truncates_log() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 2);
        setup(&engine);
        for i in 0..3 {
            let mut tx = engine.begin();
            tx.put("_meta_stats", Key::from(format!("k{i}")), json!(i)).unwrap();
            tx.commit().unwrap();
        }
        let contents = wal::read_all(&storage).unwrap();
        assert_eq!(contents.records.len(), 1);

        let reopened = open(&storage, 2);
        reopened.read(|view| assert_eq!(view.count("_meta_stats").unwrap(), 3));
    }

    #[test]
    fn test_index_scan_orders_by_index_then_key() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 64);
        setup(&engine);
        let mut tx = engine.begin();
        for user in [2, 1, 2, 3] {
            tx.add("messages", json!({"userId": user})).unwrap();
        }
        tx.commit().unwrap();

        engine.read(|view| {
            let keys: Vec<Key> = view
                .index_scan("messages", "userId", &KeyRange::all(), Direction::Asc)
                .unwrap()
                .map(|(k, _)| k.clone())
                .collect();
            assert_eq!(keys, vec![Key::Int(2), Key::Int(1), Key::Int(3), Key::Int(4)]);

            let range = KeyRange::only(IndexKey::Number(2.0));
            let keys: Vec<Key> = view
                .index_scan("messages", "userId", &range, Direction::Desc)
                .unwrap()
                .map(|(k, _)| k.clone())
                .collect();
            assert_eq!(keys, vec![Key::Int(3), Key::Int(1)]);
        });
    }

    #[test]
    fn test_scan_with_empty_range_does_not_panic() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 64);
        setup(&engine);
        engine.read(|view| {
            let range = KeyRange::new(Bound::Excluded(Key::Int(5)), Bound::Excluded(Key::Int(5)));
            assert_eq!(view.scan("messages", &range, Direction::Asc).unwrap().count(), 0);
        });
    }

    #[test]
    fn test_create_index_on_existing_rows() {
        let storage = MemoryStorage::new_default();
        let engine = open(&storage, 64);
        setup(&engine);
        let mut tx = engine.begin();
        tx.add("messages", json!({"userId": 1, "text": "x"})).unwrap();
        tx.commit().unwrap();

        engine
            .upgrade(2, |ctx| {
                ctx.create_index("messages", "text")?;
                ctx.create_index("messages", "text")
            })
            .unwrap();

        engine.read(|view| {
            let range = KeyRange::only(IndexKey::Text("x".into()));
            assert_eq!(
                view.index_scan("messages", "text", &range, Direction::Asc)
                    .unwrap()
                    .count(),
                1
            );
        });
    }
}
