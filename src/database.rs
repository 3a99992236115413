//! The database handle.
//!
//! A [`Database`] owns the schema registry, the transactional substrate, and
//! every process-local collaborator: embedders, the query-embedding cache,
//! change subscribers, authorization hooks and the field transform. Nothing
//! is global; share a handle with `Arc<Database>`.
//!
//! ```
//! use pelta::database::Database;
//! use pelta::config::DatabaseConfig;
//! use pelta::record::Record;
//! use pelta::schema::{ColumnType, Schema, TableDefinition};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut schema = Schema::new();
//! schema.insert(
//!     "messages".to_string(),
//!     TableDefinition::new()
//!         .column("text", ColumnType::String)
//!         .column("userId", ColumnType::Number)
//!         .with_index("userId"),
//! );
//! let db = Database::new(DatabaseConfig::new("chat"), schema).unwrap();
//! db.load().await.unwrap();
//!
//! let id = db
//!     .insert("messages", Record::new().with("text", "hello world").with("userId", 1))
//!     .await
//!     .unwrap();
//! let hits = db.search("messages", "hello", Default::default()).await.unwrap();
//! assert_eq!(hits[0].id, id);
//! # });
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use ahash::AHashMap;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::config::DatabaseConfig;
use crate::error::{PeltaError, Result};
use crate::interceptor::{AuthHook, AuthRegistry, FieldTransform, NoopTransform, Operation};
use crate::notify::{ChangeBus, ChangeEvent, ChangeTracker, Subscription};
use crate::query::{self, FindOptions, Page};
use crate::record::Record;
use crate::schema::{Schema, SchemaRegistry, StoreName, StoreRole, TableDefinition};
use crate::search::{self, SearchHit, SearchOptions};
use crate::stats::{self, DatabaseStats, TableStats};
use crate::storage::{Storage, StorageFactory};
use crate::store::{Direction, Engine, Key, KeyRange, UpgradeContext};
use crate::vector::{
    self, Embedder, EmbedderRegistry, EmbeddingCache, KMeans, VectorHit, VectorSearchOptions,
    VectorWriter,
};

/// A user migration run inside a schema upgrade.
pub type Migration = Box<dyn Fn(&mut UpgradeContext<'_>) -> Result<()> + Send + Sync>;

pub struct Database {
    pub(crate) config: DatabaseConfig,
    storage: Arc<dyn Storage>,
    pub(crate) registry: RwLock<SchemaRegistry>,
    version: AtomicU32,
    adopt_persisted: bool,
    migrations: Vec<(u32, Migration)>,
    engine: RwLock<Option<Arc<Engine>>>,
    table_locks: Mutex<AHashMap<String, Arc<AsyncMutex<()>>>>,
    pub(crate) embedders: EmbedderRegistry,
    cache: EmbeddingCache,
    pub(crate) bus: ChangeBus,
    pub(crate) auth: AuthRegistry,
    transform: RwLock<Arc<dyn FieldTransform>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("version", &self.version())
            .field("tables", &self.registry.read().table_names().collect::<Vec<_>>())
            .field("loaded", &self.engine.read().is_some())
            .finish()
    }
}

impl Database {
    /// Create a handle over the storage named in `config`.
    pub fn new(config: DatabaseConfig, schema: Schema) -> Result<Self> {
        let storage = StorageFactory::create(config.storage.clone())?;
        Self::with_storage(config, schema, storage)
    }

    /// Create a handle over an existing storage backend.
    pub fn with_storage(
        config: DatabaseConfig,
        schema: Schema,
        storage: Arc<dyn Storage>,
    ) -> Result<Self> {
        let registry = SchemaRegistry::new(schema)?;
        Ok(Database {
            version: AtomicU32::new(config.version),
            cache: EmbeddingCache::new(config.embedding_cache_capacity),
            config,
            storage,
            registry: RwLock::new(registry),
            adopt_persisted: false,
            migrations: Vec::new(),
            engine: RwLock::new(None),
            table_locks: Mutex::new(AHashMap::new()),
            embedders: EmbedderRegistry::new(),
            bus: ChangeBus::new(),
            auth: AuthRegistry::new(),
            transform: RwLock::new(Arc::new(NoopTransform)),
        })
    }

    /// Open a database using the table definitions it persisted.
    pub async fn open_existing(config: DatabaseConfig) -> Result<Self> {
        let mut db = Self::new(config, Schema::new())?;
        db.adopt_persisted = true;
        db.load().await?;
        Ok(db)
    }

    /// Run `migration` when an upgrade crosses `version`.
    pub fn with_migration<F>(mut self, version: u32, migration: F) -> Self
    where
        F: Fn(&mut UpgradeContext<'_>) -> Result<()> + Send + Sync + 'static,
    {
        self.migrations.push((version, Box::new(migration)));
        self.migrations.sort_by_key(|(v, _)| *v);
        self
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// The schema version the next `load` will open at.
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Open the substrate, upgrading it to the registered schema.
    pub async fn load(&self) -> Result<()> {
        let engine = Engine::open(self.storage.clone(), self.config.wal_checkpoint_threshold)?;
        let persisted = engine.read(SchemaRegistry::load_persisted)?;

        if self.adopt_persisted {
            let mut registry = self.registry.write();
            let missing: Schema = persisted
                .iter()
                .filter(|(table, _)| registry.get(table).is_none())
                .map(|(table, def)| (table.clone(), def.clone()))
                .collect();
            registry.define(missing)?;
        }

        let registry = self.registry.read().clone();
        registry.check_against(&persisted)?;

        let stored = engine.version();
        let mut target = self.version();
        if self.adopt_persisted && target < stored {
            target = stored;
        }
        if target == stored && !engine.read(|view| registry.is_materialized(view)) {
            warn!(
                "schema of {} needs new stores but version is still {stored}; upgrading to {}",
                self.config.name,
                stored + 1
            );
            target = stored + 1;
        }

        engine.upgrade(target, |ctx| {
            registry.apply_upgrade(ctx)?;
            let (from, to) = (ctx.old_version(), ctx.new_version());
            for (version, migration) in &self.migrations {
                if *version > from && *version <= to {
                    debug!("running migration for version {version}");
                    migration(&mut *ctx)?;
                }
            }
            Ok(())
        })?;
        self.version.store(engine.version(), Ordering::SeqCst);

        if schema_changed(&registry, &persisted)? {
            let mut tx = engine.begin();
            registry.persist(&mut tx)?;
            tx.commit()?;
        }

        info!(
            "loaded database {} at version {} with {} tables",
            self.config.name,
            engine.version(),
            registry.schema().len()
        );
        *self.engine.write() = Some(Arc::new(engine));
        Ok(())
    }

    /// Add or replace table definitions; they take effect on the next `load`.
    pub fn define_schema(&self, schema: Schema, bump_version: bool) -> Result<()> {
        self.registry.write().define(schema)?;
        if bump_version {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    pub fn get_schema(&self) -> Schema {
        self.registry.read().schema().clone()
    }

    pub fn table_definition(&self, table: &str) -> Result<TableDefinition> {
        self.registry.read().table(table).cloned()
    }

    pub(crate) fn engine(&self) -> Result<Arc<Engine>> {
        self.engine.read().clone().ok_or(PeltaError::NotLoaded)
    }

    /// Serialize writes to `table` until the guard drops.
    pub(crate) async fn lock_table(&self, table: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .table_locks
            .lock()
            .entry(table.to_string())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub(crate) fn transform(&self) -> Arc<dyn FieldTransform> {
        self.transform.read().clone()
    }

    /// Associate an embedder with a table that has a vector configuration.
    pub fn register_embedder(&self, table: &str, embedder: Arc<dyn Embedder>) -> Result<()> {
        let definition = self.table_definition(table)?;
        vector::dims_of(table, &definition)?;
        debug!("registered embedder {} for {table}", embedder.name());
        self.embedders.register(table, embedder);
        Ok(())
    }

    pub fn subscribe<F>(&self, table: &str, callback: F) -> Result<Subscription>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.registry.read().table(table)?;
        Ok(self.bus.subscribe(table, callback))
    }

    pub fn add_tracker(&self, tracker: Arc<dyn ChangeTracker>) {
        self.bus.add_tracker(tracker);
    }

    pub fn register_auth_hook<H: AuthHook + 'static>(&self, name: &str, hook: H) {
        self.auth.register(name, hook);
    }

    pub fn remove_auth_hook(&self, name: &str) -> bool {
        self.auth.remove(name)
    }

    pub fn set_transform(&self, transform: Arc<dyn FieldTransform>) {
        *self.transform.write() = transform;
    }

    pub async fn get(&self, table: &str, id: impl Into<Key>) -> Result<Option<Record>> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        self.auth.check(Operation::Read, table, None)?;
        let id = id.into();
        let transform = self.transform();
        let store = StoreName::of(table, StoreRole::Primary);
        engine.read(|view| {
            view.get(&store, &id)?
                .map(|value| transform.decode(table, Record::denormalize(value, &definition)))
                .transpose()
        })
    }

    /// Records in primary-key order.
    pub async fn get_all(&self, table: &str, limit: Option<usize>) -> Result<Vec<Record>> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        self.auth.check(Operation::Read, table, None)?;
        let limit = limit.unwrap_or(self.config.find_limit);
        let transform = self.transform();
        let store = StoreName::of(table, StoreRole::Primary);
        engine.read(|view| {
            view.scan(&store, &KeyRange::all(), Direction::Asc)?
                .take(limit)
                .map(|(_, value)| transform.decode(table, Record::denormalize(value, &definition)))
                .collect()
        })
    }

    pub async fn find(&self, table: &str, options: FindOptions) -> Result<Vec<Record>> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        self.auth.check(Operation::Read, table, None)?;
        let limit = options.limit.unwrap_or(self.config.find_limit);
        let transform = self.transform();
        engine.read(|view| {
            query::execute(view, table, &definition, transform.as_ref(), &options, limit)
        })
    }

    /// Keyset pagination: records after `cursor`, with a cursor for the next page.
    pub async fn find_page(
        &self,
        table: &str,
        options: FindOptions,
        cursor: Option<&str>,
    ) -> Result<Page> {
        let definition = self.table_definition(table)?;
        let limit = options.limit.unwrap_or(self.config.find_limit);
        let options = query::after_cursor(&definition, &options, cursor)?;
        let records = self.find(table, options.with_limit(limit)).await?;
        query::make_page(&definition, records, limit)
    }

    pub async fn search(
        &self,
        table: &str,
        query: &str,
        options: SearchOptions,
    ) -> Result<Vec<SearchHit>> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        self.auth.check(Operation::Read, table, None)?;
        let limit = options.limit.unwrap_or(self.config.search_limit);
        let transform = self.transform();
        engine.read(|view| {
            search::search(
                view,
                table,
                &definition,
                transform.as_ref(),
                query,
                &options,
                limit,
            )
        })
    }

    pub async fn vector_search(
        &self,
        table: &str,
        query: &[f32],
        options: VectorSearchOptions,
    ) -> Result<Vec<VectorHit>> {
        let definition = self.table_definition(table)?;
        let engine = self.engine()?;
        self.auth.check(Operation::Read, table, None)?;
        let transform = self.transform();
        engine.read(|view| {
            vector::search(
                view,
                table,
                &definition,
                transform.as_ref(),
                &self.config,
                query,
                &options,
            )
        })
    }

    /// Embed `text` (through the cache) and run a vector search with it.
    pub async fn vector_search_text(
        &self,
        table: &str,
        text: &str,
        options: VectorSearchOptions,
    ) -> Result<Vec<VectorHit>> {
        let definition = self.table_definition(table)?;
        let dims = vector::dims_of(table, &definition)?;

        let query = match self.cache.get(table, text) {
            Some(cached) => cached,
            None => {
                let embedder = self.embedders.get(table).ok_or_else(|| {
                    PeltaError::invalid_operation(format!("No embedder registered for {table}"))
                })?;
                let embedding = embedder.embed(text).await?;
                if embedding.len() == dims {
                    self.cache.insert(table, text, embedding.clone());
                }
                embedding
            }
        };
        self.vector_search(table, &query, options).await
    }

    /// Embed the source text of a record when the table has an embedder.
    pub(crate) async fn embed_text(
        &self,
        table: &str,
        definition: &TableDefinition,
        text: &str,
    ) -> Result<Option<Vec<f32>>> {
        let Some(config) = &definition.vector else {
            return Ok(None);
        };
        let Some(embedder) = self.embedders.get(table) else {
            return Ok(None);
        };
        if text.is_empty() {
            return Ok(None);
        }
        let embedding = embedder.embed(text).await?;
        if embedding.len() != config.dims {
            return Err(PeltaError::dimension_mismatch(config.dims, embedding.len()));
        }
        Ok(Some(embedding))
    }

    /// Cluster the table's vectors into `centroids` groups (clamped to the
    /// corpus size), replacing any previous IVF index. Returns the number of
    /// non-empty clusters.
    pub async fn build_ivf_index(&self, table: &str, centroids: Option<usize>) -> Result<usize> {
        let definition = self.table_definition(table)?;
        let dims = vector::dims_of(table, &definition)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;

        let vectors: Vec<(Key, Vec<f32>)> = engine
            .read(|view| vector::stored_vectors(view, table))?
            .into_iter()
            .filter(|(_, v)| v.len() == dims)
            .collect();
        let k = centroids.unwrap_or(self.config.ivf.default_centroids);
        let clusters = KMeans::new(k, self.config.ivf.iterations).fit(&vectors)?;

        let mut tx = engine.begin();
        VectorWriter::new(&mut tx, table, dims).replace_index(&clusters)?;
        tx.commit()?;

        info!(
            "built IVF index for {table}: {} clusters over {} vectors",
            clusters.len(),
            vectors.len()
        );
        Ok(clusters.len())
    }

    pub async fn get_stats(&self, table: &str) -> Result<TableStats> {
        self.registry.read().table(table)?;
        let engine = self.engine()?;
        engine.read(|view| stats::read(view, table))
    }

    pub async fn get_all_stats(&self) -> Result<DatabaseStats> {
        let engine = self.engine()?;
        let tables: Vec<String> = self.registry.read().table_names().cloned().collect();
        let stats = engine.read(|view| {
            tables
                .iter()
                .map(|table| Ok((table.clone(), stats::read(view, table)?)))
                .collect::<Result<BTreeMap<_, _>>>()
        })?;
        Ok(DatabaseStats::from_tables(stats))
    }

    /// Recount a table from its stored records.
    pub async fn recompute_stats(&self, table: &str) -> Result<TableStats> {
        self.registry.read().table(table)?;
        let engine = self.engine()?;
        let _guard = self.lock_table(table).await;
        let mut tx = engine.begin();
        let stats = stats::recompute(&mut tx, table)?;
        tx.commit()?;
        Ok(stats)
    }

    /// Snapshot committed state and truncate the write-ahead log.
    pub async fn checkpoint(&self) -> Result<()> {
        self.engine()?.checkpoint()
    }
}

fn schema_changed(registry: &SchemaRegistry, persisted: &Schema) -> Result<bool> {
    if registry.schema().len() != persisted.len() {
        return Ok(true);
    }
    for (table, definition) in registry.schema() {
        let Some(old) = persisted.get(table) else {
            return Ok(true);
        };
        if serde_json::to_value(definition)? != serde_json::to_value(old)? {
            return Ok(true);
        }
    }
    Ok(false)
}
