//! Text embedders and the per-table embedder registry.

use std::future::Future;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::RwLock;

use crate::error::Result;

/// Turns text into an embedding vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn name(&self) -> &str {
        "unknown"
    }
}

type EmbedFn = dyn Fn(String) -> BoxFuture<'static, Result<Vec<f32>>> + Send + Sync;

/// An [`Embedder`] backed by an async closure.
///
/// ```
/// use pelta::error::PeltaError;
/// use pelta::vector::embedder::{Embedder, FnEmbedder};
///
/// # tokio_test_block(async {
/// let embedder = FnEmbedder::new(|text: String| async move {
///     Ok::<_, PeltaError>(vec![text.len() as f32, 1.0])
/// });
/// assert_eq!(embedder.embed("abc").await.unwrap(), vec![3.0, 1.0]);
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Runtime::new().unwrap().block_on(f)
/// # }
/// ```
pub struct FnEmbedder {
    name: String,
    embed: Box<EmbedFn>,
}

impl FnEmbedder {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<f32>>> + Send + 'static,
    {
        FnEmbedder {
            name: "closure".to_string(),
            embed: Box::new(move |text| f(text).boxed()),
        }
    }

    pub fn with_name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl Embedder for FnEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        (self.embed)(text.to_string()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for FnEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnEmbedder").field("name", &self.name).finish()
    }
}

/// Table → embedder, for the lifetime of the process.
#[derive(Default)]
pub struct EmbedderRegistry {
    embedders: RwLock<AHashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, table: &str, embedder: Arc<dyn Embedder>) {
        self.embedders.write().insert(table.to_string(), embedder);
    }

    pub fn get(&self, table: &str) -> Option<Arc<dyn Embedder>> {
        self.embedders.read().get(table).cloned()
    }

    pub fn contains(&self, table: &str) -> bool {
        self.embedders.read().contains_key(table)
    }
}

impl std::fmt::Debug for EmbedderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let embedders = self.embedders.read();
        let mut tables: Vec<&String> = embedders.keys().collect();
        tables.sort();
        f.debug_struct("EmbedderRegistry")
            .field("tables", &tables)
            .finish()
    }
}
