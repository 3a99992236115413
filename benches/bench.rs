//! Criterion benchmarks for Pelta.
//!
//! Covers tokenization, distance scoring, k-means clustering and the
//! end-to-end insert, search and vector search paths.

use std::hint::black_box;
use std::sync::Arc;

use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use pelta::analysis::tokenize;
use pelta::config::DatabaseConfig;
use pelta::database::Database;
use pelta::error::PeltaError;
use pelta::record::Record;
use pelta::schema::{ColumnType, Schema, TableDefinition};
use pelta::store::Key;
use pelta::vector::{DistanceMetric, FnEmbedder, KMeans, VectorSearchOptions};

const WORDS: &[&str] = &[
    "record", "table", "index", "query", "vector", "cluster", "search", "token", "score",
    "storage", "snapshot", "log", "commit", "schema", "filter", "cursor", "embedding",
    "centroid", "ranking", "field",
];

fn generate_texts(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| {
            let len = 10 + (i % 30);
            (0..len)
                .map(|j| WORDS[(i * 7 + j * 13) % WORDS.len()])
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn generate_vectors(count: usize, dimension: usize) -> Vec<(Key, Vec<f32>)> {
    (0..count)
        .map(|i| {
            let data = (0..dimension)
                .map(|j| ((i as f32 * 0.1 + j as f32 * 0.01).sin() * 0.5 + 0.5) * 2.0 - 1.0)
                .collect();
            (Key::Int(i as i64), data)
        })
        .collect()
}

/// Deterministic 8-dimensional embedding from word hashes.
fn hash_embedding(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0f32; 8];
    for token in tokenize(text) {
        let bucket = token.bytes().fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
        vector[bucket % 8] += 1.0;
    }
    vector
}

fn schema() -> Schema {
    let mut schema = Schema::new();
    schema.insert(
        "docs".to_string(),
        TableDefinition::new()
            .column("text", ColumnType::String)
            .column("group", ColumnType::Number)
            .with_index("group")
            .with_vector("text", 8),
    );
    schema
}

async fn populated_db(texts: &[String]) -> Database {
    let db = Database::new(DatabaseConfig::new("bench"), schema()).unwrap();
    db.load().await.unwrap();
    db.register_embedder(
        "docs",
        Arc::new(FnEmbedder::new(|text: String| async move {
            Ok::<_, PeltaError>(hash_embedding(&text))
        })),
    )
    .unwrap();
    let records = texts
        .iter()
        .enumerate()
        .map(|(i, text)| {
            Record::new()
                .with("text", text.as_str())
                .with("group", (i % 10) as i64)
        })
        .collect();
    db.bulk_insert("docs", records).await.unwrap();
    db
}

fn bench_tokenize(c: &mut Criterion) {
    let mut group = c.benchmark_group("analysis");
    let texts = generate_texts(100);

    group.throughput(Throughput::Elements(texts.len() as u64));
    group.bench_function("tokenize_batch", |b| {
        b.iter(|| {
            for text in &texts {
                black_box(tokenize(black_box(text)));
            }
        })
    });
    group.finish();
}

fn bench_distance(c: &mut Criterion) {
    let mut group = c.benchmark_group("distance");
    let vectors = generate_vectors(1000, 128);
    let query = vectors[0].1.clone();

    for metric in [DistanceMetric::Cosine, DistanceMetric::Dot, DistanceMetric::Euclidean] {
        group.throughput(Throughput::Elements(vectors.len() as u64));
        group.bench_function(format!("{metric:?}_1000x128"), |b| {
            b.iter(|| {
                for (_, candidate) in &vectors {
                    black_box(metric.score(black_box(&query), candidate));
                }
            })
        });
    }
    group.finish();
}

fn bench_kmeans(c: &mut Criterion) {
    let mut group = c.benchmark_group("ivf");
    group.sample_size(20);
    let vectors = generate_vectors(1000, 32);

    group.bench_function("kmeans_16_clusters", |b| {
        b.iter(|| {
            let clusters = KMeans::new(16, 10).with_seed(7).fit(black_box(&vectors)).unwrap();
            black_box(clusters)
        })
    });
    group.finish();
}

fn bench_database(c: &mut Criterion) {
    let mut group = c.benchmark_group("database");
    group.sample_size(20);
    let runtime = Runtime::new().unwrap();
    let texts = generate_texts(500);
    let db = runtime.block_on(populated_db(&texts));

    group.bench_function("insert", |b| {
        b.to_async(&runtime).iter(|| async {
            let record = Record::new().with("text", "record index query").with("group", 1);
            black_box(db.insert("docs", record).await.unwrap())
        })
    });

    group.bench_function("search", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(db.search("docs", "vector cluster", Default::default()).await.unwrap())
        })
    });

    let query = hash_embedding("search ranking score");
    group.bench_function("vector_search_exact", |b| {
        b.to_async(&runtime).iter(|| async {
            let options = VectorSearchOptions::new().with_limit(10);
            black_box(db.vector_search("docs", &query, options).await.unwrap())
        })
    });

    runtime.block_on(db.build_ivf_index("docs", Some(8))).unwrap();
    group.bench_function("vector_search_ivf", |b| {
        b.to_async(&runtime).iter(|| async {
            let options = VectorSearchOptions::new().with_limit(10).with_ivf(true);
            black_box(db.vector_search("docs", &query, options).await.unwrap())
        })
    });

    group.finish();
}

criterion_group!(benches, bench_tokenize, bench_distance, bench_kmeans, bench_database);

criterion_main!(benches);
