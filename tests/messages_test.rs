use std::sync::Arc;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

use pelta::config::DatabaseConfig;
use pelta::database::Database;
use pelta::error::{PeltaError, Result};
use pelta::interceptor::Operation;
use pelta::notify::ChangeKind;
use pelta::prelude::*;
use pelta::search::TimeRange;

fn messages_schema() -> Schema {
    let mut schema = Schema::new();
    schema.insert(
        "messages".to_string(),
        TableDefinition::new()
            .column("text", ColumnType::String)
            .column("userId", ColumnType::Number)
            .column("timestamp", ColumnType::Date)
            .with_searchable_fields(["text"])
            .with_index("userId"),
    );
    schema
}

async fn open() -> Result<Database> {
    let db = Database::new(DatabaseConfig::new("chat"), messages_schema())?;
    db.load().await?;
    Ok(db)
}

fn message(text: &str, user: i64, day: u32) -> Record {
    Record::new()
        .with("text", text)
        .with("userId", user)
        .with("timestamp", Utc.with_ymd_and_hms(2024, 5, day, 12, 0, 0).unwrap())
}

#[tokio::test]
async fn test_find_and_search_messages() -> Result<()> {
    let db = open().await?;
    let first = db.insert("messages", message("Hello world", 1, 1)).await?;
    let second = db.insert("messages", message("Goodbye world", 1, 2)).await?;
    db.insert("messages", message("Something else", 2, 3)).await?;
    assert_eq!(first, Key::Int(1));
    assert_eq!(second, Key::Int(2));

    let by_user = db
        .find("messages", FindOptions::new().with_filter(Where::new().eq("userId", 1)))
        .await?;
    assert_eq!(by_user.len(), 2);
    assert!(by_user.iter().all(|r| r.get("userId") == Some(&Value::Number(1.0))));

    let hits = db.search("messages", "hello", SearchOptions::new()).await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, first);
    assert!(hits[0].score > 0.0);

    // "world" appears in two records and scores lower than the rarer "hello".
    let hits = db.search("messages", "hello world", SearchOptions::new()).await?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, first);
    assert!(hits[0].score > hits[1].score);
    Ok(())
}

#[tokio::test]
async fn test_search_time_range_and_filter() -> Result<()> {
    let db = open().await?;
    db.insert("messages", message("status update", 1, 1)).await?;
    db.insert("messages", message("status report", 2, 10)).await?;
    db.insert("messages", message("status check", 1, 20)).await?;

    let range = TimeRange::new(
        Utc.with_ymd_and_hms(2024, 5, 5, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 5, 31, 0, 0, 0).unwrap(),
    );
    let hits = db
        .search("messages", "status", SearchOptions::new().with_time_range(range))
        .await?;
    assert_eq!(hits.len(), 2);

    let hits = db
        .search(
            "messages",
            "status",
            SearchOptions::new()
                .with_time_range(range)
                .with_filter(Where::new().eq("userId", 1)),
        )
        .await?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].record.get("text"), Some(&Value::from("status check")));
    Ok(())
}

#[tokio::test]
async fn test_empty_query_returns_everything_in_key_order() -> Result<()> {
    let db = open().await?;
    for day in 1..=3 {
        db.insert("messages", message("text", 1, day)).await?;
    }
    let hits = db.search("messages", "  ", SearchOptions::new().with_limit(2)).await?;
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].id, Key::Int(1));
    assert_eq!(hits[1].id, Key::Int(2));
    assert!(hits.iter().all(|hit| hit.score == 0.0));
    Ok(())
}

#[tokio::test]
async fn test_update_reindexes_and_delete_unindexes() -> Result<()> {
    let db = open().await?;
    let id = db.insert("messages", message("alpha beta", 1, 1)).await?;

    let updated = db
        .update("messages", id.clone(), Record::new().with("text", "gamma"))
        .await?;
    assert_eq!(updated.get("text"), Some(&Value::from("gamma")));
    assert_eq!(updated.get("userId"), Some(&Value::Number(1.0)));
    assert!(db.search("messages", "alpha", SearchOptions::new()).await?.is_empty());
    assert_eq!(db.search("messages", "gamma", SearchOptions::new()).await?.len(), 1);

    db.delete("messages", id.clone()).await?;
    assert!(db.get("messages", id.clone()).await?.is_none());
    assert!(db.search("messages", "gamma", SearchOptions::new()).await?.is_empty());
    assert_eq!(db.get_stats("messages").await?.count, 0);

    let result = db.delete("messages", id).await;
    assert!(matches!(result, Err(PeltaError::RecordNotFound { .. })));
    Ok(())
}

#[tokio::test]
async fn test_stats_track_writes() -> Result<()> {
    let db = open().await?;
    let id = db.insert("messages", message("one", 1, 1)).await?;
    db.insert("messages", message("two", 1, 2)).await?;

    let stats = db.get_stats("messages").await?;
    assert_eq!(stats.count, 2);
    assert!(stats.total_bytes > 0);

    db.update("messages", id, Record::new().with("text", "a much longer text than before"))
        .await?;
    let grown = db.get_stats("messages").await?;
    assert_eq!(grown.count, 2);
    assert!(grown.total_bytes > stats.total_bytes);

    assert_eq!(db.recompute_stats("messages").await?, grown);

    let all = db.get_all_stats().await?;
    assert_eq!(all.total_tables, 1);
    assert_eq!(all.overall_bytes, grown.total_bytes);
    Ok(())
}

#[tokio::test]
async fn test_subscribers_see_committed_changes() -> Result<()> {
    let db = open().await?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let subscription = db.subscribe("messages", move |event| {
        sink.lock().push((event.kind, event.old_record.is_some()));
    })?;

    let id = db.insert("messages", message("hi", 1, 1)).await?;
    db.update("messages", id.clone(), Record::new().with("text", "hey")).await?;
    // A rejected write publishes nothing.
    assert!(db.insert("messages", Record::new().with("text", "no user")).await.is_err());
    db.delete("messages", id).await?;

    assert_eq!(
        *seen.lock(),
        vec![
            (ChangeKind::Insert, false),
            (ChangeKind::Update, true),
            (ChangeKind::Delete, false),
        ]
    );

    assert!(subscription.cancel());
    db.insert("messages", message("after", 1, 2)).await?;
    assert_eq!(seen.lock().len(), 3);

    assert!(matches!(
        db.subscribe("nope", |_| {}),
        Err(PeltaError::TableNotFound(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_auth_hooks_gate_operations() -> Result<()> {
    let db = open().await?;
    let id = db.insert("messages", message("kept", 1, 1)).await?;

    db.register_auth_hook("no-deletes", |op: Operation, _: &str, _: Option<&Record>| {
        op != Operation::Delete
    });
    let result = db.delete("messages", id.clone()).await;
    assert!(matches!(result, Err(PeltaError::AuthorizationDenied { .. })));
    assert!(db.get("messages", id.clone()).await?.is_some());

    assert!(db.remove_auth_hook("no-deletes"));
    db.delete("messages", id).await?;
    Ok(())
}
