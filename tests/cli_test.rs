use clap::Parser;
use tempfile::TempDir;

use pelta::cli::args::PeltaArgs;
use pelta::cli::commands::execute_command;
use pelta::config::DatabaseConfig;
use pelta::database::Database;
use pelta::error::Result;
use pelta::prelude::*;
use pelta::storage::StorageConfig;
use pelta::storage::file::FileStorageConfig;
use pelta::transfer::ExportData;

fn config(dir: &TempDir) -> DatabaseConfig {
    DatabaseConfig::new("cli")
        .with_storage(StorageConfig::File(FileStorageConfig::new(dir.path())))
}

async fn create(dir: &TempDir) -> Result<()> {
    let mut schema = Schema::new();
    schema.insert(
        "notes".to_string(),
        TableDefinition::new()
            .column("text", ColumnType::String)
            .column("rank", ColumnType::Number)
            .with_index("rank"),
    );
    let db = Database::new(config(dir), schema)?;
    db.load().await?;
    for (i, text) in ["first note", "second note", "third note"].iter().enumerate() {
        db.insert("notes", Record::new().with("text", *text).with("rank", i as i64))
            .await?;
    }
    Ok(())
}

async fn run(args: &[&str]) -> Result<()> {
    let mut argv = vec!["pelta", "-q", "--format", "json"];
    argv.extend_from_slice(args);
    let args = PeltaArgs::try_parse_from(argv).expect("valid arguments");
    execute_command(args).await
}

#[tokio::test]
async fn test_read_commands_against_a_directory() -> Result<()> {
    let dir = TempDir::new()?;
    create(&dir).await?;
    let path = dir.path().to_str().expect("utf-8 path");

    run(&["schema", path]).await?;
    run(&["stats", path]).await?;
    run(&["stats", path, "--table", "notes"]).await?;
    run(&["get-all", path, "notes", "--limit", "2"]).await?;
    run(&["find", path, "notes", "--where", r#"{"rank": {"$gte": 1}}"#, "--order-by", "rank", "--desc"]).await?;
    run(&["search", path, "notes", "second"]).await?;
    run(&["checkpoint", path]).await?;

    assert!(run(&["get-all", path, "missing"]).await.is_err());
    assert!(run(&["find", path, "notes", "--where", "not json"]).await.is_err());
    Ok(())
}

#[tokio::test]
async fn test_export_then_replace_import() -> Result<()> {
    let dir = TempDir::new()?;
    create(&dir).await?;
    let path = dir.path().to_str().expect("utf-8 path");
    let dump = TempDir::new()?;
    let dump_file = dump.path().join("dump.json");
    let dump_path = dump_file.to_str().expect("utf-8 path");

    run(&["export", path, "--output", dump_path]).await?;
    let mut data: ExportData = serde_json::from_str(&std::fs::read_to_string(&dump_file)?)?;
    assert_eq!(data["notes"].len(), 3);

    data.get_mut("notes").expect("notes exported").truncate(1);
    std::fs::write(&dump_file, serde_json::to_string(&data)?)?;
    run(&["import", path, dump_path, "--mode", "replace"]).await?;

    let db = Database::open_existing(config(&dir)).await?;
    assert_eq!(db.get_all("notes", None).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_missing_directory_is_an_error() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent");
    let result = run(&["stats", missing.to_str().unwrap()]).await;
    assert!(result.is_err());
}
