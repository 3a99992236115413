//! Command implementations for the Pelta CLI.

use std::fs;
use std::time::Instant;

use log::info;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::DatabaseConfig;
use crate::database::Database;
use crate::error::{PeltaError, Result};
use crate::query::{FindOptions, Where};
use crate::search::SearchOptions;
use crate::stats::DatabaseStats;
use crate::storage::StorageConfig;
use crate::storage::file::FileStorageConfig;
use crate::store::Direction;
use crate::transfer::{ExportData, ExportOptions};

/// Execute a CLI command.
pub async fn execute_command(args: PeltaArgs) -> Result<()> {
    let db = open_database(&args).await?;
    match &args.command {
        Command::Schema(_) => show_schema(&db, &args),
        Command::Stats(stats_args) => show_stats(&db, stats_args, &args).await,
        Command::GetAll(get_args) => get_all(&db, get_args, &args).await,
        Command::Find(find_args) => find(&db, find_args, &args).await,
        Command::Search(search_args) => search(&db, search_args, &args).await,
        Command::Export(export_args) => export(&db, export_args, &args).await,
        Command::Import(import_args) => import(&db, import_args, &args).await,
        Command::BuildIvf(build_args) => build_ivf(&db, build_args, &args).await,
        Command::Checkpoint(_) => checkpoint(&db, &args).await,
    }
}

/// Open the database stored under the command's directory with its persisted schema.
async fn open_database(args: &PeltaArgs) -> Result<Database> {
    let path = args.command.db_path();
    if !path.is_dir() {
        return Err(PeltaError::invalid_argument(format!(
            "Database directory does not exist: {}",
            path.display()
        )));
    }
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pelta".to_string());
    let config = DatabaseConfig::new(name)
        .with_storage(StorageConfig::File(FileStorageConfig::new(path)));
    info!("opening database at {}", path.display());
    Database::open_existing(config).await
}

fn show_schema(db: &Database, cli_args: &PeltaArgs) -> Result<()> {
    let schema = db.get_schema();
    output_result(
        &format!("Schema (version {}, {} tables)", db.version(), schema.len()),
        &schema,
        cli_args,
    )
}

async fn show_stats(db: &Database, args: &StatsArgs, cli_args: &PeltaArgs) -> Result<()> {
    let stats = match &args.table {
        Some(table) => {
            let table_stats = db.get_stats(table).await?;
            DatabaseStats::from_tables([(table.clone(), table_stats)].into_iter().collect())
        }
        None => db.get_all_stats().await?,
    };
    output_result("Database statistics", &stats, cli_args)
}

async fn get_all(db: &Database, args: &GetAllArgs, cli_args: &PeltaArgs) -> Result<()> {
    let records = db.get_all(&args.table, args.limit).await?;
    let list = RecordList {
        table: args.table.clone(),
        records,
        next_cursor: None,
    };
    output_result(&format!("Records in {}", args.table), &list, cli_args)
}

async fn find(db: &Database, args: &FindArgs, cli_args: &PeltaArgs) -> Result<()> {
    let definition = db.table_definition(&args.table)?;
    let mut options = FindOptions::new().with_offset(args.offset);
    if let Some(filter) = &args.filter {
        let json: serde_json::Value = serde_json::from_str(filter)?;
        options = options.with_filter(Where::from_json(&json, &definition)?);
    }
    if let Some(field) = &args.order_by {
        let direction = if args.desc {
            Direction::Desc
        } else {
            Direction::Asc
        };
        options = options.with_order(field.clone(), direction);
    }
    if let Some(limit) = args.limit {
        options = options.with_limit(limit);
    }

    let list = if args.cursor.is_some() || args.limit.is_some() {
        let page = db
            .find_page(&args.table, options, args.cursor.as_deref())
            .await?;
        RecordList {
            table: args.table.clone(),
            records: page.records,
            next_cursor: page.next_cursor,
        }
    } else {
        RecordList {
            table: args.table.clone(),
            records: db.find(&args.table, options).await?,
            next_cursor: None,
        }
    };
    output_result(&format!("Matches in {}", args.table), &list, cli_args)
}

async fn search(db: &Database, args: &SearchArgs, cli_args: &PeltaArgs) -> Result<()> {
    let mut options = SearchOptions::new();
    if let Some(limit) = args.limit {
        options = options.with_limit(limit);
    }

    let start = Instant::now();
    let hits = db.search(&args.table, &args.query, options).await?;
    let results = SearchResults {
        table: args.table.clone(),
        query: args.query.clone(),
        hits,
        duration_ms: start.elapsed().as_millis() as u64,
    };
    output_result(
        &format!("{} result(s) for \"{}\"", results.hits.len(), args.query),
        &results,
        cli_args,
    )
}

async fn export(db: &Database, args: &ExportArgs, cli_args: &PeltaArgs) -> Result<()> {
    let data = db
        .export(ExportOptions {
            tables: args.tables.clone(),
            include_vectors: args.include_vectors,
        })
        .await?;

    match &args.output {
        Some(path) => {
            let json = if cli_args.pretty {
                serde_json::to_string_pretty(&data)?
            } else {
                serde_json::to_string(&data)?
            };
            fs::write(path, json)?;
            let result = ExportResult {
                path: path.display().to_string(),
                tables: data.len(),
                records: data.values().map(Vec::len).sum(),
            };
            output_result("Export written", &result, cli_args)
        }
        // Export data goes to stdout as JSON regardless of the output format.
        None => {
            let json = if cli_args.pretty {
                serde_json::to_string_pretty(&data)?
            } else {
                serde_json::to_string(&data)?
            };
            println!("{json}");
            Ok(())
        }
    }
}

async fn import(db: &Database, args: &ImportArgs, cli_args: &PeltaArgs) -> Result<()> {
    let contents = fs::read_to_string(&args.input)?;
    let data: ExportData = serde_json::from_str(&contents)?;
    let summary = db.import(data, args.mode.into()).await?;
    output_result(
        &format!("Imported {} record(s)", summary.total()),
        &summary,
        cli_args,
    )
}

async fn build_ivf(db: &Database, args: &BuildIvfArgs, cli_args: &PeltaArgs) -> Result<()> {
    let clusters = db.build_ivf_index(&args.table, args.centroids).await?;
    let result = IvfBuildResult {
        table: args.table.clone(),
        clusters,
    };
    output_result(&format!("Built IVF index for {}", args.table), &result, cli_args)
}

async fn checkpoint(db: &Database, cli_args: &PeltaArgs) -> Result<()> {
    db.checkpoint().await?;
    let stats = db.get_all_stats().await?;
    output_result("Checkpoint complete", &stats, cli_args)
}
