//! Command line argument parsing for the Pelta CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::transfer::ImportMode;

/// Pelta - an embedded record store with full-text and vector search
#[derive(Parser, Debug, Clone)]
#[command(name = "pelta")]
#[command(about = "Inspect and maintain Pelta databases")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct PeltaArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl PeltaArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print the persisted table definitions
    Schema(SchemaArgs),

    /// Show record counts and sizes
    Stats(StatsArgs),

    /// List records in primary-key order
    #[command(name = "get-all")]
    GetAll(GetAllArgs),

    /// Run a structured query
    Find(FindArgs),

    /// Full-text search a table
    Search(SearchArgs),

    /// Export tables as JSON
    Export(ExportArgs),

    /// Import tables from a JSON export
    Import(ImportArgs),

    /// Rebuild the IVF vector index of a table
    #[command(name = "build-ivf")]
    BuildIvf(BuildIvfArgs),

    /// Snapshot the database and truncate its write-ahead log
    Checkpoint(CheckpointArgs),
}

impl Command {
    /// Database directory the command operates on.
    pub fn db_path(&self) -> &PathBuf {
        match self {
            Command::Schema(args) => &args.db_path,
            Command::Stats(args) => &args.db_path,
            Command::GetAll(args) => &args.db_path,
            Command::Find(args) => &args.db_path,
            Command::Search(args) => &args.db_path,
            Command::Export(args) => &args.db_path,
            Command::Import(args) => &args.db_path,
            Command::BuildIvf(args) => &args.db_path,
            Command::Checkpoint(args) => &args.db_path,
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct SchemaArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct StatsArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    /// Only show this table
    #[arg(short, long)]
    pub table: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct GetAllArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    #[arg(value_name = "TABLE")]
    pub table: String,

    /// Maximum number of records to return
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct FindArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    #[arg(value_name = "TABLE")]
    pub table: String,

    /// Conditions as a JSON object, e.g. '{"userId": 1, "score": {"$gte": 3}}'
    #[arg(short, long = "where", value_name = "JSON")]
    pub filter: Option<String>,

    /// Field to order by
    #[arg(long)]
    pub order_by: Option<String>,

    /// Order descending
    #[arg(long)]
    pub desc: bool,

    /// Maximum number of records to return
    #[arg(short, long)]
    pub limit: Option<usize>,

    /// Records to skip
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Continue after a cursor from a previous page
    #[arg(long)]
    pub cursor: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct SearchArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    #[arg(value_name = "TABLE")]
    pub table: String,

    /// Query string
    #[arg(value_name = "QUERY")]
    pub query: String,

    /// Maximum number of results to return
    #[arg(short, long)]
    pub limit: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct ExportArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    /// Write to this file instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Comma-separated tables to export (default: all)
    #[arg(short, long, value_delimiter = ',')]
    pub tables: Option<Vec<String>>,

    /// Include stored embeddings
    #[arg(long)]
    pub include_vectors: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct ImportArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    /// JSON file produced by `export`
    #[arg(value_name = "INPUT")]
    pub input: PathBuf,

    /// How imported rows combine with existing records
    #[arg(short, long, default_value = "merge")]
    pub mode: ImportModeArg,
}

#[derive(Parser, Debug, Clone)]
pub struct BuildIvfArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,

    #[arg(value_name = "TABLE")]
    pub table: String,

    /// Number of clusters (default from configuration)
    #[arg(short, long)]
    pub centroids: Option<usize>,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckpointArgs {
    /// Path to the database directory
    #[arg(value_name = "DB_PATH")]
    pub db_path: PathBuf,
}

/// Output format options
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportModeArg {
    /// Overwrite records with the same id, keep the rest
    Merge,
    /// Empty each imported table first
    Replace,
}

impl From<ImportModeArg> for ImportMode {
    fn from(mode: ImportModeArg) -> Self {
        match mode {
            ImportModeArg::Merge => ImportMode::Merge,
            ImportModeArg::Replace => ImportMode::Replace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_command() {
        let args = PeltaArgs::try_parse_from([
            "pelta",
            "find",
            "/data/chat",
            "messages",
            "--where",
            r#"{"userId": 1}"#,
            "--order-by",
            "timestamp",
            "--desc",
            "--limit",
            "5",
        ])
        .unwrap();

        if let Command::Find(find) = args.command {
            assert_eq!(find.db_path, PathBuf::from("/data/chat"));
            assert_eq!(find.table, "messages");
            assert_eq!(find.filter.as_deref(), Some(r#"{"userId": 1}"#));
            assert_eq!(find.order_by.as_deref(), Some("timestamp"));
            assert!(find.desc);
            assert_eq!(find.limit, Some(5));
            assert_eq!(find.offset, 0);
            assert!(find.cursor.is_none());
        } else {
            panic!("Expected find command");
        }
    }

    #[test]
    fn test_export_tables_are_comma_separated() {
        let args = PeltaArgs::try_parse_from([
            "pelta",
            "export",
            "/data/chat",
            "--tables",
            "messages,users",
            "--include-vectors",
        ])
        .unwrap();

        if let Command::Export(export) = args.command {
            assert_eq!(
                export.tables,
                Some(vec!["messages".to_string(), "users".to_string()])
            );
            assert!(export.include_vectors);
            assert!(export.output.is_none());
        } else {
            panic!("Expected export command");
        }
    }

    #[test]
    fn test_import_mode() {
        let args = PeltaArgs::try_parse_from([
            "pelta", "import", "/data/chat", "dump.json", "--mode", "replace",
        ])
        .unwrap();
        if let Command::Import(import) = &args.command {
            assert_eq!(ImportMode::from(import.mode), ImportMode::Replace);
        } else {
            panic!("Expected import command");
        }
        assert_eq!(args.command.db_path(), &PathBuf::from("/data/chat"));

        let args = PeltaArgs::try_parse_from(["pelta", "import", "/data/chat", "dump.json"]).unwrap();
        if let Command::Import(import) = args.command {
            assert_eq!(import.mode, ImportModeArg::Merge);
        }

        assert!(
            PeltaArgs::try_parse_from([
                "pelta", "import", "/data/chat", "dump.json", "--mode", "upsert",
            ])
            .is_err()
        );
    }

    #[test]
    fn test_verbosity_levels() {
        let args = PeltaArgs::try_parse_from(["pelta", "checkpoint", "/data"]).unwrap();
        assert_eq!(args.verbosity(), 1);

        let args = PeltaArgs::try_parse_from(["pelta", "-vvv", "checkpoint", "/data"]).unwrap();
        assert_eq!(args.verbosity(), 3);

        let args = PeltaArgs::try_parse_from(["pelta", "-q", "-vv", "checkpoint", "/data"]).unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_output_format() {
        let args = PeltaArgs::try_parse_from([
            "pelta", "--format", "json", "--pretty", "stats", "/data", "--table", "messages",
        ])
        .unwrap();
        assert_eq!(args.output_format, OutputFormat::Json);
        assert!(args.pretty);
        if let Command::Stats(stats) = args.command {
            assert_eq!(stats.table.as_deref(), Some("messages"));
        } else {
            panic!("Expected stats command");
        }
    }

    #[test]
    fn test_build_ivf_command() {
        let args = PeltaArgs::try_parse_from([
            "pelta", "build-ivf", "/data", "docs", "--centroids", "8",
        ])
        .unwrap();
        if let Command::BuildIvf(build) = args.command {
            assert_eq!(build.table, "docs");
            assert_eq!(build.centroids, Some(8));
        } else {
            panic!("Expected build-ivf command");
        }
    }
}
