//! Output formatting for CLI commands.

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::cli::args::{OutputFormat, PeltaArgs};
use crate::error::Result;
use crate::record::Record;
use crate::search::SearchHit;

/// Records returned by `get-all` and `find`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList {
    pub table: String,
    pub records: Vec<Record>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Result structure for full-text search.
#[derive(Debug, Serialize)]
pub struct SearchResults {
    pub table: String,
    pub query: String,
    pub hits: Vec<SearchHit>,
    pub duration_ms: u64,
}

/// Result structure for IVF rebuilds.
#[derive(Debug, Serialize)]
pub struct IvfBuildResult {
    pub table: String,
    pub clusters: usize,
}

/// Result structure for exports written to a file.
#[derive(Debug, Serialize)]
pub struct ExportResult {
    pub path: String,
    pub tables: usize,
    pub records: usize,
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &PeltaArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

/// Output in human-readable format.
fn output_human<T: Serialize>(message: &str, result: &T, args: &PeltaArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!();
    }

    let value = serde_json::to_value(result)?;
    if let Some(hits) = value.get("hits").and_then(|h| h.as_array()) {
        output_hits_human(hits);
    } else if let Some(records) = value.get("records").and_then(|r| r.as_array()) {
        output_records_human(records, value.get("nextCursor"));
    } else if value.get("overallBytes").is_some() {
        output_stats_human(&value);
    } else {
        output_generic_human(&value, 0);
    }
    Ok(())
}

fn output_hits_human(hits: &[JsonValue]) {
    if hits.is_empty() {
        println!("No matches.");
        return;
    }
    for (i, hit) in hits.iter().enumerate() {
        let score = hit.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0);
        let id = hit.get("id").map(format_value).unwrap_or_default();
        println!("{}. [{id}] (score: {score:.3})", i + 1);
        if let Some(record) = hit.get("record") {
            output_generic_human(record, 1);
        }
    }
}

fn output_records_human(records: &[JsonValue], next_cursor: Option<&JsonValue>) {
    for record in records {
        println!("{}", format_record_line(record));
    }
    println!();
    println!("{} record(s)", records.len());
    if let Some(cursor) = next_cursor.and_then(|c| c.as_str()) {
        println!("Next cursor: {cursor}");
    }
}

fn output_stats_human(value: &JsonValue) {
    let tables = value.get("tables").and_then(|t| t.as_object());
    if let Some(tables) = tables {
        println!("{:<24} {:>10} {:>12}", "TABLE", "RECORDS", "SIZE");
        for (name, stats) in tables {
            let count = stats.get("count").and_then(|c| c.as_u64()).unwrap_or(0);
            let bytes = stats.get("totalBytes").and_then(|b| b.as_u64()).unwrap_or(0);
            println!("{name:<24} {count:>10} {:>12}", format_bytes(bytes));
        }
    }
    let overall = value.get("overallBytes").and_then(|b| b.as_u64()).unwrap_or(0);
    println!();
    println!("Total: {}", format_bytes(overall));
}

/// Generic key/value output, nested objects indented.
fn output_generic_human(value: &JsonValue, indent: usize) {
    let spaces = "  ".repeat(indent);
    match value {
        JsonValue::Object(obj) => {
            for (key, val) in obj {
                if let JsonValue::Object(_) = val {
                    println!("{spaces}{key}:");
                    output_generic_human(val, indent + 1);
                } else {
                    println!("{spaces}{key}: {}", format_value(val));
                }
            }
        }
        _ => println!("{spaces}{}", format_value(value)),
    }
}

/// Output in JSON format.
fn output_json<T: Serialize>(result: &T, args: &PeltaArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };
    println!("{json}");
    Ok(())
}

fn format_record_line(record: &JsonValue) -> String {
    match record.as_object() {
        Some(obj) => obj
            .iter()
            .map(|(key, val)| format!("{key}={}", format_value(val)))
            .collect::<Vec<_>>()
            .join("  "),
        None => format_value(record),
    }
}

/// Format a JSON value for display.
fn format_value(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        JsonValue::Object(_) => "[object]".to_string(),
        JsonValue::Null => "null".to_string(),
    }
}

/// Format bytes into human-readable format.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(1048576), "1.0 MB");
        assert_eq!(format_bytes(1073741824), "1.0 GB");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(&json!("test")), "test");
        assert_eq!(format_value(&json!(42)), "42");
        assert_eq!(format_value(&json!([1, "a"])), "[1, a]");
        assert_eq!(format_value(&json!({"a": 1})), "[object]");
        assert_eq!(format_value(&JsonValue::Null), "null");
    }

    #[test]
    fn test_format_record_line() {
        let line = format_record_line(&json!({"id": 1, "text": "hello"}));
        assert_eq!(line, "id=1  text=hello");
    }

    #[test]
    fn test_record_list_serialization() {
        let list = RecordList {
            table: "messages".to_string(),
            records: vec![Record::new().with("id", 1)],
            next_cursor: None,
        };
        let value = serde_json::to_value(&list).unwrap();
        assert_eq!(value["table"], "messages");
        assert!(value.get("nextCursor").is_none());
    }
}
