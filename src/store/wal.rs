//! Write-ahead log for committed transactions.
//!
//! Each committed transaction becomes one line: the CRC32 of the JSON body in
//! hex, a tab, then the JSON-encoded [`WalRecord`]. Replay stops at the first
//! line that fails to parse or verify, which discards a torn tail write.

use std::io::Write;

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{PeltaError, Result};
use crate::storage::{Storage, StorageOutput, read_to_bytes};
use crate::store::key::Key;

pub const WAL_FILE: &str = "wal.log";

pub type SeqNumber = u64;

/// One mutation inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WalOp {
    Clear { store: String },
    Put { store: String, key: Key, value: JsonValue },
    Delete { store: String, key: Key },
    NextId { store: String, next_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    pub seq: SeqNumber,
    pub ops: Vec<WalOp>,
}

fn encode_line(record: &WalRecord) -> Result<String> {
    let body = serde_json::to_string(record)?;
    let crc = crc32fast::hash(body.as_bytes());
    Ok(format!("{crc:08x}\t{body}\n"))
}

fn decode_line(line: &[u8]) -> Option<WalRecord> {
    let line = std::str::from_utf8(line).ok()?;
    let (crc_hex, body) = line.split_once('\t')?;
    let expected = u32::from_str_radix(crc_hex, 16).ok()?;
    if crc32fast::hash(body.as_bytes()) != expected {
        return None;
    }
    serde_json::from_str(body).ok()
}

/// Append one record and make it durable before returning.
pub fn append(storage: &dyn Storage, record: &WalRecord) -> Result<()> {
    let line = encode_line(record)?;
    let mut output = storage.create_output_append(WAL_FILE)?;
    output.write_all(line.as_bytes())?;
    output.flush_and_sync()?;
    output.close()
}

#[derive(Debug, Default)]
pub struct WalContents {
    pub records: Vec<WalRecord>,
    /// Set when replay stopped before the end of the file.
    pub corrupt_tail: bool,
}

/// Read every intact record, in order.
pub fn read_all(storage: &dyn Storage) -> Result<WalContents> {
    let mut contents = WalContents::default();
    if !storage.file_exists(WAL_FILE) {
        return Ok(contents);
    }

    // A torn write may end inside a multibyte character, so lines are
    // decoded one at a time.
    let bytes = read_to_bytes(storage, WAL_FILE)?;
    for (line_no, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        match decode_line(line) {
            Some(record) => contents.records.push(record),
            None => {
                warn!("write-ahead log is corrupt at line {}; ignoring the rest", line_no + 1);
                contents.corrupt_tail = true;
                break;
            }
        }
    }
    Ok(contents)
}

/// Drop every record; called after a snapshot has been written.
pub fn truncate(storage: &dyn Storage) -> Result<()> {
    let mut output = storage.create_output(WAL_FILE)?;
    output.flush_and_sync()?;
    output
        .close()
        .map_err(|e| PeltaError::storage(format!("Failed to truncate write-ahead log: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::read_to_string;
    use serde_json::json;

    fn record(seq: SeqNumber) -> WalRecord {
        WalRecord {
            seq,
            ops: vec![WalOp::Put {
                store: "messages".into(),
                key: Key::Int(seq as i64),
                value: json!({"id": seq, "text": "hi"}),
            }],
        }
    }

    #[test]
    fn test_append_and_read() {
        let storage = MemoryStorage::new_default();
        append(&storage, &record(1)).unwrap();
        append(&storage, &record(2)).unwrap();

        let contents = read_all(&storage).unwrap();
        assert_eq!(contents.records, vec![record(1), record(2)]);
        assert!(!contents.corrupt_tail);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let storage = MemoryStorage::new_default();
        append(&storage, &record(1)).unwrap();
        append(&storage, &record(2)).unwrap();

        let mut bytes = read_to_string(&storage, WAL_FILE).unwrap().into_bytes();
        bytes.truncate(bytes.len() - 5);
        storage.put_bytes(WAL_FILE, bytes);

        let contents = read_all(&storage).unwrap();
        assert_eq!(contents.records, vec![record(1)]);
        assert!(contents.corrupt_tail);
    }

    #[test]
    fn test_tear_inside_multibyte_character() {
        let storage = MemoryStorage::new_default();
        append(&storage, &record(1)).unwrap();
        let torn = WalRecord {
            seq: 2,
            ops: vec![WalOp::Put {
                store: "messages".into(),
                key: Key::Int(2),
                value: json!({"id": 2, "text": "h\u{e9}\u{e9}"}),
            }],
        };
        append(&storage, &torn).unwrap();

        let mut bytes = read_to_bytes(&storage, WAL_FILE).unwrap();
        let last = bytes.iter().rposition(|b| *b == 0xc3).unwrap();
        bytes.truncate(last + 1);
        assert!(String::from_utf8(bytes.clone()).is_err());
        storage.put_bytes(WAL_FILE, bytes);

        let contents = read_all(&storage).unwrap();
        assert_eq!(contents.records, vec![record(1)]);
        assert!(contents.corrupt_tail);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let storage = MemoryStorage::new_default();
        append(&storage, &record(1)).unwrap();
        let text = read_to_string(&storage, WAL_FILE).unwrap();
        let tampered = text.replace("\"hi\"", "\"ho\"");
        storage.put_bytes(WAL_FILE, tampered.into_bytes());

        assert!(read_all(&storage).unwrap().records.is_empty());
    }

    #[test]
    fn test_truncate() {
        let storage = MemoryStorage::new_default();
        append(&storage, &record(1)).unwrap();
        truncate(&storage).unwrap();
        assert!(read_all(&storage).unwrap().records.is_empty());
    }
}
