//! JSON snapshots of the full substrate state.

use std::collections::BTreeMap;
use std::io::Write;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{PeltaError, Result};
use crate::storage::{Storage, StorageOutput, read_to_string};
use crate::store::key::Key;
use crate::store::wal::SeqNumber;
use crate::store::{EngineState, StoreData, StoreDef};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const SNAPSHOT_TEMP_PREFIX: &str = "snapshot";
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Snapshot {
    pub(crate) format: u32,
    pub(crate) version: u32,
    #[serde(default)]
    pub(crate) last_seq: SeqNumber,
    #[serde(default)]
    pub(crate) stores: Vec<StoreSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoreSnapshot {
    pub(crate) def: StoreDef,
    pub(crate) next_id: i64,
    #[serde(default)]
    pub(crate) rows: Vec<(Key, JsonValue)>,
}

impl Snapshot {
    pub(crate) fn capture(state: &EngineState) -> Self {
        let stores = state
            .stores
            .values()
            .map(|data| StoreSnapshot {
                def: data.def.clone(),
                next_id: data.next_id,
                rows: data
                    .rows
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect();

        Snapshot {
            format: SNAPSHOT_FORMAT_VERSION,
            version: state.version,
            last_seq: state.last_seq,
            stores,
        }
    }

    pub(crate) fn restore(self) -> EngineState {
        let mut stores = BTreeMap::new();
        for store in self.stores {
            let mut data = StoreData::new(store.def);
            data.next_id = store.next_id;
            for (key, value) in store.rows {
                data.put(key, value);
            }
            stores.insert(data.def.name.clone(), data);
        }

        EngineState {
            version: self.version,
            stores,
            last_seq: self.last_seq,
            commits_since_checkpoint: 0,
        }
    }
}

pub(crate) fn load(storage: &dyn Storage) -> Result<Option<Snapshot>> {
    if !storage.file_exists(SNAPSHOT_FILE) {
        return Ok(None);
    }
    let text = read_to_string(storage, SNAPSHOT_FILE)?;
    Ok(Some(serde_json::from_str(&text)?))
}

/// Write the snapshot to a temporary file, then move it into place.
pub(crate) fn write(storage: &dyn Storage, snapshot: &Snapshot) -> Result<()> {
    let bytes = serde_json::to_vec(snapshot)?;
    let (temp_name, mut output) = storage.create_temp_output(SNAPSHOT_TEMP_PREFIX)?;
    let written = output
        .write_all(&bytes)
        .map_err(PeltaError::from)
        .and_then(|_| output.flush_and_sync())
        .and_then(|_| output.close());

    if let Err(e) = written {
        drop(output);
        let _ = storage.delete_file(&temp_name);
        return Err(e);
    }

    storage.rename_file(&temp_name, SNAPSHOT_FILE)?;
    storage.sync()
}
