//! Per-table inverted index: token → set of record ids.
//!
//! Entries live in the table's `_ii_` store keyed by token. An entry never
//! holds an empty id set; the last removal deletes it.

use std::collections::{BTreeMap, BTreeSet};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::analysis::tokenize;
use crate::error::Result;
use crate::interceptor::FieldTransform;
use crate::record::{Record, Value};
use crate::schema::{StoreName, StoreRole, TableDefinition};
use crate::store::{Key, ReadView, Transaction};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Posting {
    pub token: String,
    pub ids: BTreeSet<Key>,
}

impl Posting {
    fn decode(value: &serde_json::Value) -> Option<Posting> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Distinct tokens of every searchable string field of `record`.
pub fn record_tokens(definition: &TableDefinition, record: &Record) -> BTreeSet<String> {
    let mut tokens = BTreeSet::new();
    for field in definition.searchable() {
        if let Some(Value::String(text)) = record.get(field) {
            tokens.extend(tokenize(text));
        }
    }
    tokens
}

/// Stages posting-list maintenance for one table inside a transaction.
pub struct InvertedIndexWriter<'t, 'e> {
    tx: &'t mut Transaction<'e>,
    store: String,
}

impl<'t, 'e> InvertedIndexWriter<'t, 'e> {
    pub fn new(tx: &'t mut Transaction<'e>, table: &str) -> Self {
        InvertedIndexWriter {
            tx,
            store: StoreName::of(table, StoreRole::InvertedIndex),
        }
    }

    fn load(&self, token: &str) -> Result<Posting> {
        let existing = self
            .tx
            .get(&self.store, &Key::from(token))?
            .and_then(|value| Posting::decode(&value));
        Ok(existing.unwrap_or_else(|| Posting {
            token: token.to_string(),
            ids: BTreeSet::new(),
        }))
    }

    fn save(&mut self, posting: Posting) -> Result<()> {
        let key = Key::from(posting.token.as_str());
        if posting.ids.is_empty() {
            self.tx.delete(&self.store, &key)
        } else {
            let value = serde_json::to_value(&posting)?;
            self.tx.put(&self.store, key, value)
        }
    }

    /// Merge `id` into each token's entry.
    pub fn add<'a, I>(&mut self, id: &Key, tokens: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for token in tokens {
            let mut posting = self.load(token)?;
            if posting.ids.insert(id.clone()) {
                self.save(posting)?;
            }
        }
        Ok(())
    }

    /// Remove `id` from each token's entry, pruning emptied entries.
    pub fn remove<'a, I>(&mut self, id: &Key, tokens: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for token in tokens {
            let mut posting = self.load(token)?;
            if posting.ids.remove(id) {
                self.save(posting)?;
            }
        }
        Ok(())
    }

    /// Apply the symmetric difference between old and new token sets.
    pub fn replace(
        &mut self,
        id: &Key,
        old_tokens: &BTreeSet<String>,
        new_tokens: &BTreeSet<String>,
    ) -> Result<()> {
        self.remove(id, old_tokens.difference(new_tokens))?;
        self.add(id, new_tokens.difference(old_tokens))
    }

    /// Discard every entry and re-tokenize the table's records.
    ///
    /// Stored records are decoded through `transform` first so tokens come
    /// from the plaintext.
    pub fn rebuild(
        &mut self,
        table: &str,
        definition: &TableDefinition,
        transform: &dyn FieldTransform,
    ) -> Result<usize> {
        self.tx.clear(&self.store)?;
        let rows = self.tx.scan(&StoreName::of(table, StoreRole::Primary))?;

        let mut postings: BTreeMap<String, BTreeSet<Key>> = BTreeMap::new();
        for (id, value) in &rows {
            let record = transform.decode(table, Record::denormalize(value, definition))?;
            for token in record_tokens(definition, &record) {
                postings.entry(token).or_default().insert(id.clone());
            }
        }

        let count = postings.len();
        for (token, ids) in postings {
            self.save(Posting { token, ids })?;
        }
        debug!("rebuilt inverted index for {table}: {count} tokens");
        Ok(count)
    }
}

/// Committed ids for `token`, or an empty set.
pub fn lookup(view: &ReadView<'_>, table: &str, token: &str) -> Result<BTreeSet<Key>> {
    let store = StoreName::of(table, StoreRole::InvertedIndex);
    Ok(view
        .get(&store, &Key::from(token))?
        .and_then(Posting::decode)
        .map(|posting| posting.ids)
        .unwrap_or_default())
}
