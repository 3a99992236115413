//! Authorization hooks and field transforms around the read/write path.
//!
//! Both are optional. With no hooks registered every operation is allowed,
//! and the default transform leaves records untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{PeltaError, Result};
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Read,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Insert => "Insert",
            Operation::Update => "Update",
            Operation::Delete => "Delete",
            Operation::Read => "Read",
        };
        f.write_str(name)
    }
}

/// Decides whether an operation may proceed.
///
/// `data` is the incoming record for inserts and updates, the stored record
/// for deletes, and `None` for reads.
pub trait AuthHook: Send + Sync {
    fn authorize(&self, operation: Operation, table: &str, data: Option<&Record>) -> bool;
}

impl<F> AuthHook for F
where
    F: Fn(Operation, &str, Option<&Record>) -> bool + Send + Sync,
{
    fn authorize(&self, operation: Operation, table: &str, data: Option<&Record>) -> bool {
        self(operation, table, data)
    }
}

/// Named authorization hooks; every hook must allow an operation.
#[derive(Default)]
pub struct AuthRegistry {
    hooks: RwLock<BTreeMap<String, Arc<dyn AuthHook>>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, replacing any hook with the same name.
    pub fn register<H: AuthHook + 'static>(&self, name: &str, hook: H) {
        self.hooks.write().insert(name.to_string(), Arc::new(hook));
    }

    pub fn remove(&self, name: &str) -> bool {
        self.hooks.write().remove(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }

    pub fn check(&self, operation: Operation, table: &str, data: Option<&Record>) -> Result<()> {
        let hooks: Vec<Arc<dyn AuthHook>> = self.hooks.read().values().cloned().collect();
        for hook in hooks {
            if !hook.authorize(operation, table, data) {
                return Err(PeltaError::unauthorized(operation.to_string(), table));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("hooks", &self.hooks.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Reversible per-field transform applied before storage and after reads.
///
/// Tokens and embeddings are always derived from the untransformed record.
pub trait FieldTransform: Send + Sync {
    fn encode(&self, _table: &str, record: Record) -> Result<Record> {
        Ok(record)
    }

    fn decode(&self, _table: &str, record: Record) -> Result<Record> {
        Ok(record)
    }

    /// Whether stored values equal the caller's values.
    fn is_identity(&self) -> bool {
        false
    }
}

/// The identity transform.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTransform;

impl FieldTransform for NoopTransform {
    fn is_identity(&self) -> bool {
        true
    }
}
