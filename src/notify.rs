//! Change notification after committed writes.
//!
//! Subscribers register per table and are called synchronously, in
//! registration order, once the write that produced the event has committed.
//! A panicking subscriber is logged and does not affect the others or the
//! write. Change trackers see every table and are meant for replication
//! consumers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use log::warn;
use parking_lot::RwLock;
use serde::Serialize;

use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// The record after the change; for deletes, the removed record.
    pub record: Record,
    /// The record before an update.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_record: Option<Record>,
}

/// Consumer of every committed change, e.g. a sync queue.
pub trait ChangeTracker: Send + Sync {
    fn track(&self, table: &str, kind: ChangeKind, record: &Record);
}

pub type Subscriber = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

type SubscriberMap = AHashMap<String, Vec<(u64, Subscriber)>>;

/// Handle returned by [`ChangeBus::subscribe`].
///
/// The subscription stays active until [`Subscription::cancel`] is called.
pub struct Subscription {
    subscribers: Weak<RwLock<SubscriberMap>>,
    table: String,
    id: u64,
}

impl Subscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Stop receiving events. Returns false if it was already gone.
    pub fn cancel(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut map = subscribers.write();
        let Some(list) = map.get_mut(&self.table) else {
            return false;
        };
        let before = list.len();
        list.retain(|(id, _)| *id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            map.remove(&self.table);
        }
        removed
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("table", &self.table)
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Default)]
pub struct ChangeBus {
    next_id: AtomicU64,
    subscribers: Arc<RwLock<SubscriberMap>>,
    trackers: RwLock<Vec<Arc<dyn ChangeTracker>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, table: &str, callback: F) -> Subscription
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .write()
            .entry(table.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        Subscription {
            subscribers: Arc::downgrade(&self.subscribers),
            table: table.to_string(),
            id,
        }
    }

    pub fn subscriber_count(&self, table: &str) -> usize {
        self.subscribers.read().get(table).map_or(0, Vec::len)
    }

    pub fn add_tracker(&self, tracker: Arc<dyn ChangeTracker>) {
        self.trackers.write().push(tracker);
    }

    /// Deliver committed events in order.
    pub fn dispatch(&self, events: &[ChangeEvent]) {
        for event in events {
            // Snapshot the list so callbacks may subscribe or cancel.
            let subscribers: Vec<Subscriber> = self
                .subscribers
                .read()
                .get(&event.table)
                .map(|list| list.iter().map(|(_, s)| Arc::clone(s)).collect())
                .unwrap_or_default();

            for subscriber in subscribers {
                if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
                    warn!(
                        "change subscriber for table {} panicked on {:?}",
                        event.table, event.kind
                    );
                }
            }

            let trackers = self.trackers.read().clone();
            for tracker in trackers {
                tracker.track(&event.table, event.kind, &event.record);
            }
        }
    }
}

impl std::fmt::Debug for ChangeBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeBus")
            .field("tables", &self.subscribers.read().len())
            .field("trackers", &self.trackers.read().len())
            .finish()
    }
}
