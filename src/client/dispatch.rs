//! Subscription dispatch table
//!
//! Maps topic filters to per-filter handlers in registration order. Inbound
//! publishes are matched against every filter; messages no filter handles
//! fall through to the global event handler. Handlers run on the dispatch
//! task, never on the receiver, so slow application code cannot stall the
//! wire.

use std::sync::Arc;

use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::message::Message;
use crate::protocol::QoS;
use crate::topic::topic_matches_filter;

/// Per-filter message handler
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

struct Entry {
    filter: String,
    qos: QoS,
    handler: Option<MessageHandler>,
}

/// Ordered filter -> handler table
pub(crate) struct Dispatcher {
    entries: RwLock<Vec<Entry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Register a filter, replacing any existing registration in place
    pub fn insert(&self, filter: &str, qos: QoS, handler: Option<MessageHandler>) {
        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.filter == filter) {
            entry.qos = qos;
            entry.handler = handler;
        } else {
            entries.push(Entry {
                filter: filter.to_string(),
                qos,
                handler,
            });
        }
    }

    /// Remove a filter and its handler
    pub fn remove(&self, filter: &str) {
        self.entries.write().retain(|e| e.filter != filter);
    }

    /// Drop the handlers for the given filters, keeping the subscriptions.
    /// Used when a subscribe fails after optimistic registration; matching
    /// messages fall through to the global handler afterwards.
    pub fn remove_handlers(&self, filters: &[String]) {
        let mut entries = self.entries.write();
        for entry in entries.iter_mut() {
            if filters.iter().any(|f| f == &entry.filter) {
                entry.handler = None;
            }
        }
    }

    /// The maximum QoS registered for a filter
    pub fn subscribed_qos(&self, filter: &str) -> Option<QoS> {
        self.entries
            .read()
            .iter()
            .find(|e| e.filter == filter)
            .map(|e| e.qos)
    }

    /// Handlers for every filter matching the topic, in registration order
    pub fn handlers_for(&self, topic: &str) -> SmallVec<[MessageHandler; 4]> {
        let entries = self.entries.read();
        let mut matched = SmallVec::new();
        for entry in entries.iter() {
            if topic_matches_filter(topic, &entry.filter) {
                if let Some(ref handler) = entry.handler {
                    matched.push(handler.clone());
                }
            }
        }
        matched
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }
}
