//! Entry types shared between backends and the downstream sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

/// Ordered label names to values.
pub type LabelSet = BTreeMap<String, String>;

/// One log line read from a source, with the labels it is shipped under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

impl Entry {
    pub fn new(labels: LabelSet, line: impl Into<String>) -> Self {
        Self {
            labels,
            timestamp: Utc::now(),
            line: line.into(),
        }
    }
}

/// Sink for entries produced by every backend.
///
/// Backends call `handle` from their own reader tasks, so implementations
/// must be cheap and must not block on the consumer.
pub trait EntryHandler: Send + Sync {
    fn handle(&self, entry: Entry);
}

pub type SharedEntryHandler = Arc<dyn EntryHandler>;

impl EntryHandler for UnboundedSender<Entry> {
    fn handle(&self, entry: Entry) {
        if self.send(entry).is_err() {
            debug!("entry receiver dropped, discarding entry");
        }
    }
}

/// Handler that keeps every entry in memory.
#[derive(Debug, Default, Clone)]
pub struct CollectingHandler {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl CollectingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntryHandler for CollectingHandler {
    fn handle(&self, entry: Entry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }
}

/// Merge `extra` into `base`; keys in `extra` win.
pub fn merge_labels(base: &LabelSet, extra: &LabelSet) -> LabelSet {
    let mut merged = base.clone();
    merged.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Drop reserved `__`-prefixed labels before shipping.
pub fn public_labels(labels: &LabelSet) -> LabelSet {
    labels
        .iter()
        .filter(|(k, _)| !k.starts_with("__"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
