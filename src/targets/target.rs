use crate::api::LabelSet;
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    File,
    Journal,
    Syslog,
    Gcplog,
    Push,
    Stdin,
}

/// Read-only snapshot of one source a backend is (or was) reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    pub target_type: TargetType,
    /// Path, listen address, journal cursor key: whatever identifies the source.
    pub source: String,
    pub labels: LabelSet,
    pub discovered_labels: LabelSet,
    pub ready: bool,
    pub details: BTreeMap<String, String>,
}

impl Target {
    pub fn new(target_type: TargetType, source: impl Into<String>) -> Self {
        Self {
            target_type,
            source: source.into(),
            labels: LabelSet::new(),
            discovered_labels: LabelSet::new(),
            ready: false,
            details: BTreeMap::new(),
        }
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_discovered_labels(mut self, labels: LabelSet) -> Self {
        self.discovered_labels = labels;
        self
    }

    pub fn with_ready(mut self, ready: bool) -> Self {
        self.ready = ready;
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl ToString) -> Self {
        self.details.insert(key.to_string(), value.to_string());
        self
    }
}
