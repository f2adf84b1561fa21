//! Scrape configuration entries. Each entry populates exactly one backend
//! section; which one decides the backend that reads it.

use crate::api::LabelSet;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScrapeConfig {
    pub job_name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub static_configs: Vec<StaticConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub journal: Option<JournalConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub syslog: Option<SyslogConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gcplog: Option<GcplogConfig>,

    #[serde(
        default,
        rename = "loki_push_api",
        skip_serializing_if = "Option::is_none"
    )]
    pub push: Option<PushConfig>,
}

impl ScrapeConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    pub fn has_service_discovery_config(&self) -> bool {
        !self.static_configs.is_empty()
    }

    /// Names of the backend sections this entry populates.
    pub fn populated_sections(&self) -> Vec<&'static str> {
        let mut sections = Vec::new();
        if self.has_service_discovery_config() {
            sections.push("static_configs");
        }
        if self.journal.is_some() {
            sections.push("journal");
        }
        if self.syslog.is_some() {
            sections.push("syslog");
        }
        if self.gcplog.is_some() {
            sections.push("gcplog");
        }
        if self.push.is_some() {
            sections.push("loki_push_api");
        }
        sections
    }

    /// Static labels of the first static config, used by single-stream mode.
    pub fn first_static_labels(&self) -> Option<&LabelSet> {
        self.static_configs.first().map(|sc| &sc.labels)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticConfig {
    #[serde(default)]
    pub targets: Vec<String>,

    #[serde(default)]
    pub labels: LabelSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Oldest entry to read on first start, in journalctl `--since` syntax.
    #[serde(default)]
    pub max_age: Option<String>,

    /// Journal directory; the system journal when unset.
    #[serde(default)]
    pub path: Option<String>,

    /// Ship the full JSON record instead of just `MESSAGE`.
    #[serde(default)]
    pub json: bool,

    #[serde(default)]
    pub labels: LabelSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyslogConfig {
    pub listen_address: String,

    #[serde(default)]
    pub labels: LabelSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcplogConfig {
    pub project_id: String,
    pub subscription: String,

    /// Local address receiving the subscription's exported log entries.
    pub listen_address: String,

    #[serde(default)]
    pub use_incoming_timestamp: bool,

    #[serde(default)]
    pub labels: LabelSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushConfig {
    pub listen_address: String,

    #[serde(default)]
    pub use_incoming_timestamp: bool,

    #[serde(default)]
    pub labels: LabelSet,
}
