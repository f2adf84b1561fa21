//! Cloud log export receiver.
//!
//! Each line is one exported `LogEntry` as delivered by the subscription. The
//! whole message is shipped as the entry line; the resource type becomes a
//! label.

use crate::api::{merge_labels, Entry, LabelSet, SharedEntryHandler};
use crate::config::{GcplogConfig, ScrapeConfig};
use crate::metrics::GcplogMetrics;
use crate::targets::listener::{LineHandler, LineListener};
use crate::targets::{Target, TargetManager, TargetType, TargetsByJob};
use crate::{LogshipError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LogEntry {
    #[serde(default)]
    resource: Option<Resource>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    #[serde(rename = "type", default)]
    resource_type: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
}

fn format_entry(
    raw: &str,
    config: &GcplogConfig,
) -> std::result::Result<Entry, serde_json::Error> {
    let parsed: LogEntry = serde_json::from_str(raw)?;

    let mut labels = LabelSet::new();
    if let Some(resource) = &parsed.resource {
        if !resource.resource_type.is_empty() {
            labels.insert("resource_type".to_string(), resource.resource_type.clone());
        }
        if let Some(name) = resource.labels.get("backend_service_name") {
            labels.insert("backend_service_name".to_string(), name.clone());
        }
    }
    let labels = merge_labels(&labels, &config.labels);

    let mut entry = Entry::new(labels, raw);
    if config.use_incoming_timestamp {
        if let Some(ts) = parsed.timestamp {
            entry.timestamp = ts;
        }
    }
    Ok(entry)
}

struct GcplogHandler {
    config: GcplogConfig,
    metrics: GcplogMetrics,
    handler: SharedEntryHandler,
}

impl LineHandler for GcplogHandler {
    fn on_line(&self, line: &str, _peer: SocketAddr) {
        match format_entry(line, &self.config) {
            Ok(entry) => {
                self.metrics
                    .entries
                    .with_label_values(&[self.config.project_id.as_str()])
                    .inc();
                self.handler.handle(entry);
            }
            Err(e) => {
                self.metrics
                    .parsing_errors
                    .with_label_values(&[self.config.project_id.as_str(), "json"])
                    .inc();
                debug!("dropping gcplog message: {}", e);
            }
        }
    }
}

struct GcplogTarget {
    job_name: String,
    config: GcplogConfig,
    listener: LineListener,
}

impl GcplogTarget {
    fn snapshot(&self) -> Target {
        Target::new(
            TargetType::Gcplog,
            format!(
                "projects/{}/subscriptions/{}",
                self.config.project_id, self.config.subscription
            ),
        )
        .with_labels(self.config.labels.clone())
        .with_discovered_labels(self.config.labels.clone())
        .with_ready(self.listener.is_running())
        .with_detail("listen_address", self.listener.local_addr())
        .with_detail("project_id", &self.config.project_id)
    }
}

pub struct GcplogTargetManager {
    targets: Vec<GcplogTarget>,
}

impl GcplogTargetManager {
    pub fn new(
        metrics: GcplogMetrics,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Self> {
        let mut targets = Vec::with_capacity(configs.len());

        for cfg in configs {
            let gcplog = cfg.gcplog.ok_or_else(|| {
                LogshipError::ConfigError(format!("job {} has no gcplog section", cfg.job_name))
            })?;
            validate(&cfg.job_name, &gcplog)?;

            let line_handler = Arc::new(GcplogHandler {
                config: gcplog.clone(),
                metrics: metrics.clone(),
                handler: handler.clone(),
            });
            let listener = LineListener::bind("gcplog", &gcplog.listen_address, line_handler)?;
            info!(
                job = %cfg.job_name,
                project = %gcplog.project_id,
                "gcplog target receiving {} on {}",
                gcplog.subscription,
                listener.local_addr()
            );

            targets.push(GcplogTarget {
                job_name: cfg.job_name,
                config: gcplog,
                listener,
            });
        }

        Ok(Self { targets })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.targets.iter().map(|t| t.listener.local_addr()).collect()
    }
}

fn validate(job_name: &str, config: &GcplogConfig) -> Result<()> {
    if config.project_id.is_empty() {
        return Err(LogshipError::ConfigError(format!(
            "gcplog job {} requires project_id",
            job_name
        )));
    }
    if config.subscription.is_empty() {
        return Err(LogshipError::ConfigError(format!(
            "gcplog job {} requires subscription",
            job_name
        )));
    }
    Ok(())
}

impl TargetManager for GcplogTargetManager {
    fn ready(&self) -> bool {
        self.targets.iter().any(|t| t.listener.is_running())
    }

    fn active_targets(&self) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for target in self.targets.iter().filter(|t| t.listener.is_running()) {
            result
                .entry(target.job_name.clone())
                .or_default()
                .push(target.snapshot());
        }
        result
    }

    fn all_targets(&self) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for target in &self.targets {
            result
                .entry(target.job_name.clone())
                .or_default()
                .push(target.snapshot());
        }
        result
    }

    fn stop(self: Box<Self>) {
        for mut target in self.targets {
            target.listener.stop();
        }
    }
}
