//! Push receiver: clients send one JSON entry per line.
//!
//! ```json
//! {"labels": {"app": "api"}, "line": "started", "timestamp": "2021-05-06T10:11:12Z"}
//! ```

use crate::api::{merge_labels, Entry, LabelSet, SharedEntryHandler};
use crate::config::{PushConfig, ScrapeConfig};
use crate::targets::listener::{LineHandler, LineListener};
use crate::targets::{Target, TargetManager, TargetType, TargetsByJob};
use crate::{LogshipError, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct PushedEntry {
    #[serde(default)]
    labels: LabelSet,
    line: String,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

struct PushHandler {
    config: PushConfig,
    handler: SharedEntryHandler,
    rejected: AtomicU64,
}

impl PushHandler {
    fn to_entry(&self, raw: &str) -> std::result::Result<Entry, serde_json::Error> {
        let pushed: PushedEntry = serde_json::from_str(raw)?;

        // Configured labels override what the client sent.
        let labels = merge_labels(&pushed.labels, &self.config.labels);
        let mut entry = Entry::new(labels, pushed.line);
        if self.config.use_incoming_timestamp {
            if let Some(ts) = pushed.timestamp {
                entry.timestamp = ts;
            }
        }
        Ok(entry)
    }
}

impl LineHandler for PushHandler {
    fn on_line(&self, line: &str, peer: SocketAddr) {
        match self.to_entry(line) {
            Ok(entry) => self.handler.handle(entry),
            Err(e) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("rejecting push from {}: {}", peer, e);
            }
        }
    }
}

struct PushTarget {
    job_name: String,
    labels: LabelSet,
    handler: Arc<PushHandler>,
    listener: LineListener,
}

impl PushTarget {
    fn snapshot(&self) -> Target {
        Target::new(TargetType::Push, self.listener.local_addr().to_string())
            .with_labels(self.labels.clone())
            .with_discovered_labels(self.labels.clone())
            .with_ready(self.listener.is_running())
            .with_detail("connections", self.listener.connections())
            .with_detail("rejected", self.handler.rejected.load(Ordering::Relaxed))
    }
}

pub struct PushTargetManager {
    targets: Vec<PushTarget>,
}

impl PushTargetManager {
    pub fn new(handler: SharedEntryHandler, configs: Vec<ScrapeConfig>) -> Result<Self> {
        let mut targets = Vec::with_capacity(configs.len());

        for cfg in configs {
            let push = cfg.push.ok_or_else(|| {
                LogshipError::ConfigError(format!(
                    "job {} has no loki_push_api section",
                    cfg.job_name
                ))
            })?;

            let push_handler = Arc::new(PushHandler {
                config: push.clone(),
                handler: handler.clone(),
                rejected: AtomicU64::new(0),
            });
            let listener = LineListener::bind("push", &push.listen_address, push_handler.clone())?;
            info!(job = %cfg.job_name, "push target listening on {}", listener.local_addr());

            targets.push(PushTarget {
                job_name: cfg.job_name,
                labels: push.labels,
                handler: push_handler,
                listener,
            });
        }

        Ok(Self { targets })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.targets.iter().map(|t| t.listener.local_addr()).collect()
    }
}

impl TargetManager for PushTargetManager {
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
