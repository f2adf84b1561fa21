//! Syslog receiver. Messages are newline-framed over TCP and forwarded
//! verbatim; the line content is not parsed.

use crate::api::{Entry, LabelSet, SharedEntryHandler};
use crate::config::{ScrapeConfig, SyslogConfig};
use crate::metrics::SyslogMetrics;
use crate::targets::listener::{LineHandler, LineListener};
use crate::targets::{Target, TargetManager, TargetType, TargetsByJob};
use crate::{LogshipError, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

struct SyslogHandler {
    labels: LabelSet,
    metrics: SyslogMetrics,
    handler: SharedEntryHandler,
}

impl LineHandler for SyslogHandler {
    fn on_line(&self, line: &str, _peer: SocketAddr) {
        self.metrics.entries.inc();
        self.handler.handle(Entry::new(self.labels.clone(), line));
    }

    fn on_connect(&self, peer: SocketAddr) {
        self.metrics.connections.inc();
        debug!("syslog connection from {}", peer);
    }

    fn on_error(&self, peer: SocketAddr, err: &std::io::Error) {
        self.metrics.connection_errors.inc();
        debug!("syslog connection from {} failed: {}", peer, err);
    }
}

struct SyslogTarget {
    job_name: String,
    config: SyslogConfig,
    listener: LineListener,
}

impl SyslogTarget {
    fn snapshot(&self) -> Target {
        Target::new(TargetType::Syslog, self.listener.local_addr().to_string())
            .with_labels(self.config.labels.clone())
            .with_discovered_labels(self.config.labels.clone())
            .with_ready(self.listener.is_running())
            .with_detail("connections", self.listener.connections())
            .with_detail("oversized_lines", self.listener.oversized())
    }
}

pub struct SyslogTargetManager {
    targets: Vec<SyslogTarget>,
}

impl SyslogTargetManager {
    pub fn new(
        metrics: SyslogMetrics,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Self> {
        let mut targets = Vec::with_capacity(configs.len());

        for cfg in configs {
            let syslog = cfg.syslog.ok_or_else(|| {
                LogshipError::ConfigError(format!("job {} has no syslog section", cfg.job_name))
            })?;

            let line_handler = Arc::new(SyslogHandler {
                labels: syslog.labels.clone(),
                metrics: metrics.clone(),
                handler: handler.clone(),
            });

            // Listeners bound so far are closed by their Drop if this fails.
            let listener = LineListener::bind("syslog", &syslog.listen_address, line_handler)?;
            info!(
                job = %cfg.job_name,
                "syslog target listening on {}",
                listener.local_addr()
            );

            targets.push(SyslogTarget {
                job_name: cfg.job_name,
                config: syslog,
                listener,
            });
        }

        Ok(Self { targets })
    }

    /// Bound addresses, in config order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.targets.iter().map(|t| t.listener.local_addr()).collect()
    }
}

impl TargetManager for SyslogTargetManager {
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
