//! Per-backend metric sets.
//!
//! Each set registers its collectors under fixed names when created, so it
//! must be created at most once per registry. A second `new` on the same
//! registry fails with `AlreadyReg` until the first set is unregistered.

use crate::Result;
use prometheus::core::Collector;
use prometheus::{Gauge, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};
use tracing::debug;

/// Register every collector or none of them.
fn register_all(
    registry: &Registry,
    collectors: impl Fn() -> Vec<Box<dyn Collector>>,
) -> Result<()> {
    for (registered, collector) in collectors().into_iter().enumerate() {
        if let Err(e) = registry.register(collector) {
            unregister_all(registry, collectors().into_iter().take(registered).collect());
            return Err(e.into());
        }
    }
    Ok(())
}

fn unregister_all(registry: &Registry, collectors: Vec<Box<dyn Collector>>) {
    for collector in collectors {
        if let Err(e) = registry.unregister(collector) {
            debug!("collector was not registered: {}", e);
        }
    }
}

#[derive(Clone)]
pub struct FileMetrics {
    pub read_bytes: IntGaugeVec,
    pub read_lines: IntCounterVec,
    pub files_active: Gauge,
}

impl FileMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let read_bytes = IntGaugeVec::new(
            Opts::new("logship_read_bytes_total", "Number of bytes read."),
            &["path"],
        )?;
        let read_lines = IntCounterVec::new(
            Opts::new("logship_read_lines_total", "Number of lines read."),
            &["path"],
        )?;
        let files_active = Gauge::new(
            "logship_files_active_total",
            "Number of active files.",
        )?;

        let metrics = Self {
            read_bytes,
            read_lines,
            files_active,
        };
        register_all(registry, || metrics.collectors())?;
        Ok(metrics)
    }

    pub fn unregister(&self, registry: &Registry) {
        unregister_all(registry, self.collectors());
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.read_bytes.clone()),
            Box::new(self.read_lines.clone()),
            Box::new(self.files_active.clone()),
        ]
    }
}

#[derive(Clone)]
pub struct SyslogMetrics {
    pub entries: IntCounter,
    pub connections: IntCounter,
    pub connection_errors: IntCounter,
}

impl SyslogMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let entries = IntCounter::new(
            "logship_syslog_target_entries_total",
            "Total number of successful entries sent to the syslog target.",
        )?;
        let connections = IntCounter::new(
            "logship_syslog_target_connections_total",
            "Total number of connections accepted by the syslog target.",
        )?;
        let connection_errors = IntCounter::new(
            "logship_syslog_target_connection_errors_total",
            "Total number of connection read errors in the syslog target.",
        )?;

        let metrics = Self {
            entries,
            connections,
            connection_errors,
        };
        register_all(registry, || metrics.collectors())?;
        Ok(metrics)
    }

    pub fn unregister(&self, registry: &Registry) {
        unregister_all(registry, self.collectors());
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.entries.clone()),
            Box::new(self.connections.clone()),
            Box::new(self.connection_errors.clone()),
        ]
    }
}

#[derive(Clone)]
pub struct GcplogMetrics {
    pub entries: IntCounterVec,
    pub parsing_errors: IntCounterVec,
}

impl GcplogMetrics {
    pub fn new(registry: &Registry) -> Result<Self> {
        let entries = IntCounterVec::new(
            Opts::new(
                "logship_gcplog_target_entries_total",
                "Number of successful entries sent to the gcplog target.",
            ),
            &["project"],
        )?;
        let parsing_errors = IntCounterVec::new(
            Opts::new(
                "logship_gcplog_parsing_errors_total",
                "Total number of parsing errors while receiving gcplog messages.",
            ),
            &["project", "reason"],
        )?;

        let metrics = Self {
            entries,
            parsing_errors,
        };
        register_all(registry, || metrics.collectors())?;
        Ok(metrics)
    }

    pub fn unregister(&self, registry: &Registry) {
        unregister_all(registry, self.collectors());
    }

    fn collectors(&self) -> Vec<Box<dyn Collector>> {
        vec![
            Box::new(self.entries.clone()),
            Box::new(self.parsing_errors.clone()),
        ]
    }
}
