//! One constructor per backend kind.

use crate::api::SharedEntryHandler;
use crate::config::{ScrapeConfig, TargetConfig};
use crate::metrics::{FileMetrics, GcplogMetrics, SyslogMetrics};
use crate::positions::Positions;
use crate::targets::file::FileTargetManager;
use crate::targets::gcplog::GcplogTargetManager;
use crate::targets::journal::JournalTargetManager;
use crate::targets::push::PushTargetManager;
use crate::targets::stdin::StdinTargetManager;
use crate::targets::syslog::SyslogTargetManager;
use crate::targets::TargetManager;
use crate::Result;
use tokio_util::sync::CancellationToken;

/// Builds backend managers. `TargetManagers` calls each method at most once,
/// with every config of that kind.
pub trait ManagerFactory {
    fn file(
        &self,
        metrics: FileMetrics,
        positions: Positions,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
        target_config: &TargetConfig,
    ) -> Result<Box<dyn TargetManager>>;

    fn journal(
        &self,
        positions: Positions,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>>;

    fn syslog(
        &self,
        metrics: SyslogMetrics,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>>;

    fn gcplog(
        &self,
        metrics: GcplogMetrics,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>>;

    fn push(
        &self,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>>;

    /// Single-stream mode; `shutdown` is cancelled when the stream ends.
    fn stdin(
        &self,
        shutdown: CancellationToken,
        handler: SharedEntryHandler,
        configs: &[ScrapeConfig],
    ) -> Result<Box<dyn TargetManager>>;
}

/// Factory wiring the backends shipped with this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinFactory;

impl ManagerFactory for BuiltinFactory {
    fn file(
        &self,
        metrics: FileMetrics,
        positions: Positions,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
        target_config: &TargetConfig,
    ) -> Result<Box<dyn TargetManager>> {
        let manager = FileTargetManager::new(metrics, positions, handler, configs, target_config)?;
        Ok(Box::new(manager))
    }

    fn journal(
        &self,
        positions: Positions,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>> {
        Ok(Box::new(JournalTargetManager::new(positions, handler, configs)?))
    }

    fn syslog(
        &self,
        metrics: SyslogMetrics,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>> {
        Ok(Box::new(SyslogTargetManager::new(metrics, handler, configs)?))
    }

    fn gcplog(
        &self,
        metrics: GcplogMetrics,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>> {
        Ok(Box::new(GcplogTargetManager::new(metrics, handler, configs)?))
    }

    fn push(
        &self,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Box<dyn TargetManager>> {
        Ok(Box::new(PushTargetManager::new(handler, configs)?))
    }

    fn stdin(
        &self,
        shutdown: CancellationToken,
        handler: SharedEntryHandler,
        configs: &[ScrapeConfig],
    ) -> Result<Box<dyn TargetManager>> {
        Ok(Box::new(StdinTargetManager::new(shutdown, handler, configs)?))
    }
}
