//! Aggregate over every backend target manager.
//!
//! Construction classifies the scrape configs, provisions the shared position
//! store and per-kind metrics, then builds one manager per populated kind.
//! Any failure aborts construction; managers built earlier in the same call
//! are stopped before the error is returned.

use crate::api::SharedEntryHandler;
use crate::config::{Config, ScrapeConfig};
use crate::metrics::{FileMetrics, GcplogMetrics, SyslogMetrics};
use crate::positions::Positions;
use crate::targets::{
    classify, BuiltinFactory, Groups, Kind, ManagerFactory, TargetManager, TargetsByJob,
};
use crate::{LogshipError, Result};
use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone)]
enum KindMetrics {
    File(FileMetrics),
    Journal,
    Syslog(SyslogMetrics),
    Gcplog(GcplogMetrics),
    Push,
}

impl KindMetrics {
    fn unregister(&self, registry: &Registry) {
        match self {
            KindMetrics::File(metrics) => metrics.unregister(registry),
            KindMetrics::Syslog(metrics) => metrics.unregister(registry),
            KindMetrics::Gcplog(metrics) => metrics.unregister(registry),
            KindMetrics::Journal | KindMetrics::Push => {}
        }
    }
}

/// A populated kind with the shared resources its constructor receives.
struct Planned {
    kind: Kind,
    metrics: KindMetrics,
    configs: Vec<ScrapeConfig>,
}

/// Creates each metrics set once, only for kinds that have configs.
/// On failure the sets created so far are unregistered again.
fn provision(mut groups: Groups, registry: &Registry) -> Result<Vec<Planned>> {
    let mut planned: Vec<Planned> = Vec::with_capacity(groups.len());

    for kind in Kind::ALL {
        let Some(configs) = groups.remove(&kind) else {
            continue;
        };

        let created = match kind {
            Kind::File => FileMetrics::new(registry).map(KindMetrics::File),
            Kind::Journal => Ok(KindMetrics::Journal),
            Kind::Syslog => SyslogMetrics::new(registry).map(KindMetrics::Syslog),
            Kind::Gcplog => GcplogMetrics::new(registry).map(KindMetrics::Gcplog),
            Kind::Push => Ok(KindMetrics::Push),
        };

        let metrics = match created {
            Ok(metrics) => metrics,
            Err(e) => {
                for earlier in &planned {
                    earlier.metrics.unregister(registry);
                }
                return Err(e);
            }
        };

        planned.push(Planned {
            kind,
            metrics,
            configs,
        });
    }

    Ok(planned)
}

struct Backend {
    name: &'static str,
    manager: Box<dyn TargetManager>,
}

/// All running backends plus the position store they share.
pub struct TargetManagers {
    backends: Vec<Backend>,
    positions: Option<Positions>,
}

impl TargetManagers {
    pub fn new(
        config: &Config,
        registry: &Registry,
        handler: SharedEntryHandler,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        Self::with_factory(&BuiltinFactory, config, registry, handler, shutdown)
    }

    pub fn with_factory(
        factory: &dyn ManagerFactory,
        config: &Config,
        registry: &Registry,
        handler: SharedEntryHandler,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        if config.target_config.stdin {
            debug!("configured to read from stdin");
            let manager = factory
                .stdin(shutdown, handler, &config.scrape_configs)
                .map_err(|e| LogshipError::StdinTargetManager(Box::new(e)))?;

            return Ok(Self {
                backends: vec![Backend {
                    name: "stdin",
                    manager,
                }],
                positions: None,
            });
        }

        let groups = classify(&config.scrape_configs)?;
        let positions = Positions::new(&config.positions)?;

        let planned = match provision(groups, registry) {
            Ok(planned) => planned,
            Err(e) => {
                positions.stop();
                return Err(e);
            }
        };

        let provisioned: Vec<KindMetrics> = planned.iter().map(|p| p.metrics.clone()).collect();
        let mut backends: Vec<Backend> = Vec::with_capacity(planned.len());

        for Planned {
            kind,
            metrics,
            configs,
        } in planned
        {
            debug!(kind = %kind, configs = configs.len(), "Constructing target manager");

            let built = match metrics {
                KindMetrics::File(metrics) => factory.file(
                    metrics,
                    positions.clone(),
                    handler.clone(),
                    configs,
                    &config.target_config,
                ),
                KindMetrics::Journal => factory.journal(positions.clone(), handler.clone(), configs),
                KindMetrics::Syslog(metrics) => factory.syslog(metrics, handler.clone(), configs),
                KindMetrics::Gcplog(metrics) => factory.gcplog(metrics, handler.clone(), configs),
                KindMetrics::Push => factory.push(handler.clone(), configs),
            };

            match built {
                Ok(manager) => {
                    info!(kind = %kind, "Started target manager");
                    backends.push(Backend {
                        name: kind.as_str(),
                        manager,
                    });
                }
                Err(e) => {
                    rollback(backends, &positions, &provisioned, registry);
                    return Err(LogshipError::target_manager(kind, e));
                }
            }
        }

        Ok(Self {
            backends,
            positions: Some(positions),
        })
    }

    /// Ready when any backend is ready.
    pub fn ready(&self) -> bool {
        self.backends.iter().any(|b| b.manager.ready())
    }

    pub fn active_targets(&self) -> TargetsByJob {
        self.merge(|m| m.active_targets())
    }

    pub fn all_targets(&self) -> TargetsByJob {
        self.merge(|m| m.all_targets())
    }

    fn merge(&self, fetch: impl Fn(&dyn TargetManager) -> TargetsByJob) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for backend in &self.backends {
            for (job, targets) in fetch(backend.manager.as_ref()) {
                result.entry(job).or_default().extend(targets);
            }
        }
        result
    }

    /// Stop every backend in construction order, then flush positions.
    pub fn stop(self) {
        for backend in self.backends {
            debug!("Stopping {} target manager", backend.name);
            backend.manager.stop();
        }

        if let Some(positions) = self.positions {
            positions.stop();
        }

        info!("Target managers stopped");
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    pub fn backend_names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name).collect()
    }

    pub fn positions(&self) -> Option<&Positions> {
        self.positions.as_ref()
    }
}

impl TargetManager for TargetManagers {
    fn ready(&self) -> bool {
        TargetManagers::ready(self)
    }

    fn active_targets(&self) -> TargetsByJob {
        TargetManagers::active_targets(self)
    }

    fn all_targets(&self) -> TargetsByJob {
        TargetManagers::all_targets(self)
    }

    fn stop(self: Box<Self>) {
        TargetManagers::stop(*self)
    }
}

/// Undo a failed construction: stop built managers, flush positions and
/// release every metrics set so the registry can be reused.
fn rollback(
    backends: Vec<Backend>,
    positions: &Positions,
    provisioned: &[KindMetrics],
    registry: &Registry,
) {
    if !backends.is_empty() {
        warn!(
            "Stopping {} target managers after construction failure",
            backends.len()
        );
    }
    for backend in backends {
        backend.manager.stop();
    }
    positions.stop();

    for metrics in provisioned {
        metrics.unregister(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CollectingHandler;
    use crate::config::{
        GcplogConfig, PositionsConfig, PushConfig, StaticConfig, SyslogConfig, TargetConfig,
    };
    use crate::targets::{Target, TargetType};
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    type Log = Arc<Mutex<Vec<String>>>;

    struct FakeManager {
        name: &'static str,
        ready: bool,
        active: TargetsByJob,
        positions: Option<Positions>,
        log: Log,
    }

    impl TargetManager for FakeManager {
        fn ready(&self) -> bool {
            self.ready
        }

        fn active_targets(&self) -> TargetsByJob {
            self.active.clone()
        }

        fn all_targets(&self) -> TargetsByJob {
            let mut all = self.active.clone();
            all.entry("dropped".to_string())
                .or_default()
                .push(Target::new(TargetType::File, format!("{}-dropped", self.name)));
            all
        }

        fn stop(self: Box<Self>) {
            let open = self.positions.as_ref().map(|p| !p.is_stopped());
            self.log
                .lock()
                .unwrap()
                .push(format!("stop:{}:positions_open={:?}", self.name, open));
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        log: Log,
        fail_on: Option<&'static str>,
        ready: HashMap<&'static str, bool>,
        active: HashMap<&'static str, TargetsByJob>,
        positions: Mutex<Option<Positions>>,
    }

    impl FakeFactory {
        fn make(
            &self,
            name: &'static str,
            configs: usize,
            positions: Option<Positions>,
        ) -> Result<Box<dyn TargetManager>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("new:{}:{}", name, configs));
            if let Some(p) = &positions {
                *self.positions.lock().unwrap() = Some(p.clone());
            }
            if self.fail_on == Some(name) {
                return Err(LogshipError::ConfigError("boom".to_string()));
            }
            Ok(Box::new(FakeManager {
                name,
                ready: self.ready.get(name).copied().unwrap_or(false),
                active: self.active.get(name).cloned().unwrap_or_default(),
                positions,
                log: self.log.clone(),
            }))
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    impl ManagerFactory for FakeFactory {
        fn file(
            &self,
            _metrics: FileMetrics,
            positions: Positions,
            _handler: SharedEntryHandler,
            configs: Vec<ScrapeConfig>,
            _target_config: &TargetConfig,
        ) -> Result<Box<dyn TargetManager>> {
            self.make("file", configs.len(), Some(positions))
        }

        fn journal(
            &self,
            positions: Positions,
            _handler: SharedEntryHandler,
            configs: Vec<ScrapeConfig>,
        ) -> Result<Box<dyn TargetManager>> {
            self.make("journal", configs.len(), Some(positions))
        }

        fn syslog(
            &self,
            _metrics: SyslogMetrics,
            _handler: SharedEntryHandler,
            configs: Vec<ScrapeConfig>,
        ) -> Result<Box<dyn TargetManager>> {
            let positions = self.positions.lock().unwrap().clone();
            self.make("syslog", configs.len(), positions)
        }

        fn gcplog(
            &self,
            _metrics: GcplogMetrics,
            _handler: SharedEntryHandler,
            configs: Vec<ScrapeConfig>,
        ) -> Result<Box<dyn TargetManager>> {
            self.make("gcplog", configs.len(), None)
        }

        fn push(
            &self,
            _handler: SharedEntryHandler,
            configs: Vec<ScrapeConfig>,
        ) -> Result<Box<dyn TargetManager>> {
            self.make("push", configs.len(), None)
        }

        fn stdin(
            &self,
            _shutdown: CancellationToken,
            _handler: SharedEntryHandler,
            configs: &[ScrapeConfig],
        ) -> Result<Box<dyn TargetManager>> {
            self.make("stdin", configs.len(), None)
        }
    }

    fn file_cfg(job: &str) -> ScrapeConfig {
        ScrapeConfig {
            static_configs: vec![StaticConfig::default()],
            ..ScrapeConfig::new(job)
        }
    }

    fn syslog_cfg(job: &str) -> ScrapeConfig {
        ScrapeConfig {
            syslog: Some(SyslogConfig::default()),
            ..ScrapeConfig::new(job)
        }
    }

    fn push_cfg(job: &str) -> ScrapeConfig {
        ScrapeConfig {
            push: Some(PushConfig::default()),
            ..ScrapeConfig::new(job)
        }
    }

    fn config(dir: &TempDir, scrape_configs: Vec<ScrapeConfig>) -> Config {
        Config {
            positions: PositionsConfig {
                filename: dir.path().join("positions.yaml"),
                ..Default::default()
            },
            target_config: TargetConfig::default(),
            scrape_configs,
        }
    }

    fn build(factory: &FakeFactory, config: &Config, registry: &Registry) -> Result<TargetManagers> {
        TargetManagers::with_factory(
            factory,
            config,
            registry,
            Arc::new(CollectingHandler::new()),
            CancellationToken::new(),
        )
    }

    fn job(name: &str, sources: &[&str]) -> TargetsByJob {
        let targets = sources
            .iter()
            .map(|s| Target::new(TargetType::File, *s))
            .collect();
        HashMap::from([(name.to_string(), targets)])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_one_manager_per_kind() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let cfg = config(
            &dir,
            vec![file_cfg("a"), syslog_cfg("b"), file_cfg("c"), push_cfg("d")],
        );

        let managers = build(&factory, &cfg, &Registry::new()).unwrap();

        assert_eq!(managers.backend_names(), vec!["file", "syslog", "push"]);
        assert_eq!(
            factory.events(),
            vec!["new:file:2", "new:syslog:1", "new:push:1"]
        );
        assert!(managers.positions().is_some());
        managers.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_config_aborts_before_any_backend() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let cfg = config(&dir, vec![file_cfg("ok"), ScrapeConfig::new("broken")]);

        let result = build(&factory, &cfg, &Registry::new());

        assert!(matches!(
            result,
            Err(LogshipError::UnknownScrapeConfig { .. })
        ));
        assert!(factory.events().is_empty());
        assert!(!cfg.positions.filename.exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_created_only_for_present_kinds() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let factory = FakeFactory::default();
        let cfg = config(&dir, vec![syslog_cfg("s")]);

        let managers = build(&factory, &cfg, &registry).unwrap();

        assert!(SyslogMetrics::new(&registry).is_err());
        assert!(FileMetrics::new(&registry).is_ok());
        assert!(GcplogMetrics::new(&registry).is_ok());
        managers.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_collision_fails_construction() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        FileMetrics::new(&registry).unwrap();
        let factory = FakeFactory::default();
        let cfg = config(&dir, vec![file_cfg("f")]);

        let result = build(&factory, &cfg, &registry);

        assert!(matches!(result, Err(LogshipError::MetricsError(_))));
        assert!(factory.events().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stdin_mode_short_circuits() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let mut cfg = config(
            &dir,
            vec![file_cfg("a"), ScrapeConfig::new("unclassifiable"), push_cfg("p")],
        );
        cfg.target_config.stdin = true;

        let managers = build(&factory, &cfg, &Registry::new()).unwrap();

        assert_eq!(managers.len(), 1);
        assert!(managers.positions().is_none());
        assert_eq!(factory.events(), vec!["new:stdin:3"]);
        assert!(!cfg.positions.filename.exists());

        managers.stop();
        assert_eq!(
            factory.events().last().map(String::as_str),
            Some("stop:stdin:positions_open=None")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_active_targets_concatenate_shared_jobs() {
        let dir = TempDir::new().unwrap();
        let mut factory = FakeFactory::default();
        factory.active.insert("file", job("x", &["t1"]));
        factory.active.insert("syslog", job("x", &["t2"]));
        let cfg = config(&dir, vec![syslog_cfg("s"), file_cfg("f")]);

        let managers = build(&factory, &cfg, &Registry::new()).unwrap();
        let active = managers.active_targets();

        let sources: Vec<_> = active["x"].iter().map(|t| t.source.as_str()).collect();
        assert_eq!(sources, vec!["t1", "t2"]);

        let all = managers.all_targets();
        assert_eq!(all["x"].len(), 2);
        assert_eq!(all["dropped"].len(), 2);
        managers.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_ready_is_or_of_backends() {
        let dir = TempDir::new().unwrap();
        let cfg = config(&dir, vec![file_cfg("f"), push_cfg("p")]);

        let factory = FakeFactory::default();
        let managers = build(&factory, &cfg, &Registry::new()).unwrap();
        assert!(!managers.ready());
        managers.stop();

        let mut factory = FakeFactory::default();
        factory.ready.insert("push", true);
        let managers = build(&factory, &cfg, &Registry::new()).unwrap();
        assert!(managers.ready());
        managers.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_backends_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let managers = build(&factory, &config(&dir, vec![]), &Registry::new()).unwrap();

        assert!(managers.is_empty());
        assert!(!managers.ready());
        assert!(managers.active_targets().is_empty());
        managers.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_closes_positions_after_backends() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory::default();
        let cfg = config(&dir, vec![file_cfg("f"), syslog_cfg("s")]);

        let managers = build(&factory, &cfg, &Registry::new()).unwrap();
        let positions = managers.positions().cloned().unwrap();
        positions.put_offset("/var/log/app.log", 7);

        managers.stop();

        assert_eq!(
            factory.events()[2..],
            [
                "stop:file:positions_open=Some(true)",
                "stop:syslog:positions_open=Some(true)",
            ]
        );
        assert!(positions.is_stopped());
        let written = std::fs::read_to_string(&cfg.positions.filename).unwrap();
        assert!(written.contains("/var/log/app.log"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_construction_failure_rolls_back() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            fail_on: Some("syslog"),
            ..Default::default()
        };
        let cfg = config(&dir, vec![file_cfg("f"), syslog_cfg("s"), push_cfg("p")]);

        let err = build(&factory, &cfg, &Registry::new()).err().unwrap();

        assert_eq!(err.failed_kind(), Some(Kind::Syslog));
        assert!(err
            .to_string()
            .starts_with("failed to make syslog target manager"));
        assert_eq!(
            factory.events(),
            vec![
                "new:file:1",
                "new:syslog:1",
                "stop:file:positions_open=Some(true)",
            ]
        );
        let positions = factory.positions.lock().unwrap().clone().unwrap();
        assert!(positions.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rollback_releases_metrics_for_rebuild() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let failing = FakeFactory {
            fail_on: Some("syslog"),
            ..Default::default()
        };
        let cfg = config(&dir, vec![file_cfg("f"), syslog_cfg("s"), file_cfg("g")]);

        assert!(build(&failing, &cfg, &registry).is_err());
        assert!(registry.gather().is_empty());

        let factory = FakeFactory::default();
        let managers = build(&factory, &config(&dir, vec![file_cfg("f")]), &registry)
            .expect("registry is reusable after a failed build");
        assert_eq!(managers.backend_names(), vec!["file"]);
        managers.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_metrics_collision_releases_earlier_sets() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let _occupied = GcplogMetrics::new(&registry).unwrap();
        let factory = FakeFactory::default();
        let cfg = config(
            &dir,
            vec![
                file_cfg("f"),
                syslog_cfg("s"),
                ScrapeConfig {
                    gcplog: Some(GcplogConfig::default()),
                    ..ScrapeConfig::new("g")
                },
            ],
        );

        let result = build(&factory, &cfg, &registry);

        assert!(matches!(result, Err(LogshipError::MetricsError(_))));
        assert!(FileMetrics::new(&registry).is_ok());
        assert!(SyslogMetrics::new(&registry).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_push_failure_names_push_api() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            fail_on: Some("push"),
            ..Default::default()
        };
        let cfg = config(&dir, vec![push_cfg("p")]);

        let err = build(&factory, &cfg, &Registry::new()).err().unwrap();
        assert!(err
            .to_string()
            .contains("failed to make push API target manager: Configuration error: boom"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stdin_failure_is_wrapped() {
        let dir = TempDir::new().unwrap();
        let factory = FakeFactory {
            fail_on: Some("stdin"),
            ..Default::default()
        };
        let mut cfg = config(&dir, vec![]);
        cfg.target_config.stdin = true;

        let err = build(&factory, &cfg, &Registry::new()).err().unwrap();
        assert!(matches!(err, LogshipError::StdinTargetManager(_)));
    }
}
