//! File tailing backend.
//!
//! Every static config entry with a `__path__` label becomes a target. Each
//! target gets a polling tailer task that resumes from the stored offset,
//! ships complete lines and records the offset after each batch.

use crate::api::{public_labels, Entry, LabelSet, SharedEntryHandler};
use crate::config::{ScrapeConfig, TargetConfig};
use crate::metrics::FileMetrics;
use crate::positions::Positions;
use crate::targets::{Target, TargetManager, TargetType, TargetsByJob};
use crate::tasks::TaskGroup;
use crate::Result;
use dashmap::DashMap;
use std::collections::HashSet;
use std::io::SeekFrom;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const PATH_LABEL: &str = "__path__";
pub const FILENAME_LABEL: &str = "filename";

/// Live state of one tailed file, shared between its tailer and queries.
#[derive(Debug, Clone, Default)]
struct TailStatus {
    reading: bool,
    offset: u64,
    error: Option<String>,
}

struct FileTarget {
    job_name: String,
    path: Option<String>,
    labels: LabelSet,
    discovered_labels: LabelSet,
    drop_reason: Option<&'static str>,
}

pub struct FileTargetManager {
    targets: Vec<FileTarget>,
    status: Arc<DashMap<String, TailStatus>>,
    tailers: TaskGroup,
}

impl FileTargetManager {
    pub fn new(
        metrics: FileMetrics,
        positions: Positions,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
        target_config: &TargetConfig,
    ) -> Result<Self> {
        let tailers = TaskGroup::new()?;
        let targets = discover(&configs);
        let status = Arc::new(DashMap::new());

        for target in targets.iter().filter(|t| t.drop_reason.is_none()) {
            let Some(path) = target.path.clone() else {
                continue;
            };
            status.insert(path.clone(), TailStatus::default());

            let tail = TailLoop {
                path: path.clone(),
                labels: target.labels.clone(),
                positions: positions.clone(),
                handler: handler.clone(),
                metrics: metrics.clone(),
                status: Arc::clone(&status),
                poll_interval: target_config.poll_interval(),
            };
            tailers.spawn(tail.run(tailers.token()));
            info!(job = %target.job_name, "tailing {}", path);
        }

        Ok(Self {
            targets,
            status,
            tailers,
        })
    }

    fn snapshot(&self, target: &FileTarget) -> Target {
        let source = target.path.clone().unwrap_or_default();
        let mut snapshot = Target::new(TargetType::File, source.clone())
            .with_labels(target.labels.clone())
            .with_discovered_labels(target.discovered_labels.clone());

        if let Some(reason) = target.drop_reason {
            return snapshot.with_detail("dropped", reason);
        }

        if let Some(status) = self.status.get(&source) {
            snapshot = snapshot
                .with_ready(status.reading)
                .with_detail("position", status.offset);
            if let Some(err) = &status.error {
                snapshot = snapshot.with_detail("error", err);
            }
        }
        snapshot
    }

    fn is_active(&self, target: &FileTarget) -> bool {
        target.drop_reason.is_none()
            && target
                .path
                .as_ref()
                .and_then(|p| self.status.get(p).map(|s| s.reading))
                .unwrap_or(false)
    }
}

impl TargetManager for FileTargetManager {
    fn ready(&self) -> bool {
        self.status.iter().any(|s| s.reading)
    }

    fn active_targets(&self) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for target in self.targets.iter().filter(|t| self.is_active(t)) {
            result
                .entry(target.job_name.clone())
                .or_default()
                .push(self.snapshot(target));
        }
        result
    }

    fn all_targets(&self) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for target in &self.targets {
            result
                .entry(target.job_name.clone())
                .or_default()
                .push(self.snapshot(target));
        }
        result
    }

    fn stop(self: Box<Self>) {
        self.tailers.shutdown();
    }
}

impl Drop for FileTargetManager {
    fn drop(&mut self) {
        self.tailers.shutdown();
    }
}

/// Expand static configs into targets, in config order.
fn discover(configs: &[ScrapeConfig]) -> Vec<FileTarget> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for cfg in configs {
        for static_config in &cfg.static_configs {
            let discovered = static_config.labels.clone();
            let path = discovered.get(PATH_LABEL).cloned();

            let drop_reason = match &path {
                None => Some("missing __path__ label"),
                Some(p) if !seen.insert(p.clone()) => Some("path already tailed by another target"),
                Some(_) => None,
            };

            let labels = match (&path, drop_reason) {
                (Some(p), None) => {
                    let mut labels = public_labels(&discovered);
                    labels.insert(FILENAME_LABEL.to_string(), p.clone());
                    labels
                }
                _ => LabelSet::new(),
            };

            if let Some(reason) = drop_reason {
                debug!(job = %cfg.job_name, "dropping file target: {}", reason);
            }

            targets.push(FileTarget {
                job_name: cfg.job_name.clone(),
                path,
                labels,
                discovered_labels: discovered,
                drop_reason,
            });
        }
    }

    targets
}

struct TailLoop {
    path: String,
    labels: LabelSet,
    positions: Positions,
    handler: SharedEntryHandler,
    metrics: FileMetrics,
    status: Arc<DashMap<String, TailStatus>>,
    poll_interval: Duration,
}

impl TailLoop {
    async fn run(self, token: CancellationToken) {
        let mut reader: Option<BufReader<File>> = None;
        let mut offset = self.positions.get_offset(&self.path);
        let mut pending: Vec<u8> = Vec::new();

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if reader.is_none() {
                if let Some((opened, start)) = self.open(offset).await {
                    reader = Some(opened);
                    offset = start;
                }
            }

            if let Some(r) = reader.as_mut() {
                match self.read_available(r, &mut offset, &mut pending, &token).await {
                    Ok(()) => self.positions.put_offset(&self.path, offset),
                    Err(e) => {
                        warn!("error reading {}: {}", self.path, e);
                        self.metrics.files_active.dec();
                        self.set_status(false, offset, Some(e.to_string()));
                        reader = None;
                        pending.clear();
                    }
                }
            }
        }

        if reader.is_some() {
            self.metrics.files_active.dec();
        }
        self.positions.put_offset(&self.path, offset);
        self.set_status(false, offset, None);
        debug!("stopped tailing {} at offset {}", self.path, offset);
    }

    async fn open(&self, offset: u64) -> Option<(BufReader<File>, u64)> {
        let opened = async {
            let mut file = File::open(&self.path).await?;
            let len = file.metadata().await?.len();
            let start = if len < offset { 0 } else { offset };
            file.seek(SeekFrom::Start(start)).await?;
            Ok::<_, std::io::Error>((file, start))
        }
        .await;

        match opened {
            Ok((file, start)) => {
                if start != offset {
                    info!("{} is shorter than its stored position, reading from start", self.path);
                    self.positions.put_offset(&self.path, start);
                }
                self.metrics.files_active.inc();
                self.set_status(true, start, None);
                Some((BufReader::new(file), start))
            }
            Err(e) => {
                self.set_status(false, offset, Some(e.to_string()));
                None
            }
        }
    }

    async fn read_available(
        &self,
        reader: &mut BufReader<File>,
        offset: &mut u64,
        pending: &mut Vec<u8>,
        token: &CancellationToken,
    ) -> std::io::Result<()> {
        let len = tokio::fs::metadata(&self.path).await?.len();
        if len < *offset {
            info!("{} was truncated, reading from start", self.path);
            reader.seek(SeekFrom::Start(0)).await?;
            *offset = 0;
            pending.clear();
        }

        let mut lines = 0u64;
        while !token.is_cancelled() {
            let read = reader.read_until(b'\n', pending).await?;
            if read == 0 || !pending.ends_with(b"\n") {
                break;
            }

            *offset += pending.len() as u64;
            let text = String::from_utf8_lossy(pending);
            let line = text.trim_end_matches(['\n', '\r']);
            self.handler.handle(Entry::new(self.labels.clone(), line));
            pending.clear();
            lines += 1;
        }

        if lines > 0 {
            self.metrics
                .read_lines
                .with_label_values(&[self.path.as_str()])
                .inc_by(lines);
            self.metrics
                .read_bytes
                .with_label_values(&[self.path.as_str()])
                .set(*offset as i64);
        }
        self.set_status(true, *offset, None);
        Ok(())
    }

    fn set_status(&self, reading: bool, offset: u64, error: Option<String>) {
        self.status.insert(
            self.path.clone(),
            TailStatus {
                reading,
                offset,
                error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CollectingHandler;
    use crate::config::{PositionsConfig, StaticConfig};
    use crate::targets::listener::test_util::wait_for;
    use prometheus::Registry;
    use std::io::Write;
    use tempfile::TempDir;

    fn file_cfg(job: &str, paths: &[Option<&str>]) -> ScrapeConfig {
        ScrapeConfig {
            static_configs: paths
                .iter()
                .map(|p| {
                    let mut labels = LabelSet::from([("job".to_string(), job.to_string())]);
                    if let Some(p) = p {
                        labels.insert(PATH_LABEL.to_string(), p.to_string());
                    }
                    StaticConfig {
                        targets: vec!["localhost".to_string()],
                        labels,
                    }
                })
                .collect(),
            ..ScrapeConfig::new(job)
        }
    }

    fn fast_target_config() -> TargetConfig {
        TargetConfig {
            poll_interval_ms: 20,
            ..TargetConfig::default()
        }
    }

    fn positions(dir: &TempDir) -> Positions {
        Positions::new(&PositionsConfig {
            filename: dir.path().join("positions.yaml"),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_discover_drops_missing_and_duplicate_paths() {
        let targets = discover(&[
            file_cfg("a", &[Some("/var/log/a.log"), None]),
            file_cfg("b", &[Some("/var/log/a.log")]),
        ]);

        assert_eq!(targets.len(), 3);
        assert!(targets[0].drop_reason.is_none());
        assert_eq!(
            targets[0].labels.get(FILENAME_LABEL).map(String::as_str),
            Some("/var/log/a.log")
        );
        assert!(!targets[0].labels.contains_key(PATH_LABEL));
        assert_eq!(targets[1].drop_reason, Some("missing __path__ label"));
        assert!(targets[2].drop_reason.is_some());
        assert!(targets[2].labels.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_tails_lines_and_records_offset() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "one\ntwo\npart").unwrap();
        let log_path = log.to_string_lossy().to_string();

        let positions = positions(&dir);
        let sink = CollectingHandler::new();
        let manager = FileTargetManager::new(
            FileMetrics::new(&Registry::new()).unwrap(),
            positions.clone(),
            Arc::new(sink.clone()),
            vec![file_cfg("app", &[Some(log_path.as_str()), None])],
            &fast_target_config(),
        )
        .unwrap();

        assert!(wait_for(|| sink.len() == 2));
        assert!(manager.ready());
        assert_eq!(positions.get_offset(&log_path), 8);

        let mut file = std::fs::OpenOptions::new().append(true).open(&log).unwrap();
        writeln!(file, "ial").unwrap();
        assert!(wait_for(|| sink.len() == 3));

        let lines: Vec<_> = sink.entries().into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["one", "two", "partial"]);
        assert_eq!(
            sink.entries()[0].labels.get("job").map(String::as_str),
            Some("app")
        );

        assert_eq!(manager.active_targets()["app"].len(), 1);
        assert_eq!(manager.all_targets()["app"].len(), 2);

        Box::new(manager).stop();
        assert_eq!(positions.get_offset(&log_path), 16);
        positions.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resumes_from_stored_offset() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("resume.log");
        std::fs::write(&log, "old\nnew\n").unwrap();
        let log_path = log.to_string_lossy().to_string();

        let positions = positions(&dir);
        positions.put_offset(&log_path, 4);

        let sink = CollectingHandler::new();
        let manager = FileTargetManager::new(
            FileMetrics::new(&Registry::new()).unwrap(),
            positions.clone(),
            Arc::new(sink.clone()),
            vec![file_cfg("resume", &[Some(log_path.as_str())])],
            &fast_target_config(),
        )
        .unwrap();

        assert!(wait_for(|| sink.len() == 1));
        assert_eq!(sink.entries()[0].line, "new");

        Box::new(manager).stop();
        positions.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_missing_file_is_not_ready() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.log").to_string_lossy().to_string();
        let positions = positions(&dir);

        let manager = FileTargetManager::new(
            FileMetrics::new(&Registry::new()).unwrap(),
            positions.clone(),
            Arc::new(CollectingHandler::new()),
            vec![file_cfg("missing", &[Some(missing.as_str())])],
            &fast_target_config(),
        )
        .unwrap();

        assert!(wait_for(|| manager
            .all_targets()
            .get("missing")
            .map(|t| t[0].details.contains_key("error"))
            .unwrap_or(false)));
        assert!(!manager.ready());
        assert!(manager.active_targets().is_empty());

        Box::new(manager).stop();
        positions.stop();
    }
}
