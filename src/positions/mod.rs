//! Durable read positions shared by every backend that can resume.
//!
//! Positions are kept in memory and written to a YAML file by a background
//! syncer task every `sync_period`. `stop` halts the syncer and performs the
//! final write, so it must only run once nothing can advance a position.

use crate::config::PositionsConfig;
use crate::tasks::TaskGroup;
use crate::{LogshipError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PositionsFile {
    #[serde(default)]
    positions: BTreeMap<String, String>,
}

struct Store {
    path: PathBuf,
    positions: RwLock<HashMap<String, String>>,
}

impl Store {
    fn snapshot(&self) -> BTreeMap<String, String> {
        match self.positions.read() {
            Ok(guard) => guard.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Err(poisoned) => poisoned
                .into_inner()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }

    fn write_file(&self) -> Result<()> {
        let file = PositionsFile {
            positions: self.snapshot(),
        };
        let body = serde_yaml::to_string(&file)?;

        let tmp = tmp_path(&self.path);
        std::fs::write(&tmp, body).map_err(|e| {
            LogshipError::PositionsError(format!("failed to write {}: {}", tmp.display(), e))
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| {
            LogshipError::PositionsError(format!(
                "failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })?;

        Ok(())
    }
}

/// Cheaply cloneable handle to the position store.
#[derive(Clone)]
pub struct Positions {
    store: Arc<Store>,
    syncer: Arc<Mutex<Option<TaskGroup>>>,
}

impl Positions {
    /// Load existing positions and start the periodic syncer.
    ///
    /// Fails when the file exists but cannot be parsed (unless
    /// `ignore_invalid_yaml` is set) or when the location is not writable.
    pub fn new(config: &PositionsConfig) -> Result<Self> {
        let syncer = TaskGroup::new()?;
        let positions = read_positions_file(&config.filename, config.ignore_invalid_yaml)?;
        debug!(
            "Loaded {} positions from {}",
            positions.len(),
            config.filename.display()
        );

        let store = Arc::new(Store {
            path: config.filename.clone(),
            positions: RwLock::new(positions.into_iter().collect()),
        });

        // Surface an unwritable location now rather than at the first sync.
        store.write_file()?;

        syncer.spawn(sync_loop(
            Arc::clone(&store),
            config.sync_period(),
            syncer.token(),
        ));

        Ok(Self {
            store,
            syncer: Arc::new(Mutex::new(Some(syncer))),
        })
    }

    pub fn get(&self, source: &str) -> Option<String> {
        self.store
            .positions
            .read()
            .ok()
            .and_then(|p| p.get(source).cloned())
    }

    /// Byte offset recorded for `source`, or 0 when none is stored.
    pub fn get_offset(&self, source: &str) -> u64 {
        self.get(source)
            .and_then(|raw| raw.parse::<u64>().ok())
            .unwrap_or(0)
    }

    pub fn put(&self, source: &str, position: impl Into<String>) {
        if let Ok(mut positions) = self.store.positions.write() {
            positions.insert(source.to_string(), position.into());
        }
    }

    pub fn put_offset(&self, source: &str, offset: u64) {
        self.put(source, offset.to_string());
    }

    pub fn remove(&self, source: &str) {
        if let Ok(mut positions) = self.store.positions.write() {
            positions.remove(source);
        }
    }

    pub fn len(&self) -> usize {
        self.store.positions.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_stopped(&self) -> bool {
        self.syncer.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    /// Stop the syncer and flush. Later calls are no-ops.
    pub fn stop(&self) {
        let syncer = match self.syncer.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(syncer) = syncer else {
            return;
        };

        syncer.shutdown();

        match self.store.write_file() {
            Ok(()) => info!("Positions flushed to {}", self.store.path.display()),
            Err(e) => warn!("Final positions flush failed: {}", e),
        }
    }
}

async fn sync_loop(store: Arc<Store>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately and the file was just written.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let store = Arc::clone(&store);
                match tokio::task::spawn_blocking(move || store.write_file()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Error writing positions file: {}", e),
                    Err(e) => warn!("Positions writer failed: {}", e),
                }
            }
        }
    }
}

fn read_positions_file(path: &Path, ignore_invalid: bool) -> Result<BTreeMap<String, String>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(e) => {
            return Err(LogshipError::PositionsError(format!(
                "failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };

    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    match serde_yaml::from_str::<PositionsFile>(&raw) {
        Ok(file) => Ok(file.positions),
        Err(e) if ignore_invalid => {
            warn!(
                "Ignoring invalid positions file {}: {}",
                path.display(),
                e
            );
            Ok(BTreeMap::new())
        }
        Err(e) => Err(LogshipError::PositionsError(format!(
            "invalid positions file {}: {}",
            path.display(),
            e
        ))),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> PositionsConfig {
        PositionsConfig {
            filename: dir.path().join("positions.yaml"),
            sync_period_secs: 60,
            ignore_invalid_yaml: false,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_put_get_and_flush_on_stop() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);

        let positions = Positions::new(&config).expect("positions should start");
        positions.put_offset("/var/log/app.log", 42);
        positions.put("journal", "s=abc;i=1");
        assert_eq!(positions.get_offset("/var/log/app.log"), 42);
        assert_eq!(positions.get_offset("/missing"), 0);

        positions.stop();
        assert!(positions.is_stopped());

        let reloaded = Positions::new(&config).unwrap();
        assert_eq!(reloaded.get_offset("/var/log/app.log"), 42);
        assert_eq!(reloaded.get("journal").as_deref(), Some("s=abc;i=1"));
        reloaded.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_syncer_writes_periodically() {
        let dir = TempDir::new().unwrap();
        let config = PositionsConfig {
            sync_period_secs: 1,
            ..config_in(&dir)
        };

        let positions = Positions::new(&config).unwrap();
        positions.put_offset("/var/log/tick.log", 7);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut synced = false;
        while std::time::Instant::now() < deadline && !synced {
            tokio::time::sleep(Duration::from_millis(50)).await;
            synced = std::fs::read_to_string(&config.filename)
                .map(|raw| raw.contains("/var/log/tick.log"))
                .unwrap_or(false);
        }
        assert!(synced);
        assert!(!positions.is_stopped());

        positions.stop();
    }

    #[test]
    fn test_requires_a_runtime() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            Positions::new(&config_in(&dir)),
            Err(LogshipError::RuntimeError(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_twice_is_noop() {
        let dir = TempDir::new().unwrap();
        let positions = Positions::new(&config_in(&dir)).unwrap();
        positions.stop();
        positions.stop();
        assert!(positions.is_stopped());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let config = config_in(&dir);
        std::fs::write(&config.filename, "positions: [not, a, map").unwrap();

        let result = Positions::new(&config);
        assert!(matches!(result, Err(LogshipError::PositionsError(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_invalid_file_ignored_when_configured() {
        let dir = TempDir::new().unwrap();
        let mut config = config_in(&dir);
        config.ignore_invalid_yaml = true;
        std::fs::write(&config.filename, "positions: [not, a, map").unwrap();

        let positions = Positions::new(&config).expect("invalid file should be ignored");
        assert!(positions.is_empty());
        positions.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unwritable_location_fails() {
        let dir = TempDir::new().unwrap();
        let config = PositionsConfig {
            filename: dir.path().join("missing-dir").join("positions.yaml"),
            ..config_in(&dir)
        };

        assert!(matches!(
            Positions::new(&config),
            Err(LogshipError::PositionsError(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove() {
        let dir = TempDir::new().unwrap();
        let positions = Positions::new(&config_in(&dir)).unwrap();
        positions.put_offset("a", 1);
        positions.remove("a");
        assert!(positions.get("a").is_none());
        positions.stop();
    }
}
