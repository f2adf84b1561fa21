//! Journal reader backed by a `journalctl --follow --output=json` child.
//!
//! The cursor of the last shipped record is stored in the position store
//! under `journal-<job_name>` and handed back via `--after-cursor` on restart.

use crate::api::{Entry, LabelSet, SharedEntryHandler};
use crate::config::{JournalConfig, ScrapeConfig};
use crate::positions::Positions;
use crate::tasks::TaskGroup;
use crate::targets::{Target, TargetManager, TargetType, TargetsByJob};
use crate::{LogshipError, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const JOURNALCTL: &str = "journalctl";
const CURSOR_FIELD: &str = "__CURSOR";
const MESSAGE_FIELD: &str = "MESSAGE";
const REALTIME_FIELD: &str = "__REALTIME_TIMESTAMP";

pub fn position_key(job_name: &str) -> String {
    format!("journal-{}", job_name)
}

fn journalctl_args(config: &JournalConfig, cursor: Option<&str>) -> Vec<String> {
    let mut args = vec![
        "--follow".to_string(),
        "--output=json".to_string(),
        "--no-pager".to_string(),
    ];
    if let Some(path) = &config.path {
        args.push(format!("--directory={}", path));
    }
    match (cursor, &config.max_age) {
        (Some(cursor), _) => args.push(format!("--after-cursor={}", cursor)),
        (None, Some(max_age)) => args.push(format!("--since=-{}", max_age)),
        (None, None) => args.push("--lines=0".to_string()),
    }
    args
}

/// Convert one journal JSON record into an entry and its cursor.
fn parse_record(raw: &str, config: &JournalConfig) -> Option<(Entry, Option<String>)> {
    let record: Value = serde_json::from_str(raw).ok()?;

    let line = if config.json {
        raw.to_string()
    } else {
        match record.get(MESSAGE_FIELD)? {
            Value::String(s) => s.clone(),
            // Non-UTF-8 messages are emitted as byte arrays.
            Value::Array(bytes) => {
                let bytes: Vec<u8> = bytes
                    .iter()
                    .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                    .collect();
                String::from_utf8_lossy(&bytes).into_owned()
            }
            other => other.to_string(),
        }
    };

    let mut entry = Entry::new(config.labels.clone(), line);
    if let Some(ts) = record
        .get(REALTIME_FIELD)
        .and_then(Value::as_str)
        .and_then(|micros| micros.parse::<i64>().ok())
        .and_then(DateTime::<Utc>::from_timestamp_micros)
    {
        entry.timestamp = ts;
    }

    let cursor = record
        .get(CURSOR_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);

    Some((entry, cursor))
}

struct JournalReader {
    job_name: String,
    labels: LabelSet,
    position_key: String,
    pid: Option<u32>,
    reading: Arc<AtomicBool>,
    tasks: TaskGroup,
}

impl JournalReader {
    fn start(
        cfg: ScrapeConfig,
        positions: &Positions,
        handler: SharedEntryHandler,
    ) -> Result<Self> {
        let journal = cfg.journal.ok_or_else(|| {
            LogshipError::ConfigError(format!("job {} has no journal section", cfg.job_name))
        })?;
        let tasks = TaskGroup::new()?;

        let key = position_key(&cfg.job_name);
        let cursor = positions.get(&key);
        let args = journalctl_args(&journal, cursor.as_deref());
        debug!(job = %cfg.job_name, "starting {} {}", JOURNALCTL, args.join(" "));

        let mut child = {
            let _runtime = tasks.handle().enter();
            Command::new(JOURNALCTL)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| LogshipError::BackendStartFailed {
                    backend: "journal".to_string(),
                    reason: format!("{}: {}", JOURNALCTL, e),
                })?
        };

        let stdout = child.stdout.take().ok_or_else(|| LogshipError::BackendStartFailed {
            backend: "journal".to_string(),
            reason: "journalctl stdout unavailable".to_string(),
        })?;

        let pid = child.id();
        let labels = journal.labels.clone();
        let reading = Arc::new(AtomicBool::new(true));
        let follower = Follower {
            config: journal,
            positions: positions.clone(),
            key: key.clone(),
            handler,
            reading: Arc::clone(&reading),
        };
        tasks.spawn(follower.run(child, stdout, tasks.token()));

        info!(job = %cfg.job_name, "reading journal");
        Ok(Self {
            job_name: cfg.job_name,
            labels,
            position_key: key,
            pid,
            reading,
            tasks,
        })
    }

    fn is_reading(&self) -> bool {
        !self.tasks.is_cancelled() && self.reading.load(Ordering::SeqCst)
    }

    fn snapshot(&self, positions: &Positions) -> Target {
        let mut target = Target::new(TargetType::Journal, self.position_key.clone())
            .with_labels(self.labels.clone())
            .with_discovered_labels(self.labels.clone())
            .with_ready(self.is_reading());
        if let Some(pid) = self.pid {
            target = target.with_detail("pid", pid);
        }
        if let Some(cursor) = positions.get(&self.position_key) {
            target = target.with_detail("position", cursor);
        }
        target
    }

    /// Kill the child and wait for the reader task to finish.
    fn stop(&mut self) {
        debug!("stopping journal reader for {}", self.job_name);
        self.tasks.shutdown();
    }
}

impl Drop for JournalReader {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Follower {
    config: JournalConfig,
    positions: Positions,
    key: String,
    handler: SharedEntryHandler,
    reading: Arc<AtomicBool>,
}

impl Follower {
    async fn run(self, mut child: Child, stdout: ChildStdout, token: CancellationToken) {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                next = lines.next_line() => next,
            };
            match next {
                Ok(Some(line)) => self.ship(&line),
                Ok(None) => {
                    warn!("journalctl for {} exited", self.key);
                    break;
                }
                Err(e) => {
                    warn!("journal read failed: {}", e);
                    break;
                }
            }
        }
        self.reading.store(false, Ordering::SeqCst);

        if let Err(e) = child.kill().await {
            debug!("journalctl for {} already exited: {}", self.key, e);
        }
    }

    fn ship(&self, line: &str) {
        match parse_record(line, &self.config) {
            Some((entry, cursor)) => {
                self.handler.handle(entry);
                if let Some(cursor) = cursor {
                    self.positions.put(&self.key, cursor);
                }
            }
            None => debug!("skipping journal record without message"),
        }
    }
}

pub struct JournalTargetManager {
    readers: Vec<JournalReader>,
    positions: Positions,
}

impl JournalTargetManager {
    pub fn new(
        positions: Positions,
        handler: SharedEntryHandler,
        configs: Vec<ScrapeConfig>,
    ) -> Result<Self> {
        let mut readers = Vec::with_capacity(configs.len());
        for cfg in configs {
            // Readers started so far are stopped by Drop on error.
            readers.push(JournalReader::start(cfg, &positions, handler.clone())?);
        }
        Ok(Self { readers, positions })
    }
}

impl TargetManager for JournalTargetManager {
    fn ready(&self) -> bool {
        self.readers.iter().any(JournalReader::is_reading)
    }

    fn active_targets(&self) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for reader in self.readers.iter().filter(|r| r.is_reading()) {
            result
                .entry(reader.job_name.clone())
                .or_default()
                .push(reader.snapshot(&self.positions));
        }
        result
    }

    fn all_targets(&self) -> TargetsByJob {
        let mut result = TargetsByJob::new();
        for reader in &self.readers {
            result
                .entry(reader.job_name.clone())
                .or_default()
                .push(reader.snapshot(&self.positions));
        }
        result
    }

    fn stop(self: Box<Self>) {
        for mut reader in self.readers {
            reader.stop();
        }
    }
}
