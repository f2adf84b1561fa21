//! Single-stream mode: ship every line of standard input, then request
//! shutdown once the stream is exhausted.

use crate::api::{public_labels, Entry, LabelSet, SharedEntryHandler};
use crate::config::ScrapeConfig;
use crate::targets::{Target, TargetManager, TargetType, TargetsByJob};
use crate::Result;
use std::io::{BufRead, BufReader};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_JOB: &str = "stdin";

/// Labels for the stream: the first static config's public labels, or
/// `job="stdin"` when nothing is configured.
pub fn stream_labels(configs: &[ScrapeConfig]) -> LabelSet {
    configs
        .first()
        .and_then(ScrapeConfig::first_static_labels)
        .map(public_labels)
        .filter(|labels| !labels.is_empty())
        .unwrap_or_else(|| LabelSet::from([("job".to_string(), DEFAULT_JOB.to_string())]))
}

pub struct StdinTargetManager {
    job_name: String,
    labels: LabelSet,
    reading: Arc<AtomicBool>,
    lines: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl StdinTargetManager {
    pub fn new(
        shutdown: CancellationToken,
        handler: SharedEntryHandler,
        configs: &[ScrapeConfig],
    ) -> Result<Self> {
        Self::with_reader(Box::new(BufReader::new(std::io::stdin())), shutdown, handler, configs)
    }

    /// Read from an arbitrary stream instead of the process stdin.
    pub fn with_reader(
        reader: Box<dyn BufRead + Send>,
        shutdown: CancellationToken,
        handler: SharedEntryHandler,
        configs: &[ScrapeConfig],
    ) -> Result<Self> {
        let job_name = configs
            .first()
            .map(|c| c.job_name.clone())
            .unwrap_or_else(|| DEFAULT_JOB.to_string());
        let labels = stream_labels(configs);

        let reading = Arc::new(AtomicBool::new(true));
        let lines = Arc::new(AtomicU64::new(0));

        let handle = {
            let reading = Arc::clone(&reading);
            let lines = Arc::clone(&lines);
            let labels = labels.clone();
            std::thread::Builder::new()
                .name("stdin-reader".to_string())
                .spawn(move || {
                    for line in reader.lines() {
                        match line {
                            Ok(line) => {
                                handler.handle(Entry::new(labels.clone(), line));
                                lines.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                warn!("reading stdin failed: {}", e);
                                break;
                            }
                        }
                    }
                    reading.store(false, Ordering::SeqCst);
                    info!("stdin exhausted after {} lines", lines.load(Ordering::Relaxed));
                    shutdown.cancel();
                })?
        };

        debug!(job = %job_name, "reading from stdin");
        Ok(Self {
            job_name,
            labels,
            reading,
            lines,
            handle: Some(handle),
        })
    }

    pub fn is_reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Target {
        Target::new(TargetType::Stdin, "-")
            .with_labels(self.labels.clone())
            .with_discovered_labels(self.labels.clone())
            .with_ready(self.is_reading())
            .with_detail("lines", self.lines.load(Ordering::Relaxed))
    }

    fn targets(&self) -> TargetsByJob {
        TargetsByJob::from([(self.job_name.clone(), vec![self.snapshot()])])
    }
}

impl TargetManager for StdinTargetManager {
    fn ready(&self) -> bool {
        self.is_reading()
    }

    fn active_targets(&self) -> TargetsByJob {
        if self.is_reading() {
            self.targets()
        } else {
            TargetsByJob::new()
        }
    }

    fn all_targets(&self) -> TargetsByJob {
        self.targets()
    }

    fn stop(mut self: Box<Self>) {
        // A blocking read on stdin cannot be interrupted; only join a
        // reader that has already finished.
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() {
                if handle.join().is_err() {
                    warn!("stdin reader panicked");
                }
            } else {
                debug!("leaving stdin reader detached");
            }
        }
    }
}
