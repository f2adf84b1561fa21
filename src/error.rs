use crate::targets::Kind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LogshipError {
    #[error("unknown scrape config: job {job_name:?} {reason}")]
    UnknownScrapeConfig { job_name: String, reason: String },

    #[error("failed to make {} target manager: {source}", .kind.manager_name())]
    TargetManager {
        kind: Kind,
        #[source]
        source: Box<LogshipError>,
    },

    #[error("failed to make stdin target manager: {0}")]
    StdinTargetManager(#[source] Box<LogshipError>),

    #[error("Positions error: {0}")]
    PositionsError(String),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to start {backend} reader: {reason}")]
    BackendStartFailed { backend: String, reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("No async runtime: {0}")]
    RuntimeError(#[from] tokio::runtime::TryCurrentError),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
}

impl LogshipError {
    pub fn target_manager(kind: Kind, source: LogshipError) -> Self {
        LogshipError::TargetManager {
            kind,
            source: Box::new(source),
        }
    }

    /// Kind whose constructor failed, if this is a backend construction error.
    pub fn failed_kind(&self) -> Option<Kind> {
        match self {
            LogshipError::TargetManager { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LogshipError>;
