//! Backend target managers and the aggregate that drives them.

pub mod classify;
pub mod factory;
pub mod file;
pub mod gcplog;
pub mod journal;
mod listener;
pub mod manager;
pub mod push;
pub mod stdin;
pub mod syslog;
pub mod target;

pub use classify::{classify, kind_of, Groups};
pub use factory::{BuiltinFactory, ManagerFactory};
pub use manager::TargetManagers;
pub use target::{Target, TargetType};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Targets grouped by job name.
pub type TargetsByJob = HashMap<String, Vec<Target>>;

/// Capability contract every backend satisfies.
pub trait TargetManager: Send + Sync {
    /// True when at least one source is actively producing.
    fn ready(&self) -> bool;

    fn active_targets(&self) -> TargetsByJob;

    /// Active targets plus the ones seen but not read (dropped, missing).
    fn all_targets(&self) -> TargetsByJob;

    /// Release every reader, listener and child process owned by the backend.
    fn stop(self: Box<Self>);
}

/// Backend kind a scrape config is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    File,
    Journal,
    Syslog,
    Gcplog,
    Push,
}

impl Kind {
    /// Classification priority, also the construction and stop order.
    pub const ALL: [Kind; 5] = [
        Kind::File,
        Kind::Journal,
        Kind::Syslog,
        Kind::Gcplog,
        Kind::Push,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Kind::File => "file",
            Kind::Journal => "journal",
            Kind::Syslog => "syslog",
            Kind::Gcplog => "gcplog",
            Kind::Push => "push",
        }
    }

    /// Name used in construction error messages.
    pub const fn manager_name(&self) -> &'static str {
        match self {
            Kind::File => "file",
            Kind::Journal => "journal",
            Kind::Syslog => "syslog",
            Kind::Gcplog => "gcplog",
            Kind::Push => "push API",
        }
    }

    /// Kinds that own a per-kind metrics set.
    pub const fn has_metrics(&self) -> bool {
        matches!(self, Kind::File | Kind::Syslog | Kind::Gcplog)
    }

    /// Kinds that persist read positions.
    pub const fn uses_positions(&self) -> bool {
        matches!(self, Kind::File | Kind::Journal)
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
