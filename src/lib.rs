pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod positions;
pub mod targets;
mod tasks;

pub use api::{Entry, EntryHandler, LabelSet, SharedEntryHandler};
pub use config::Config;
pub use error::{LogshipError, Result};
pub use positions::Positions;
pub use targets::{Kind, Target, TargetManager, TargetManagers};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
