pub mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "logship")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Log shipping agent: tails files, journal, syslog and push sources", long_about = None)]
pub struct Cli {
    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    #[command(about = "Start every configured target manager")]
    Run {
        #[arg(short, long, help = "Path to the YAML config file")]
        config: PathBuf,

        #[arg(long, help = "Read a single stream from stdin instead of the configured targets")]
        stdin: bool,

        #[arg(long, default_value_t = 30, help = "Seconds between status reports")]
        status_interval_secs: u64,

        #[arg(long, help = "Write Prometheus metrics to this file on shutdown")]
        metrics_file: Option<PathBuf>,
    },
    #[command(about = "Validate a config file and show how jobs are grouped")]
    Check {
        #[arg(short, long, help = "Path to the YAML config file")]
        config: PathBuf,
    },
    #[command(about = "Print the effective config with defaults applied")]
    PrintConfig {
        #[arg(short, long, help = "Path to the YAML config file")]
        config: PathBuf,
    },
}
