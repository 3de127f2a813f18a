//! CLI argument parsing for Timeinstate

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Output format for the accounting report
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text format (default)
    Text,
    /// JSON format for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "timeinstate")]
#[command(version)]
#[command(about = "Replay scheduler and cpufreq events into per-UID time-in-state tables", long_about = None)]
pub struct Cli {
    /// Topology file (TOML) describing policies, their CPUs and frequencies
    #[arg(short, long, value_name = "FILE")]
    pub topology: PathBuf,

    /// Event log (JSON lines); `-` reads standard input
    #[arg(short, long, value_name = "FILE", default_value = "-")]
    pub events: PathBuf,

    /// Output format
    #[arg(long = "format", value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Only report this UID
    #[arg(short, long, value_name = "UID")]
    pub uid: Option<u32>,

    /// Enable debug tracing output to stderr
    #[arg(long)]
    pub debug: bool,
}

impl Cli {
    /// Whether events come from standard input
    pub fn events_from_stdin(&self) -> bool {
        self.events.as_os_str() == "-"
    }
}
