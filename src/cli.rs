//! Command-line argument parsing.

use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;
use tracing::Level;

/// GPU resource manager: VRAM accounting, service lifecycle, and
/// preemptive scheduling for a single shared GPU.
#[derive(Debug, Parser)]
#[command(name = "gpu-arbiterd", version, about)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, short = 'c', default_value = "gpu-arbiter.yaml")]
    pub config: PathBuf,

    /// Address to bind the HTTP API to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub bind: String,

    /// Minimum log level emitted.
    #[arg(long, default_value = "info")]
    pub log_level: LogLevelArg,
}

/// A `clap`-friendly wrapper around [`tracing::Level`], since `Level`
/// itself doesn't implement `ValueEnum`.
#[derive(Debug, Clone, Copy)]
pub struct LogLevelArg(pub Level);

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevelArg(Level::TRACE)),
            "debug" => Ok(LogLevelArg(Level::DEBUG)),
            "info" => Ok(LogLevelArg(Level::INFO)),
            "warn" => Ok(LogLevelArg(Level::WARN)),
            "error" => Ok(LogLevelArg(Level::ERROR)),
            other => Err(format!("unrecognized log level '{other}'")),
        }
    }
}

impl std::fmt::Display for LogLevelArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
