//! CLI commands and argument parsing.

pub mod pull;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

/// Filter used when neither flags nor `RUST_LOG` say otherwise.
const DEFAULT_FILTER: &str = "imgpull=warn";

/// imgpull - Pull container images without a container runtime
#[derive(Parser)]
#[command(name = "imgpull")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LogArgs,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
pub enum Commands {
    /// Pull an image into a tar archive for `docker load`
    Pull(pull::PullArgs),

    /// Print version information
    Version,
}

/// Logging verbosity flags, accepted before or after the subcommand.
#[derive(Args, Debug, Default)]
pub struct LogArgs {
    /// Trace-level logging, including every routing decision
    #[arg(long, global = true)]
    pub debug: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true, conflicts_with_all = ["debug", "verbose"])]
    pub quiet: bool,

    /// Log level or filter directive (e.g. `info`, `imgpull_registry=trace`)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

impl LogArgs {
    /// Builds the log filter. Explicit flags win over `RUST_LOG`.
    ///
    /// # Errors
    ///
    /// Returns an error if `--log-level` is not a valid filter.
    pub fn filter(&self) -> Result<EnvFilter> {
        let directive = if let Some(level) = &self.log_level {
            if level.contains('=') {
                level.clone()
            } else {
                format!("imgpull={level}")
            }
        } else if self.debug {
            "imgpull=trace".to_string()
        } else if self.verbose {
            "imgpull=debug".to_string()
        } else if self.quiet {
            "imgpull=error".to_string()
        } else {
            return Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)));
        };
        EnvFilter::try_new(&directive).with_context(|| format!("Invalid log level '{directive}'"))
    }
}
