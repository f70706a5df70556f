//! CLI argument parsing for the hot-reset agent

use std::path::PathBuf;

use clap::Parser;

/// NPU hot-reset agent - recovers faulty accelerators without evicting the workload
#[derive(Debug, Parser)]
#[command(name = "hotreset")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/hotreset/config.yaml")]
    pub config: PathBuf,

    /// Node name (overrides config and NODE_NAME env)
    #[arg(long, env = "NODE_NAME")]
    pub node_name: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HOTRESET_LOG_LEVEL")]
    pub log_level: String,

    /// Output logs in JSON format
    #[arg(long, default_value = "false", env = "HOTRESET_LOG_JSON")]
    pub log_json: bool,

    /// Dry run mode - log reset commands but don't issue them
    #[arg(long, default_value = "false")]
    pub dry_run: bool,

    /// Run a single scan and exit
    #[arg(long)]
    pub once: bool,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
