use std::path::PathBuf;

use clap::Parser;

/// Quota metering and channel health daemon
#[derive(Debug, Parser)]
#[command(name = "relaymeter", about = "Quota metering and backend health for an LLM gateway")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "relaymeter.toml", env = "RELAYMETER_CONFIG")]
    pub config: PathBuf,

    /// Probe every channel once, print the report and exit
    #[arg(long)]
    pub sweep_once: bool,
}
