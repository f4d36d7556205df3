use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "bayd",
    about = "Sandbox orchestration server: durable sandboxes over a pool of containerized runtimes",
    version
)]
pub struct Cli {
    /// Path to the YAML config file. Defaults apply when omitted.
    #[arg(long, env = "BAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines instead of human-readable text.
    #[arg(long)]
    pub log_json: bool,
}
