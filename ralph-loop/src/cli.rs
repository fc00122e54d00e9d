use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "ralph-loop",
    version,
    about = "Overnight job orchestrator: watches a drop-folder and supervises sandboxed iteration runs"
)]
pub struct Cli {
    /// Path to a `KEY=VALUE` env file loaded before the rest of configuration
    /// is read. Existing process environment always wins.
    #[arg(long)]
    pub env_file: Option<PathBuf>,

    /// Run a single poll tick and exit instead of looping forever.
    #[arg(long)]
    pub once: bool,
}
