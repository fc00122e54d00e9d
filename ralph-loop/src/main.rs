mod cli;
mod loop_runner;
mod supervisor;

use clap::Parser;
use cli::Cli;
use loop_runner::OrchestratorLoop;
use ralph_core::config::LoopConfig;
use std::path::PathBuf;

fn main() {
    let cli = Cli::parse();

    let script_dir = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."));

    if let Some(env_file) = &cli.env_file {
        ralph_core::env::load_env_file(env_file);
    } else {
        ralph_core::env::load_env_file(&script_dir.join(".env"));
    }

    let cfg = LoopConfig::from_env(&script_dir);

    let orchestrator = match OrchestratorLoop::new(cfg, script_dir) {
        Ok(o) => o,
        Err(e) => {
            eprintln!("failed to initialize orchestrator: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = orchestrator.run(cli.once) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}
