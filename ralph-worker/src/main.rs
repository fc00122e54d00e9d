mod engine;

use ralph_core::config::EngineConfig;
use ralph_core::logging::log;

fn main() {
    let config = match EngineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    // The contract is: exit 0 unless required env was missing. A failed job
    // still writes its status file and exits cleanly so the supervisor can
    // read the outcome from disk rather than from the process exit code.
    if let Err(e) = engine::run(&config) {
        log(&format!("[{}] iteration engine error: {e}", config.job_id));
    }
}
