use anyhow::{Context, Result};
use std::process::Command;

/// Runs `cmd` through `sh -c`, bounded by the external `timeout` command
/// (the same idiom used for iteration and container execution — it yields
/// rc=124 on expiry rather than requiring a watcher thread). Failures are
/// returned to the caller to log; the caller must not propagate them.
pub fn run_post_sync_hook(cmd: &str, env_vars: &[(String, String)], timeout_seconds: u64) -> Result<std::process::ExitStatus> {
    let mut command = Command::new("timeout");
    command.arg(timeout_seconds.to_string());
    command.args(["sh", "-c", cmd]);
    for (k, v) in env_vars {
        command.env(k, v);
    }
    command.status().context("spawning post-sync hook")
}
