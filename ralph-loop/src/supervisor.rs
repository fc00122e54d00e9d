use anyhow::{Context, Result};
use ralph_core::config::LoopConfig;
use ralph_core::elapsed::format_elapsed;
use ralph_core::hook::run_post_sync_hook;
use ralph_core::job::Job;
use ralph_core::logging::JobLogger;
use ralph_core::markers::StateMarkers;
use ralph_core::sync::{copy_status_files, SyncCursor};
use std::fs;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

/// One job's full container lifecycle: provision, launch, stream logs and
/// artifacts to the sink while the container runs, classify, and clean up.
pub struct Supervisor<'a> {
    cfg: &'a LoopConfig,
    markers: &'a StateMarkers,
}

/// Env vars the container inherits verbatim if the orchestrator process has
/// them set — the IterationEngine contract (spec §6.3) beyond the four
/// required, job-specific ones.
const FORWARDED_ENGINE_VARS: &[&str] = &[
    "MAX_ITERATIONS",
    "MAX_SECONDS",
    "ITER_TIMEOUT_SECONDS",
    "SOFT_STOP_MARGIN_SECONDS",
    "CLAUDE_CMD",
    "CLAUDE_ARGS",
    "CLAUDE_INPUT_MODE",
    "COMPLETE_SIGNAL",
    "MAX_CONSECUTIVE_TRANSIENT_ERRORS",
    "TRANSIENT_BACKOFF_SECONDS",
    "ZIP_CHAIN_MODE",
    "NEXT_INSTRUCTION_FILE",
    "PRD_FILE",
    "PROGRESS_FILE",
];

impl<'a> Supervisor<'a> {
    pub fn new(cfg: &'a LoopConfig, markers: &'a StateMarkers) -> Self {
        Self { cfg, markers }
    }

    /// Runs one job to completion, returning whether it succeeded.
    pub fn run(&self, job: &Job) -> bool {
        match self.run_inner(job) {
            Ok(success) => success,
            Err(e) => {
                println!("[{}] supervisor error: {e}", job.id);
                self.markers.unmark_running(&job.id);
                let _ = self.markers.mark_failed(&job.id, self.cfg.keep_failed_marker);
                false
            }
        }
    }

    fn run_inner(&self, job: &Job) -> Result<bool> {
        let job_dir = self.cfg.work_dir.join(&job.id);
        let input_dir = job_dir.join("input");
        let output_dir = job_dir.join("output");
        let tmp_dir = job_dir.join("tmp");

        // 1. Provision workspace.
        fs::create_dir_all(&input_dir)?;
        fs::create_dir_all(&output_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        widen_permissions(&[&input_dir, &output_dir, &tmp_dir]);

        let mut logger = JobLogger::new(job.id.clone(), &self.cfg.sink_log_dir.join(format!("{}.transcript.log", job.id)))?;
        logger.log("provisioned workspace");

        // 2. Stage input.
        let staged_input = input_dir.join("input.zip");
        if let Err(e) = ralph_core::atomic::atomic_copy(&job.input_archive_path, &staged_input) {
            logger.log(&format!("input staging failed: {e}"));
            return Ok(false);
        }

        // 3. Mark running.
        self.markers.mark_running(&job.id)?;
        let started = Instant::now();

        // 4. Launch sandbox.
        let mut child = self.launch_container(job, &staged_input, &output_dir, &tmp_dir)?;
        logger.log("container launched");

        // 5. Concurrent sync loop.
        let mut cursor = SyncCursor::new();
        let tmp_logs = tmp_dir.join("logs");
        let combined_log = self.cfg.sink_log_dir.join(format!("{}.log", job.id));
        let status_path = self.cfg.sink_log_dir.join(format!("{}.status", job.id));

        let mut ticks_since_sync = 0u64;
        let exit_status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            std::thread::sleep(Duration::from_secs(1));
            ticks_since_sync += 1;
            if ticks_since_sync >= self.cfg.log_sync_seconds {
                ticks_since_sync = 0;
                self.sync_tick(&mut cursor, &tmp_logs, &output_dir, &combined_log, &status_path, started)?;
            }
        };

        // 6. Reap.
        let rc = exit_status.code().unwrap_or(-1);
        let elapsed = started.elapsed().as_secs();
        logger.log(&format!("container exited rc={rc} after {}", format_elapsed(elapsed)));

        // 7. Final sync.
        self.sync_tick(&mut cursor, &tmp_logs, &output_dir, &combined_log, &status_path, started)?;
        copy_status_files(&output_dir, &self.cfg.sink_output_dir)?;

        // 8. Classify.
        let worker_status = read_worker_status(&output_dir, &job.id);
        let success = rc == 0 && worker_status != "failed";

        // 9. Emit markers.
        self.markers.unmark_running(&job.id);
        if success {
            self.markers.mark_done(&job.id)?;
        } else {
            self.markers.mark_failed(&job.id, self.cfg.keep_failed_marker)?;
        }

        // 10. Final status line.
        let iterations = count_iteration_logs(&tmp_logs);
        let final_line = if success {
            format!("done | {iterations} iterations, {}", format_elapsed(elapsed))
        } else {
            format!(
                "failed (rc={rc}) | iter {iterations}, {}, worker_status={worker_status}",
                format_elapsed(elapsed)
            )
        };
        fs::write(&status_path, &final_line)?;
        logger.log(&final_line);

        // 11. Post-sync hook.
        if let Some(hook_cmd) = &self.cfg.post_sync_hook_cmd {
            let env_vars = vec![
                ("JOB_ID".to_string(), job.id.clone()),
                ("NC_OUTPUT_DIR".to_string(), self.cfg.sink_output_dir.to_string_lossy().to_string()),
                ("NC_LOG_DIR".to_string(), self.cfg.sink_log_dir.to_string_lossy().to_string()),
            ];
            match run_post_sync_hook(hook_cmd, &env_vars, self.cfg.post_sync_hook_timeout_seconds) {
                Ok(status) if !status.success() => logger.log(&format!("post-sync hook exited {status}")),
                Err(e) => logger.log(&format!("post-sync hook error: {e}")),
                _ => {}
            }
        }

        // 12. Cleanup.
        if !self.cfg.keep_work_dir.should_keep(success) {
            let _ = fs::remove_dir_all(&job_dir);
        }

        Ok(success)
    }

    fn launch_container(&self, job: &Job, staged_input: &Path, output_dir: &Path, tmp_dir: &Path) -> Result<Child> {
        let mut cmd = Command::new("docker");
        cmd.args(["run", "--rm", "--name", &format!("ralph-{}", job.id)]);
        cmd.arg("-v").arg(format!("{}:/job/input.zip:ro", staged_input.display()));
        cmd.arg("-v").arg(format!("{}:/job/task_prompt.txt:ro", self.cfg.task_prompt_path.display()));
        cmd.arg("-v").arg(format!("{}:/job/output", output_dir.display()));
        cmd.arg("-v").arg(format!("{}:/tmp/work", tmp_dir.display()));

        cmd.arg("-e").arg(format!("JOB_ID={}", job.id));
        cmd.arg("-e").arg("INPUT_ZIP=/job/input.zip");
        cmd.arg("-e").arg("OUTPUT_DIR=/job/output");
        cmd.arg("-e").arg("TASK_PROMPT_FILE=/job/task_prompt.txt");
        cmd.arg("-e").arg(format!("VERSION_OFFSET={}", job.version_offset));
        for name in FORWARDED_ENGINE_VARS {
            if let Ok(value) = std::env::var(name) {
                cmd.arg("-e").arg(format!("{name}={value}"));
            }
        }
        if let Ok(value) = std::env::var("EXTERNAL_LOG_DIR") {
            cmd.arg("-e").arg(format!("EXTERNAL_LOG_DIR={value}"));
        }

        cmd.arg(&self.cfg.container_image);
        // The container's own stdout/stderr carry nothing useful — every
        // observable artifact flows through the bind-mounted filesystem.
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        cmd.stdin(Stdio::null());

        cmd.spawn().context("spawning sandbox container")
    }

    fn sync_tick(
        &self,
        cursor: &mut SyncCursor,
        tmp_logs: &Path,
        work_output: &Path,
        combined_log: &Path,
        status_path: &Path,
        started: Instant,
    ) -> Result<()> {
        cursor.sync_iter_logs(tmp_logs, combined_log)?;
        cursor.sync_output_zips(work_output, &self.cfg.sink_output_dir)?;
        let iterations = count_iteration_logs(tmp_logs);
        let max_iterations = ralph_core::env::env_int("MAX_ITERATIONS", 8);
        let elapsed = format_elapsed(started.elapsed().as_secs());
        fs::write(
            status_path,
            format!("running | iter {iterations}/{max_iterations} | elapsed {elapsed}"),
        )?;
        Ok(())
    }
}

fn count_iteration_logs(tmp_logs: &Path) -> usize {
    fs::read_dir(tmp_logs)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| {
                    let name = e.file_name();
                    let name = name.to_string_lossy();
                    name.starts_with("iter-") && name.ends_with(".log")
                })
                .count()
        })
        .unwrap_or(0)
}

fn read_worker_status(output_dir: &Path, job_id: &str) -> String {
    fs::read_to_string(output_dir.join(format!("{job_id}.status")))
        .map(|s| s.trim().to_lowercase())
        .unwrap_or_default()
}

#[cfg(unix)]
fn widen_permissions(dirs: &[&Path]) {
    use std::os::unix::fs::PermissionsExt;
    for dir in dirs {
        if let Ok(meta) = fs::metadata(dir) {
            let mut perms = meta.permissions();
            perms.set_mode(0o777);
            let _ = fs::set_permissions(dir, perms);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_worker_status_defaults_to_empty_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(read_worker_status(dir.path(), "job"), "");
    }

    #[test]
    fn read_worker_status_lowercases_sticky_failure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job.status"), "FAILED\n").unwrap();
        assert_eq!(read_worker_status(dir.path(), "job"), "failed");
    }

    #[test]
    fn count_iteration_logs_only_counts_matching_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("iter-1.log"), b"").unwrap();
        fs::write(dir.path().join("iter-2.log"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        assert_eq!(count_iteration_logs(dir.path()), 2);
    }
}
