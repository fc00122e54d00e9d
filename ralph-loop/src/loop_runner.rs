use anyhow::{bail, Result};
use ralph_core::config::LoopConfig;
use ralph_core::job::{resume_policy, Job};
use ralph_core::markers::{ClaimOutcome, StateMarkers};
use ralph_core::trigger::{
    mark_persistent_trigger_handled, resolve_path, should_fire_persistent_trigger,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use crate::supervisor::Supervisor;

/// Outcome of one poll tick, for tests and the `--once` CLI flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    GateClosed,
    NoParallelSlots,
    NoWork,
    Dispatched,
}

pub struct OrchestratorLoop {
    cfg: LoopConfig,
    markers: StateMarkers,
    script_dir: PathBuf,
}

impl OrchestratorLoop {
    pub fn new(cfg: LoopConfig, script_dir: PathBuf) -> Result<Self> {
        let markers = StateMarkers::new(cfg.state_dir.clone());
        markers.ensure_dirs()?;
        fs::create_dir_all(&cfg.input_dir)?;
        fs::create_dir_all(&cfg.sink_output_dir)?;
        fs::create_dir_all(&cfg.sink_log_dir)?;
        fs::create_dir_all(&cfg.work_dir)?;
        ensure_default_prompt(&cfg.task_prompt_path)?;
        Ok(Self { cfg, markers, script_dir })
    }

    fn start_trigger_path(&self) -> Option<PathBuf> {
        resolve_path(
            self.cfg.start_trigger_file.as_deref(),
            self.cfg.start_trigger_dir.as_deref().map(Path::new),
            &self.script_dir,
        )
    }

    fn persistent_trigger_path(&self) -> Option<PathBuf> {
        resolve_path(
            self.cfg.persistent_trigger_file.as_deref(),
            self.cfg.persistent_trigger_dir.as_deref().map(Path::new),
            &self.script_dir,
        )
    }

    fn gates_armed(&self) -> bool {
        let start = self.start_trigger_path();
        let persistent = self.persistent_trigger_path();
        if start.is_none() && persistent.is_none() {
            return true;
        }
        let start_armed = start.as_deref().is_some_and(Path::exists);
        let persistent_armed = persistent
            .as_deref()
            .is_some_and(|p| should_fire_persistent_trigger(p, &self.cfg.state_dir));
        start_armed || persistent_armed
    }

    /// Deletes the start-trigger file (edge-consumed) if `consume_trigger` is
    /// set, whether because a dispatch happened or because a poll found the
    /// queue empty (drain-consume).
    fn consume_start_trigger(&self) {
        if !self.cfg.consume_trigger {
            return;
        }
        if let Some(path) = self.start_trigger_path() {
            let _ = fs::remove_file(path);
        }
    }

    fn mark_persistent_trigger_consumed(&self) {
        if let Some(path) = self.persistent_trigger_path() {
            mark_persistent_trigger_handled(&path, &self.cfg.state_dir);
        }
    }

    fn list_archives(&self) -> Vec<PathBuf> {
        let mut archives: Vec<PathBuf> = fs::read_dir(&self.cfg.input_dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "zip"))
                    .collect()
            })
            .unwrap_or_default();
        archives.sort();
        archives
    }

    fn job_for_archive(&self, archive: &Path) -> Job {
        let id = archive.file_stem().unwrap_or_default().to_string_lossy().to_string();
        let (resumed, version_offset) = resume_policy(&self.cfg.sink_output_dir, &id);
        Job {
            id,
            input_archive_path: resumed.unwrap_or_else(|| archive.to_path_buf()),
            version_offset,
        }
    }

    fn dispatch(&self, job: &Job) -> bool {
        let supervisor = Supervisor::new(&self.cfg, &self.markers);
        supervisor.run(job)
    }

    /// One full poll tick: gate check, parallelism cap, archive listing,
    /// strict-mode branch or normal claim-dispatch-release cycle. Bails
    /// (fatal, exit 1 at the `main` boundary) on a strict-mode violation or
    /// a job failure when `stop_loop_on_job_failure` is set.
    pub fn run_once_tick(&self) -> Result<TickOutcome> {
        if !self.gates_armed() {
            return Ok(TickOutcome::GateClosed);
        }

        if self.markers.running_count()? >= self.cfg.max_parallel {
            return Ok(TickOutcome::NoParallelSlots);
        }

        let archives = self.list_archives();

        if self.cfg.strict_single_zip_contract {
            return self.run_strict_tick(&archives);
        }

        let mut dispatched_any = false;
        for archive in &archives {
            let id = archive.file_stem().unwrap_or_default().to_string_lossy().to_string();
            if self.markers.is_terminal(&id) {
                continue;
            }
            match self.markers.claim(&id, archive)? {
                ClaimOutcome::AlreadyClaimed => continue,
                ClaimOutcome::Claimed => {}
            }

            let job = self.job_for_archive(archive);
            let success = self.dispatch(&job);
            self.markers.release_claim(&id);
            dispatched_any = true;
            self.consume_start_trigger();
            self.mark_persistent_trigger_consumed();
            if !success && self.cfg.stop_loop_on_job_failure {
                bail!("job '{}' failed and stop_loop_on_job_failure is set", job.id);
            }
        }

        if dispatched_any {
            Ok(TickOutcome::Dispatched)
        } else {
            self.consume_start_trigger();
            Ok(TickOutcome::NoWork)
        }
    }

    /// Strict single-ZIP mode: the drop-folder must hold exactly one
    /// archive; no claim link is used, and a violation is fatal (exit 1).
    fn run_strict_tick(&self, archives: &[PathBuf]) -> Result<TickOutcome> {
        if archives.is_empty() {
            self.consume_start_trigger();
            return Ok(TickOutcome::NoWork);
        }
        if archives.len() > 1 {
            bail!(
                "strict_single_zip_contract violated: {} archives present in {}",
                archives.len(),
                self.cfg.input_dir.display()
            );
        }
        let archive = &archives[0];
        let name = archive.file_name().unwrap_or_default().to_string_lossy();
        if name.contains("_v") && !self.cfg.strict_allow_versioned_inputs {
            bail!("strict_single_zip_contract violated: versioned input '{name}' not allowed");
        }

        let id = archive.file_stem().unwrap_or_default().to_string_lossy().to_string();
        if self.markers.is_terminal(&id) {
            return Ok(TickOutcome::NoWork);
        }

        let job = self.job_for_archive(archive);
        let success = self.dispatch(&job);
        self.consume_start_trigger();
        self.mark_persistent_trigger_consumed();
        if !success && self.cfg.stop_loop_on_job_failure {
            bail!("job '{}' failed and stop_loop_on_job_failure is set", job.id);
        }
        Ok(TickOutcome::Dispatched)
    }

    pub fn run(&self, once: bool) -> Result<()> {
        self.print_banner();
        loop {
            let outcome = self.run_once_tick()?;
            if once {
                return Ok(());
            }
            if outcome != TickOutcome::Dispatched {
                sleep(Duration::from_secs(self.cfg.poll_seconds));
            }
        }
    }

    fn print_banner(&self) {
        println!("ralph-loop");
        println!("Input: {}", self.cfg.input_dir.display());
        println!("Sink: {}", self.cfg.sink_output_dir.display());
        println!("Poll interval: {}s", self.cfg.poll_seconds);
        println!("Max parallel: {}", self.cfg.max_parallel);
        println!("Started: {}", chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
        println!();
    }
}

/// Seeds a short placeholder Ralph prompt if the operator hasn't supplied one
/// yet. Content is a stand-in, not a design decision — operators are
/// expected to replace it with their own task.
fn ensure_default_prompt(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(
        path,
        "Work through the PRD one task at a time, committing as you go.\n",
    )?;
    Ok(())
}
