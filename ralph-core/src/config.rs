use crate::env::{env_bool, env_int, env_opt_str, env_str};
use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepWorkDir {
    Always,
    Never,
    OnFailure,
}

impl KeepWorkDir {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "always" => KeepWorkDir::Always,
            "never" => KeepWorkDir::Never,
            _ => KeepWorkDir::OnFailure,
        }
    }

    pub fn should_keep(&self, succeeded: bool) -> bool {
        match self {
            KeepWorkDir::Always => true,
            KeepWorkDir::Never => false,
            KeepWorkDir::OnFailure => !succeeded,
        }
    }
}

/// All orchestrator (Loop + Supervisor) configuration, read once at startup
/// per Design Notes' call to concentrate scattered env reads into one
/// immutable struct.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub input_dir: PathBuf,
    pub sink_output_dir: PathBuf,
    pub sink_log_dir: PathBuf,
    pub state_dir: PathBuf,
    pub work_dir: PathBuf,
    pub task_prompt_path: PathBuf,

    pub poll_seconds: u64,
    pub max_parallel: usize,
    pub log_sync_seconds: u64,

    pub keep_failed_marker: bool,
    pub stop_loop_on_job_failure: bool,
    pub keep_work_dir: KeepWorkDir,
    pub consume_trigger: bool,

    pub start_trigger_file: Option<String>,
    pub start_trigger_dir: Option<String>,
    pub persistent_trigger_file: Option<String>,
    pub persistent_trigger_dir: Option<String>,

    pub strict_single_zip_contract: bool,
    pub strict_allow_versioned_inputs: bool,

    pub post_sync_hook_cmd: Option<String>,
    pub post_sync_hook_timeout_seconds: u64,

    pub container_image: String,
}

impl LoopConfig {
    pub fn from_env(script_dir: &Path) -> Self {
        Self {
            input_dir: PathBuf::from(env_str("INPUT_DIR", &script_dir.join("input").to_string_lossy())),
            sink_output_dir: PathBuf::from(env_str("OUTPUT_DIR", &script_dir.join("output").to_string_lossy())),
            sink_log_dir: PathBuf::from(env_str(
                "NC_LOG_DIR",
                &env_str("OUTPUT_DIR", &script_dir.join("output").to_string_lossy()),
            )),
            state_dir: PathBuf::from(env_str("STATE_DIR", &script_dir.join(".state").to_string_lossy())),
            work_dir: PathBuf::from(env_str("WORK_DIR", &script_dir.join(".work").to_string_lossy())),
            task_prompt_path: PathBuf::from(env_str(
                "TASK_PROMPT_FILE",
                &script_dir.join("task_prompt.txt").to_string_lossy(),
            )),
            poll_seconds: env_int("POLL_SECONDS", 20) as u64,
            max_parallel: env_int("MAX_PARALLEL", 1).max(1) as usize,
            log_sync_seconds: env_int("LOG_SYNC_SECONDS", 10) as u64,
            keep_failed_marker: env_bool("KEEP_FAILED_MARKER", true),
            stop_loop_on_job_failure: env_bool("STOP_LOOP_ON_JOB_FAILURE", false),
            keep_work_dir: KeepWorkDir::parse(&env_str("KEEP_WORK_DIR", "on_failure")),
            consume_trigger: env_bool("CONSUME_TRIGGER", true),
            start_trigger_file: env_opt_str("START_TRIGGER_FILE"),
            start_trigger_dir: env_opt_str("START_TRIGGER_DIR"),
            persistent_trigger_file: env_opt_str("PERSISTENT_TRIGGER_FILE"),
            persistent_trigger_dir: env_opt_str("PERSISTENT_TRIGGER_DIR"),
            strict_single_zip_contract: env_bool("STRICT_SINGLE_ZIP_CONTRACT", false),
            strict_allow_versioned_inputs: env_bool("STRICT_ALLOW_VERSIONED_INPUTS", false),
            post_sync_hook_cmd: env_opt_str("POST_SYNC_HOOK_CMD"),
            post_sync_hook_timeout_seconds: env_int("POST_SYNC_HOOK_TIMEOUT_SECONDS", 180) as u64,
            container_image: env_str("WORKER_IMAGE", "ralph-worker"),
        }
    }
}

/// The IterationEngine's own environment contract (spec §6.3). Constructed
/// inside the sandbox container; missing required fields are fatal.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub job_id: String,
    pub input_zip: PathBuf,
    pub output_dir: PathBuf,
    pub task_prompt_file: PathBuf,

    pub max_iterations: u32,
    pub max_seconds: i64,
    pub iter_timeout_seconds: u64,
    pub soft_stop_margin_seconds: i64,
    pub claude_cmd: String,
    pub claude_args: String,
    pub claude_input_mode: String,
    pub complete_signal: String,
    pub max_consecutive_transient_errors: u32,
    pub transient_backoff_seconds: u64,
    pub zip_chain_mode: bool,
    pub next_instruction_file: String,
    pub prd_file: String,
    pub progress_file: String,
    pub version_offset: i64,
    pub external_log_dir: Option<PathBuf>,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        let require = |name: &str| -> Result<String> {
            match std::env::var(name) {
                Ok(v) if !v.is_empty() => Ok(v),
                _ => bail!("Missing required env: {name}"),
            }
        };

        Ok(Self {
            job_id: require("JOB_ID")?,
            input_zip: PathBuf::from(require("INPUT_ZIP")?),
            output_dir: PathBuf::from(require("OUTPUT_DIR")?),
            task_prompt_file: PathBuf::from(require("TASK_PROMPT_FILE")?),
            max_iterations: env_int("MAX_ITERATIONS", 8) as u32,
            max_seconds: env_int("MAX_SECONDS", 3600),
            iter_timeout_seconds: env_int("ITER_TIMEOUT_SECONDS", 600) as u64,
            soft_stop_margin_seconds: env_int("SOFT_STOP_MARGIN_SECONDS", 90),
            claude_cmd: env_str("CLAUDE_CMD", "claude"),
            claude_args: env_str("CLAUDE_ARGS", "--print"),
            claude_input_mode: env_str("CLAUDE_INPUT_MODE", "stdin"),
            complete_signal: env_str("COMPLETE_SIGNAL", "RALPH_COMPLETE"),
            max_consecutive_transient_errors: env_int("MAX_CONSECUTIVE_TRANSIENT_ERRORS", 4) as u32,
            transient_backoff_seconds: env_int("TRANSIENT_BACKOFF_SECONDS", 20) as u64,
            zip_chain_mode: env_bool("ZIP_CHAIN_MODE", false),
            next_instruction_file: env_str("NEXT_INSTRUCTION_FILE", "next_instruction.txt"),
            prd_file: env_str("PRD_FILE", "PRD.md"),
            progress_file: env_str("PROGRESS_FILE", "progress.txt"),
            version_offset: env_int("VERSION_OFFSET", 0),
            external_log_dir: env_opt_str("EXTERNAL_LOG_DIR").map(PathBuf::from),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_work_dir_policy_matrix() {
        assert!(KeepWorkDir::Always.should_keep(true));
        assert!(KeepWorkDir::Always.should_keep(false));
        assert!(!KeepWorkDir::Never.should_keep(true));
        assert!(!KeepWorkDir::Never.should_keep(false));
        assert!(!KeepWorkDir::OnFailure.should_keep(true));
        assert!(KeepWorkDir::OnFailure.should_keep(false));
    }

    #[test]
    fn keep_work_dir_parses_unknown_as_on_failure() {
        assert_eq!(KeepWorkDir::parse("bogus"), KeepWorkDir::OnFailure);
        assert_eq!(KeepWorkDir::parse("ALWAYS"), KeepWorkDir::Always);
    }
}
