use anyhow::{bail, Result};
use ralph_core::archive::{extract_job_zip, write_result_archive, ResultArchiveSpec};
use ralph_core::classify::{classify, Classification, Classifier, IterationStatus};
use ralph_core::config::EngineConfig;
use ralph_core::logging::log;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Minimal shell-word splitting for `CLAUDE_ARGS`: handles quoted segments
/// and whitespace separation, not full POSIX shell quoting.
fn split_args(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes: Option<char> = None;
    for c in raw.chars() {
        match in_quotes {
            Some(q) if c == q => in_quotes = None,
            Some(_) => current.push(c),
            None if c == '\'' || c == '"' => in_quotes = Some(c),
            None if c.is_whitespace() => {
                if !current.is_empty() {
                    args.push(std::mem::take(&mut current));
                }
            }
            None => current.push(c),
        }
    }
    if !current.is_empty() {
        args.push(current);
    }
    args
}

fn build_prompt(cfg: &EngineConfig, project_dir: &Path, task_prompt: &str, handoff: Option<&str>) -> String {
    let mut prompt = format!(
        "@{} @{}\n\n{}\n\nProject path: {}\nRalph rules:\n\
         1) Read the PRD and progress file\n\
         2) Find the next incomplete/highest-priority task and implement it\n\
         3) Run tests/typechecks/linters if present\n\
         4) Commit your changes\n\
         5) Append your progress to {}\n",
        cfg.prd_file,
        cfg.progress_file,
        task_prompt,
        project_dir.display(),
        cfg.progress_file,
    );

    if cfg.zip_chain_mode {
        prompt.push_str(&format!(
            "6) Before finishing, update {} with a self-contained instruction for the next iteration (assume no chat context)\n\
             7) ONLY DO ONE TASK AT A TIME\n\
             8) If the PRD is complete, output {}\n",
            cfg.next_instruction_file, cfg.complete_signal
        ));
        if let Some(h) = handoff.filter(|h| !h.is_empty()) {
            prompt.push_str("\nPrevious iteration handoff:\n");
            prompt.push_str(h);
            prompt.push('\n');
        }
    } else {
        prompt.push_str(&format!(
            "6) ONLY DO ONE TASK AT A TIME\n7) If the PRD is complete, output {}\n",
            cfg.complete_signal
        ));
    }

    prompt
}

/// Runs one assistant invocation, wrapped in the external `timeout` command
/// so expiry naturally yields rc=124 with no watcher thread needed. Combined
/// stdout+stderr go to `logs/iter-<N>.log`.
fn run_iteration_process(cfg: &EngineConfig, iteration: u32, log_dir: &Path, project_dir: &Path, prompt_text: &str) -> Result<i32> {
    let iter_log = log_dir.join(format!("iter-{iteration}.log"));
    log(&format!("[{}] iteration {iteration} starting", cfg.job_id));

    let log_file = fs::File::create(&iter_log)?;
    let log_file2 = log_file.try_clone()?;

    let mut cmd = Command::new("timeout");
    cmd.arg(cfg.iter_timeout_seconds.to_string());
    cmd.arg(&cfg.claude_cmd);
    cmd.args(split_args(&cfg.claude_args));
    if cfg.claude_input_mode != "stdin" {
        cmd.arg("-p").arg(prompt_text);
    }
    cmd.current_dir(project_dir);
    cmd.stdout(Stdio::from(log_file));
    cmd.stderr(Stdio::from(log_file2));

    let status = if cfg.claude_input_mode == "stdin" {
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(prompt_text.as_bytes());
        }
        child.wait()?
    } else {
        cmd.stdin(Stdio::null());
        cmd.status()?
    };

    Ok(status.code().unwrap_or(-1))
}

fn write_external_last_log(
    external_log_dir: &Path,
    job_id: &str,
    iteration_label: &str,
    status: &str,
    stop_reason: &str,
    iter_log: &Path,
) -> Result<()> {
    fs::create_dir_all(external_log_dir)?;
    let out_path = external_log_dir.join(format!("{job_id}.last.log"));
    let reason = if stop_reason.is_empty() { "none" } else { stop_reason };
    let header = format!(
        "job_id={job_id}\niteration={iteration_label}\nstatus={status}\nstop_reason={reason}\nupdated_at_unix={}\n\n",
        now_unix()
    );
    let body = fs::read_to_string(iter_log).unwrap_or_default();
    fs::write(out_path, header + &body)?;
    Ok(())
}

struct Workspace {
    project_dir: PathBuf,
    log_dir: PathBuf,
    result_staging: PathBuf,
    scratch_dir: PathBuf,
    work_root: PathBuf,
}

fn provision_workspace() -> Result<Workspace> {
    let work_root = PathBuf::from(ralph_core::env::env_str("WORK_ROOT", "/tmp/work"));
    let ws = Workspace {
        project_dir: work_root.join("project"),
        log_dir: work_root.join("logs"),
        result_staging: work_root.join("result"),
        scratch_dir: work_root.join("extract"),
        work_root,
    };
    fs::create_dir_all(&ws.project_dir)?;
    fs::create_dir_all(&ws.log_dir)?;
    fs::create_dir_all(&ws.result_staging)?;
    fs::create_dir_all(&ws.scratch_dir)?;
    Ok(ws)
}

pub fn run(cfg: &EngineConfig) -> Result<()> {
    let ws = provision_workspace()?;
    fs::create_dir_all(&cfg.output_dir)?;

    if !cfg.input_zip.is_file() {
        bail!("Input zip not found: {}", cfg.input_zip.display());
    }
    if !cfg.task_prompt_file.is_file() {
        bail!("Task prompt file not found: {}", cfg.task_prompt_file.display());
    }

    let classifier = Classifier::new();
    let start_ts = now_unix();

    if cfg.zip_chain_mode {
        run_zip_chain(cfg, &classifier, &ws, start_ts)
    } else {
        run_classic(cfg, &classifier, &ws, start_ts)
    }
}

fn run_classic(cfg: &EngineConfig, classifier: &Classifier, ws: &Workspace, start_ts: i64) -> Result<()> {
    log(&format!("[{}] unpacking input zip", cfg.job_id));
    extract_job_zip(&cfg.input_zip, &ws.project_dir, &ws.scratch_dir)?;

    let progress_path = ws.project_dir.join(&cfg.progress_file);
    let prd_path = ws.project_dir.join(&cfg.prd_file);
    if !progress_path.exists() {
        fs::write(&progress_path, "# Progress Log\n\n")?;
    }
    if !prd_path.exists() {
        fs::write(&prd_path, "# PRD\n\n- [ ] Define tasks\n")?;
    }

    let task_prompt = fs::read_to_string(&cfg.task_prompt_file)?;
    let prompt_text = build_prompt(cfg, &ws.project_dir, &task_prompt, None);
    fs::write(ws.work_root.join("prompt.txt"), &prompt_text)?;

    let mut iteration: u32 = 1;
    let mut attempted: u32 = 0;
    let mut consecutive_transient: u32 = 0;
    let mut status = IterationStatus::Done;
    let mut stop_reason = String::new();

    while iteration <= cfg.max_iterations {
        let remaining = cfg.max_seconds - (now_unix() - start_ts);
        if remaining <= cfg.soft_stop_margin_seconds {
            status = IterationStatus::StoppedRateLimit;
            stop_reason = "soft_budget_guard".into();
            log(&format!("[{}] soft stop due to global time budget", cfg.job_id));
            break;
        }

        attempted += 1;
        let rc = run_iteration_process(cfg, iteration, &ws.log_dir, &ws.project_dir, &prompt_text)?;
        let iter_log_path = ws.log_dir.join(format!("iter-{iteration}.log"));
        let log_text = fs::read_to_string(&iter_log_path).unwrap_or_default();

        let mut hard_stop = false;
        match classify(classifier, &log_text, rc, &cfg.complete_signal) {
            Classification::RateLimit => {
                status = IterationStatus::StoppedRateLimit;
                stop_reason = "rate_limit_detected".into();
                hard_stop = true;
                log(&format!("[{}] hard stop due to rate-limit signal", cfg.job_id));
            }
            Classification::ContextLimit => {
                status = IterationStatus::StoppedContextLimit;
                stop_reason = "context_limit_detected".into();
                hard_stop = true;
                log(&format!("[{}] hard stop due to context-limit signal", cfg.job_id));
            }
            Classification::Transient => {
                consecutive_transient += 1;
                log(&format!(
                    "[{}] transient upstream error detected ({consecutive_transient}/{})",
                    cfg.job_id, cfg.max_consecutive_transient_errors
                ));
                if consecutive_transient >= cfg.max_consecutive_transient_errors {
                    status = IterationStatus::Failed;
                    stop_reason = "too_many_transient_errors".into();
                    hard_stop = true;
                    log(&format!("[{}] failing after repeated transient errors", cfg.job_id));
                } else {
                    std::thread::sleep(Duration::from_secs(cfg.transient_backoff_seconds));
                    iteration += 1;
                    continue;
                }
            }
            Classification::Timeout => {
                log(&format!("[{}] continuing after iteration timeout", cfg.job_id));
                iteration += 1;
                continue;
            }
            Classification::AssistantFailed(code) => {
                status = IterationStatus::Failed;
                stop_reason = format!("assistant_exit_{code}");
                hard_stop = true;
                log(&format!("[{}] worker failed with rc={code}", cfg.job_id));
            }
            Classification::Complete => {
                status = IterationStatus::Done;
                stop_reason = "complete_signal".into();
                hard_stop = true;
                log(&format!("[{}] completion signal detected", cfg.job_id));
            }
            Classification::InProgress => {
                consecutive_transient = 0;
            }
        }

        if hard_stop {
            break;
        }
        iteration += 1;
    }

    // Preserved as documented: this only re-classifies the cap when `status`
    // is still at its pre-loop "done" default, so an assistant that already
    // completed and the loop later ran past the cap is mis-classified.
    if iteration > cfg.max_iterations && status == IterationStatus::Done {
        status = IterationStatus::StoppedIterationCap;
        stop_reason = "max_iterations_reached".into();
    }

    let summary_path = ws.project_dir.join("WORKER_SUMMARY.md");
    if !summary_path.exists() {
        let reason = if stop_reason.is_empty() { "none" } else { &stop_reason };
        fs::write(
            &summary_path,
            format!(
                "# Worker Summary\n\n- job_id: {}\n- status: {}\n- stop_reason: {}\n- iterations_attempted: {}\n",
                cfg.job_id,
                status.as_str(),
                reason,
                attempted
            ),
        )?;
    }

    write_result_archive(&ResultArchiveSpec {
        job_id: &cfg.job_id,
        output_dir: &cfg.output_dir,
        result_staging: &ws.result_staging,
        project_dir: &ws.project_dir,
        log_dir: &ws.log_dir,
        started_at_unix: start_ts,
        ended_at_unix: now_unix(),
        iterations_attempted: attempted,
        status: status.as_str(),
        stop_reason: &stop_reason,
        name_suffix: ".result",
    })?;

    fs::write(cfg.output_dir.join(format!("{}.status", cfg.job_id)), format!("{}\n", status.as_str()))?;
    log(&format!("[{}] completed with status={}", cfg.job_id, status.as_str()));
    Ok(())
}

fn run_zip_chain(cfg: &EngineConfig, classifier: &Classifier, ws: &Workspace, start_ts: i64) -> Result<()> {
    let task_prompt = fs::read_to_string(&cfg.task_prompt_file)?;
    let mut current_zip = cfg.input_zip.clone();
    let mut iteration: u32 = 1;
    let mut attempted: u32 = 0;
    let mut consecutive_transient: u32 = 0;
    let mut status = IterationStatus::Done;
    let mut stop_reason = String::new();

    log(&format!("[{}] zip-chain mode enabled", cfg.job_id));

    while iteration <= cfg.max_iterations {
        let remaining = cfg.max_seconds - (now_unix() - start_ts);
        if remaining <= cfg.soft_stop_margin_seconds {
            status = IterationStatus::StoppedRateLimit;
            stop_reason = "soft_budget_guard".into();
            log(&format!("[{}] soft stop due to global time budget", cfg.job_id));
            break;
        }

        log(&format!(
            "[{}] unpacking zip for iteration {iteration}: {}",
            cfg.job_id,
            current_zip.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
        ));
        extract_job_zip(&current_zip, &ws.project_dir, &ws.scratch_dir)?;

        let progress_path = ws.project_dir.join(&cfg.progress_file);
        let prd_path = ws.project_dir.join(&cfg.prd_file);
        let next_instruction_path = ws.project_dir.join(&cfg.next_instruction_file);
        if !progress_path.exists() {
            fs::write(&progress_path, "# Progress Log\n\n")?;
        }
        if !prd_path.exists() {
            fs::write(&prd_path, "# PRD\n\n- [ ] Define tasks\n")?;
        }
        let handoff = if next_instruction_path.exists() {
            fs::read_to_string(&next_instruction_path).unwrap_or_default().trim().to_string()
        } else {
            String::new()
        };

        let prompt_text = build_prompt(cfg, &ws.project_dir, &task_prompt, Some(handoff.as_str()));

        attempted += 1;
        let rc = run_iteration_process(cfg, iteration, &ws.log_dir, &ws.project_dir, &prompt_text)?;
        let iter_log_path = ws.log_dir.join(format!("iter-{iteration}.log"));
        let log_text = fs::read_to_string(&iter_log_path).unwrap_or_default();

        let classification = classify(classifier, &log_text, rc, &cfg.complete_signal);
        let mut iter_status = IterationStatus::InProgress;
        let mut iter_reason = String::new();
        let mut hard_stop = false;

        match classification {
            Classification::RateLimit => {
                iter_status = IterationStatus::StoppedRateLimit;
                iter_reason = "rate_limit_detected".into();
                hard_stop = true;
                log(&format!("[{}] hard stop due to rate-limit signal", cfg.job_id));
            }
            Classification::ContextLimit => {
                iter_status = IterationStatus::StoppedContextLimit;
                iter_reason = "context_limit_detected".into();
                hard_stop = true;
                log(&format!("[{}] hard stop due to context-limit signal", cfg.job_id));
            }
            Classification::Transient => {
                consecutive_transient += 1;
                log(&format!(
                    "[{}] transient upstream error detected ({consecutive_transient}/{})",
                    cfg.job_id, cfg.max_consecutive_transient_errors
                ));
                if consecutive_transient >= cfg.max_consecutive_transient_errors {
                    iter_status = IterationStatus::Failed;
                    iter_reason = "too_many_transient_errors".into();
                    hard_stop = true;
                    log(&format!("[{}] failing after repeated transient errors", cfg.job_id));
                }
            }
            Classification::AssistantFailed(code) => {
                iter_status = IterationStatus::Failed;
                iter_reason = format!("assistant_exit_{code}");
                hard_stop = true;
                log(&format!("[{}] worker failed with rc={code}", cfg.job_id));
            }
            // A bare timeout still gets a chance at the completion signal in
            // zip-chain mode, unlike classic mode which ignores it on rc=124.
            Classification::Timeout => {
                if log_text.contains(&cfg.complete_signal) {
                    iter_status = IterationStatus::Done;
                    iter_reason = "complete_signal".into();
                    hard_stop = true;
                    log(&format!("[{}] completion signal detected", cfg.job_id));
                } else {
                    consecutive_transient = 0;
                }
            }
            Classification::Complete => {
                iter_status = IterationStatus::Done;
                iter_reason = "complete_signal".into();
                hard_stop = true;
                log(&format!("[{}] completion signal detected", cfg.job_id));
            }
            Classification::InProgress => {
                consecutive_transient = 0;
            }
        }

        if !hard_stop && iteration == cfg.max_iterations {
            iter_status = IterationStatus::StoppedIterationCap;
            iter_reason = "max_iterations_reached".into();
            hard_stop = true;
        }

        status = iter_status;
        stop_reason = iter_reason.clone();

        let name_suffix = format!("_v{}", cfg.version_offset + iteration as i64);
        current_zip = write_result_archive(&ResultArchiveSpec {
            job_id: &cfg.job_id,
            output_dir: &cfg.output_dir,
            result_staging: &ws.result_staging,
            project_dir: &ws.project_dir,
            log_dir: &ws.log_dir,
            started_at_unix: start_ts,
            ended_at_unix: now_unix(),
            iterations_attempted: attempted,
            status: iter_status.as_str(),
            stop_reason: &iter_reason,
            name_suffix: &name_suffix,
        })?;
        fs::write(
            cfg.output_dir.join(format!("{}{name_suffix}.status", cfg.job_id)),
            format!("{}\n", iter_status.as_str()),
        )?;

        if let Some(ext_dir) = &cfg.external_log_dir {
            let _ = write_external_last_log(
                ext_dir,
                &cfg.job_id,
                &(cfg.version_offset + iteration as i64).to_string(),
                iter_status.as_str(),
                &iter_reason,
                &iter_log_path,
            );
        }

        if hard_stop {
            break;
        }

        if classification == Classification::Transient {
            std::thread::sleep(Duration::from_secs(cfg.transient_backoff_seconds));
        }

        iteration += 1;
    }

    fs::write(cfg.output_dir.join(format!("{}.status", cfg.job_id)), format!("{}\n", status.as_str()))?;
    log(&format!("[{}] completed with status={}", cfg.job_id, status.as_str()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_args_handles_quotes_and_whitespace() {
        assert_eq!(split_args("--print"), vec!["--print"]);
        assert_eq!(split_args("  --a   --b "), vec!["--a", "--b"]);
        assert_eq!(split_args("--msg 'hello world' --flag"), vec!["--msg", "hello world", "--flag"]);
    }

    #[test]
    fn classic_prompt_has_seven_rules_and_no_handoff_section() {
        let cfg = test_config(false);
        let prompt = build_prompt(&cfg, Path::new("/work/project"), "do the thing", None);
        assert!(prompt.contains("7) If the PRD is complete, output RALPH_COMPLETE"));
        assert!(!prompt.contains("Previous iteration handoff"));
        assert!(!prompt.contains("next_instruction.txt"));
    }

    #[test]
    fn zip_chain_prompt_has_eight_rules_and_handoff_when_present() {
        let cfg = test_config(true);
        let prompt = build_prompt(&cfg, Path::new("/work/project"), "do the thing", Some("pick up here"));
        assert!(prompt.contains("8) If the PRD is complete, output RALPH_COMPLETE"));
        assert!(prompt.contains("Previous iteration handoff:\npick up here"));
    }

    fn test_config(zip_chain_mode: bool) -> EngineConfig {
        EngineConfig {
            job_id: "job".into(),
            input_zip: PathBuf::from("/tmp/in.zip"),
            output_dir: PathBuf::from("/tmp/out"),
            task_prompt_file: PathBuf::from("/tmp/prompt.txt"),
            max_iterations: 8,
            max_seconds: 3600,
            iter_timeout_seconds: 600,
            soft_stop_margin_seconds: 90,
            claude_cmd: "claude".into(),
            claude_args: "--print".into(),
            claude_input_mode: "stdin".into(),
            complete_signal: "RALPH_COMPLETE".into(),
            max_consecutive_transient_errors: 4,
            transient_backoff_seconds: 20,
            zip_chain_mode,
            next_instruction_file: "next_instruction.txt".into(),
            prd_file: "PRD.md".into(),
            progress_file: "progress.txt".into(),
            version_offset: 0,
            external_log_dir: None,
        }
    }
}
