use crate::atomic::atomic_copy;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Supervisor-owned sync state: per-file byte cursors into the combined log,
/// and the set of output archive filenames already copied to the sink.
#[derive(Default)]
pub struct SyncCursor {
    log_cursors: HashMap<String, u64>,
    synced_archives: HashSet<String>,
}

impl SyncCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends any new bytes from `<tmp_logs_dir>/iter-*.log` (lexicographic
    /// filename order — NOT numeric order) into `combined_log_path`,
    /// prepending a header the first time each file is seen. Missing
    /// `tmp_logs_dir` is a silent no-op.
    pub fn sync_iter_logs(&mut self, tmp_logs_dir: &Path, combined_log_path: &Path) -> Result<()> {
        let Ok(entries) = fs::read_dir(tmp_logs_dir) else {
            return Ok(());
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("iter-") && n.ends_with(".log"))
            .collect();
        names.sort();

        if names.is_empty() {
            return Ok(());
        }

        // Opened lazily: a tick where every file is still at its last-seen
        // size (or brand new but zero bytes) must not create the combined
        // log file at all.
        let mut out: Option<fs::File> = None;

        for name in names {
            let path = tmp_logs_dir.join(&name);
            let size = fs::metadata(&path)?.len();
            let cursor = *self.log_cursors.get(&name).unwrap_or(&0);
            let first_sighting = !self.log_cursors.contains_key(&name);

            if size > cursor {
                let f = match out.as_mut() {
                    Some(f) => f,
                    None => {
                        if let Some(parent) = combined_log_path.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        out = Some(fs::OpenOptions::new().create(true).append(true).open(combined_log_path)?);
                        out.as_mut().unwrap()
                    }
                };
                if first_sighting {
                    let label = iteration_label(&name);
                    writeln!(f, "=== Iteration {label} started {} ===", utc_now_stamp())?;
                }
                let bytes = fs::read(&path)?;
                let text = String::from_utf8_lossy(&bytes[cursor as usize..]);
                f.write_all(text.as_bytes())?;
                self.log_cursors.insert(name, size);
            }
        }
        Ok(())
    }

    /// Copies any new, non-`.partial.zip` archive from `work_output_dir` to
    /// `sink_output_dir`, returning the filenames copied this call.
    pub fn sync_output_zips(&mut self, work_output_dir: &Path, sink_output_dir: &Path) -> Result<Vec<String>> {
        let Ok(entries) = fs::read_dir(work_output_dir) else {
            return Ok(Vec::new());
        };
        let mut copied = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(".zip") || name.ends_with(".partial.zip") {
                continue;
            }
            if self.synced_archives.contains(&name) {
                continue;
            }
            atomic_copy(&entry.path(), &sink_output_dir.join(&name))?;
            self.synced_archives.insert(name.clone());
            copied.push(name);
        }
        Ok(copied)
    }
}

/// Copies every `*.status` file from `work_output_dir` to `sink_output_dir`.
/// Called once, in the supervisor's final sync pass.
pub fn copy_status_files(work_output_dir: &Path, sink_output_dir: &Path) -> Result<()> {
    let Ok(entries) = fs::read_dir(work_output_dir) else {
        return Ok(());
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".status") {
            atomic_copy(&entry.path(), &sink_output_dir.join(&name))?;
        }
    }
    Ok(())
}

fn iteration_label(filename: &str) -> String {
    filename
        .strip_prefix("iter-")
        .and_then(|s| s.strip_suffix(".log"))
        .unwrap_or(filename)
        .to_string()
}

fn utc_now_stamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}
