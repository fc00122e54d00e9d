use std::fs;
use std::path::{Path, PathBuf};

/// Resolves a trigger-file setting: an empty `rel` disables the gate; a
/// relative path resolves against `base_dir` (an explicit `*_TRIGGER_DIR`
/// override, or the orchestrator's script directory as the fallback).
pub fn resolve_path(rel: Option<&str>, base_dir: Option<&Path>, script_dir: &Path) -> Option<PathBuf> {
    let rel = rel?.trim();
    if rel.is_empty() {
        return None;
    }
    let p = Path::new(rel);
    if p.is_absolute() {
        return Some(p.to_path_buf());
    }
    let base = base_dir.unwrap_or(script_dir);
    Some(base.join(p))
}

pub fn read_float(path: &Path) -> f64 {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0.0)
}

pub fn write_float(path: &Path, value: f64) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{value}\n"))
}

fn trigger_state_file(persistent_trigger: &Path, state_dir: &Path) -> PathBuf {
    let name = persistent_trigger
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    state_dir.join("trigger").join(format!("{name}.mtime"))
}

fn mtime_secs(path: &Path) -> Option<f64> {
    let meta = fs::metadata(path).ok()?;
    let modified = meta.modified().ok()?;
    let duration = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(duration.as_secs_f64())
}

/// Level-triggered gate: fires when the trigger file's mtime has strictly
/// increased since the last `mark_persistent_trigger_handled` call.
pub fn should_fire_persistent_trigger(persistent_trigger: &Path, state_dir: &Path) -> bool {
    if !persistent_trigger.exists() {
        return false;
    }
    let state_file = trigger_state_file(persistent_trigger, state_dir);
    let last_handled = read_float(&state_file);
    match mtime_secs(persistent_trigger) {
        Some(current) => current > last_handled,
        None => false,
    }
}

pub fn mark_persistent_trigger_handled(persistent_trigger: &Path, state_dir: &Path) {
    let Some(current) = mtime_secs(persistent_trigger) else {
        return;
    };
    let state_file = trigger_state_file(persistent_trigger, state_dir);
    let _ = write_float(&state_file, current);
}
