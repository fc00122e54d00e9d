use std::path::Path;

/// Truthy tokens accepted by `env_bool`, case-insensitively.
const TRUTHY: [&str; 5] = ["1", "true", "yes", "y", "on"];

pub fn env_int(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v.parse().unwrap_or(default),
        _ => default,
    }
}

pub fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => TRUTHY.contains(&v.trim().to_lowercase().as_str()),
        _ => default,
    }
}

pub fn env_str(name: &str, default: &str) -> String {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

pub fn env_opt_str(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

/// Loads `KEY=VALUE` lines from `path` into the process environment.
///
/// `#` comments and blank lines are ignored. A key already set in the process
/// environment is never overwritten.
pub fn load_env_file(path: &Path) {
    let Ok(text) = std::fs::read_to_string(path) else {
        return;
    };
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || std::env::var(key).is_ok() {
            continue;
        }
        // SAFETY: called once at process startup before any worker threads exist.
        unsafe {
            std::env::set_var(key, value);
        }
    }
}
