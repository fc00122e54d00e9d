use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub input_archive_path: PathBuf,
    pub version_offset: i64,
}

/// Scans `sink_output_dir` for `<id>_v<N>.zip` and returns the
/// highest-numbered match, or `(None, 0)` if none exist.
pub fn resume_policy(sink_output_dir: &Path, job_id: &str) -> (Option<PathBuf>, i64) {
    let prefix = format!("{job_id}_v");
    let mut best_n = 0i64;
    let mut best_path: Option<PathBuf> = None;

    let Ok(entries) = std::fs::read_dir(sink_output_dir) else {
        return (None, 0);
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(rest) = name.strip_prefix(&prefix) else {
            continue;
        };
        let Some(n_part) = rest.strip_suffix(".zip") else {
            continue;
        };
        let Ok(n) = n_part.parse::<i64>() else {
            continue;
        };
        if n > best_n {
            best_n = n;
            best_path = Some(entry.path());
        }
    }

    (best_path, best_n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn no_matches_returns_none_and_zero() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(resume_policy(dir.path(), "job"), (None, 0));
    }

    #[test]
    fn picks_highest_version() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["job_v3.zip", "job_v7.zip", "job_v1.zip", "other_v9.zip"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let (path, n) = resume_policy(dir.path(), "job");
        assert_eq!(n, 7);
        assert_eq!(path.unwrap().file_name().unwrap(), "job_v7.zip");
    }

    #[test]
    fn ignores_non_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("job_vfoo.zip"), b"").unwrap();
        assert_eq!(resume_policy(dir.path(), "job"), (None, 0));
    }
}
