use anyhow::{Context, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

/// Presence-only state markers over a `state_dir`: `queue/<id>.claimed`,
/// `running/<id>`, `done/<id>`, `failed/<id>`. No in-memory scheduling
/// state exists; every check re-reads the filesystem.
pub struct StateMarkers {
    state_dir: PathBuf,
}

impl StateMarkers {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for sub in ["queue", "running", "done", "failed", "trigger"] {
            fs::create_dir_all(self.state_dir.join(sub))?;
        }
        Ok(())
    }

    fn queue_dir(&self) -> PathBuf {
        self.state_dir.join("queue")
    }
    fn running_dir(&self) -> PathBuf {
        self.state_dir.join("running")
    }
    fn done_dir(&self) -> PathBuf {
        self.state_dir.join("done")
    }
    fn failed_dir(&self) -> PathBuf {
        self.state_dir.join("failed")
    }

    /// Atomically reserves `job_id` by symlinking `queue/<id>.claimed` to
    /// `archive_path`. A claim with no matching `running/<id>` marker is
    /// stale (the orchestrator crashed mid-claim) and is removed, then
    /// retried once.
    pub fn claim(&self, job_id: &str, archive_path: &Path) -> Result<ClaimOutcome> {
        let claim_path = self.queue_dir().join(format!("{job_id}.claimed"));
        match self.try_symlink(&claim_path, archive_path) {
            Ok(()) => Ok(ClaimOutcome::Claimed),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.running_dir().join(job_id).exists() {
                    return Ok(ClaimOutcome::AlreadyClaimed);
                }
                // Stale claim: orchestrator died between claim and running-marker.
                let _ = fs::remove_file(&claim_path);
                match self.try_symlink(&claim_path, archive_path) {
                    Ok(()) => Ok(ClaimOutcome::Claimed),
                    Err(_) => Ok(ClaimOutcome::AlreadyClaimed),
                }
            }
            Err(e) => Err(e).context("creating claim symlink"),
        }
    }

    #[cfg(unix)]
    fn try_symlink(&self, link: &Path, target: &Path) -> std::io::Result<()> {
        std::os::unix::fs::symlink(target, link)
    }

    pub fn release_claim(&self, job_id: &str) {
        let claim_path = self.queue_dir().join(format!("{job_id}.claimed"));
        let _ = fs::remove_file(claim_path);
    }

    pub fn running_count(&self) -> Result<usize> {
        let dir = self.running_dir();
        let count = fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_file())
            .count();
        Ok(count)
    }

    pub fn mark_running(&self, job_id: &str) -> Result<()> {
        fs::write(self.running_dir().join(job_id), b"")?;
        Ok(())
    }

    pub fn unmark_running(&self, job_id: &str) {
        let _ = fs::remove_file(self.running_dir().join(job_id));
    }

    pub fn mark_done(&self, job_id: &str) -> Result<()> {
        fs::write(self.done_dir().join(job_id), b"")?;
        Ok(())
    }

    /// Creates `failed/<id>` when `keep` is true; otherwise ensures it is absent.
    pub fn mark_failed(&self, job_id: &str, keep: bool) -> Result<()> {
        let path = self.failed_dir().join(job_id);
        if keep {
            fs::write(path, b"")?;
        } else {
            let _ = fs::remove_file(path);
        }
        Ok(())
    }

    pub fn is_terminal(&self, job_id: &str) -> bool {
        self.done_dir().join(job_id).exists() || self.failed_dir().join(job_id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers_in(dir: &Path) -> StateMarkers {
        let m = StateMarkers::new(dir);
        m.ensure_dirs().unwrap();
        m
    }

    #[test]
    fn claim_succeeds_once() {
        let dir = tempfile::tempdir().unwrap();
        let m = markers_in(dir.path());
        let archive = dir.path().join("job.zip");
        fs::write(&archive, b"").unwrap();

        assert_eq!(m.claim("job", &archive).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn claim_fails_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let m = markers_in(dir.path());
        let archive = dir.path().join("job.zip");
        fs::write(&archive, b"").unwrap();

        assert_eq!(m.claim("job", &archive).unwrap(), ClaimOutcome::Claimed);
        m.mark_running("job").unwrap();
        assert_eq!(m.claim("job", &archive).unwrap(), ClaimOutcome::AlreadyClaimed);
    }

    #[test]
    fn stale_claim_without_running_marker_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let m = markers_in(dir.path());
        let archive = dir.path().join("job.zip");
        fs::write(&archive, b"").unwrap();

        assert_eq!(m.claim("job", &archive).unwrap(), ClaimOutcome::Claimed);
        // Simulate crash: claim exists, running marker never created.
        assert_eq!(m.claim("job", &archive).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn single_state_invariant_at_termination() {
        let dir = tempfile::tempdir().unwrap();
        let m = markers_in(dir.path());
        m.mark_done("job").unwrap();
        assert!(m.is_terminal("job"));
        assert!(!dir.path().join("failed/job").exists());
    }

    #[test]
    fn mark_failed_respects_keep_flag() {
        let dir = tempfile::tempdir().unwrap();
        let m = markers_in(dir.path());
        m.mark_failed("job", false).unwrap();
        assert!(!dir.path().join("failed/job").exists());
        m.mark_failed("job", true).unwrap();
        assert!(dir.path().join("failed/job").exists());
    }

    #[test]
    fn running_count_counts_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let m = markers_in(dir.path());
        m.mark_running("a").unwrap();
        m.mark_running("b").unwrap();
        assert_eq!(m.running_count().unwrap(), 2);
        m.unmark_running("a");
        assert_eq!(m.running_count().unwrap(), 1);
    }
}
