use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};

fn tmp_sibling(dst: &Path) -> PathBuf {
    let mut name = dst.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    dst.with_file_name(name)
}

/// Copies `src` to `dst` via a `.tmp` sibling and atomic rename, so a reader
/// never observes a partially-written `dst`.
pub fn atomic_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = tmp_sibling(dst);
    fs::copy(src, &tmp)?;
    fs::rename(&tmp, dst)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_basic_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"hello").unwrap();
        atomic_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
        assert!(!tmp_sibling(&dst).exists());
    }

    #[test]
    fn creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("nested/deep/dst.txt");
        fs::write(&src, b"hello").unwrap();
        atomic_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"hello");
    }

    #[test]
    fn idempotent_repeat_leaves_identical_dst_and_no_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&src, b"v1").unwrap();
        atomic_copy(&src, &dst).unwrap();
        atomic_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());
        assert!(!tmp_sibling(&dst).exists());
    }

    #[test]
    fn overwrites_existing_dst() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("dst.txt");
        fs::write(&dst, b"old").unwrap();
        fs::write(&src, b"new").unwrap();
        atomic_copy(&src, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"new");
    }
}
