use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Recursively copies the *contents* of `src` into `dst` (not `src` itself),
/// matching the worker's `copy_tree_contents`: files are copied with
/// metadata, directories merged rather than replaced.
pub fn copy_tree_contents(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src).with_context(|| format!("reading {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree_contents(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

fn list_files_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                walk(&path, out)?;
            } else {
                out.push(path);
            }
        }
        Ok(())
    }
    let mut out = Vec::new();
    walk(dir, &mut out)?;
    out.sort();
    Ok(out)
}

/// Zips the contents of `src_dir` (paths relative to `src_dir`, deterministic
/// sorted order) into `zip_path`.
pub fn zip_dir(src_dir: &Path, zip_path: &Path) -> Result<()> {
    let file = fs::File::create(zip_path)?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for path in list_files_sorted(src_dir)? {
        let rel = path.strip_prefix(src_dir)?.to_string_lossy().replace('\\', "/");
        writer.start_file(rel, options)?;
        let mut f = fs::File::open(&path)?;
        io::copy(&mut f, &mut writer)?;
    }
    writer.finish()?;
    Ok(())
}

/// Extracts every entry of `zip_path` under `dest`.
pub fn extract_zip_to(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = fs::File::open(zip_path).with_context(|| format!("opening {}", zip_path.display()))?;
    let mut archive = zip::ZipArchive::new(file)?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(name) = entry.enclosed_name() else {
            continue;
        };
        let outpath = dest.join(name);
        if entry.is_dir() {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut outfile = fs::File::create(&outpath)?;
            io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

/// Extracts a job input zip into `project_dir`, scratching through
/// `scratch_dir`. Accepts both flat-root archives and archives with a single
/// top-level `project/` directory — the ambiguous-shape rule says presence
/// of `project/` wins even if other files also sit at the root.
pub fn extract_job_zip(input_zip: &Path, project_dir: &Path, scratch_dir: &Path) -> Result<()> {
    if project_dir.exists() {
        fs::remove_dir_all(project_dir)?;
    }
    fs::create_dir_all(project_dir)?;

    if scratch_dir.exists() {
        fs::remove_dir_all(scratch_dir)?;
    }
    fs::create_dir_all(scratch_dir)?;

    extract_zip_to(input_zip, scratch_dir)?;

    let nested = scratch_dir.join("project");
    let src = if nested.is_dir() { nested } else { scratch_dir.to_path_buf() };
    copy_tree_contents(&src, project_dir)
}

pub struct ResultArchiveSpec<'a> {
    pub job_id: &'a str,
    pub output_dir: &'a Path,
    pub result_staging: &'a Path,
    pub project_dir: &'a Path,
    pub log_dir: &'a Path,
    pub started_at_unix: i64,
    pub ended_at_unix: i64,
    pub iterations_attempted: u32,
    pub status: &'a str,
    pub stop_reason: &'a str,
    pub name_suffix: &'a str,
}

/// Stages `metadata.txt` + `project/` + `logs/` and writes them atomically to
/// `<output_dir>/<job_id><name_suffix>.zip` via a `.partial.zip` sibling.
pub fn write_result_archive(spec: &ResultArchiveSpec) -> Result<PathBuf> {
    if spec.result_staging.exists() {
        fs::remove_dir_all(spec.result_staging)?;
    }
    fs::create_dir_all(spec.result_staging)?;

    let metadata = spec.result_staging.join("metadata.txt");
    let reason = if spec.stop_reason.is_empty() { "none" } else { spec.stop_reason };
    fs::write(
        &metadata,
        format!(
            "job_id={}\nstatus={}\nstop_reason={}\nstarted_at_unix={}\nended_at_unix={}\niterations_attempted={}\n",
            spec.job_id, spec.status, reason, spec.started_at_unix, spec.ended_at_unix, spec.iterations_attempted,
        ),
    )?;

    copy_tree_contents(spec.project_dir, &spec.result_staging.join("project"))?;
    copy_tree_contents(spec.log_dir, &spec.result_staging.join("logs"))?;

    let archive_tmp = spec.output_dir.join(format!("{}{}.partial.zip", spec.job_id, spec.name_suffix));
    let archive_final = spec.output_dir.join(format!("{}{}.zip", spec.job_id, spec.name_suffix));
    zip_dir(spec.result_staging, &archive_tmp)?;
    fs::rename(&archive_tmp, &archive_final)?;
    Ok(archive_final)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            io::Write::write_all(&mut writer, contents).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn extract_flat_archive_uses_root() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("in.zip");
        write_zip(&zip_path, &[("main.rs", b"fn main() {}")]);

        extract_job_zip(&zip_path, &dir.path().join("project"), &dir.path().join("scratch")).unwrap();
        assert_eq!(fs::read(dir.path().join("project/main.rs")).unwrap(), b"fn main() {}");
    }

    #[test]
    fn extract_nested_project_archive_unwraps_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("in.zip");
        write_zip(&zip_path, &[("project/main.rs", b"fn main() {}"), ("project/src/lib.rs", b"")]);

        extract_job_zip(&zip_path, &dir.path().join("project"), &dir.path().join("scratch")).unwrap();
        assert_eq!(fs::read(dir.path().join("project/main.rs")).unwrap(), b"fn main() {}");
        assert!(dir.path().join("project/src/lib.rs").exists());
    }

    #[test]
    fn ambiguous_shape_prefers_nested_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("in.zip");
        write_zip(
            &zip_path,
            &[("README.md", b"root file"), ("project/main.rs", b"nested file")],
        );

        extract_job_zip(&zip_path, &dir.path().join("project"), &dir.path().join("scratch")).unwrap();
        assert!(dir.path().join("project/main.rs").exists());
        assert!(!dir.path().join("project/README.md").exists());
    }

    #[test]
    fn zip_dir_round_trips_and_sorts_deterministically() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("b")).unwrap();
        fs::write(src.join("a.txt"), b"a").unwrap();
        fs::write(src.join("b/c.txt"), b"c").unwrap();

        let zip_path = dir.path().join("out.zip");
        zip_dir(&src, &zip_path).unwrap();

        let file = fs::File::open(&zip_path).unwrap();
        let mut archive = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["a.txt".to_string(), "b/c.txt".to_string()]);
    }

    #[test]
    fn write_result_archive_produces_expected_layout() {
        let dir = tempfile::tempdir().unwrap();
        let project_dir = dir.path().join("project");
        let log_dir = dir.path().join("logs");
        fs::create_dir_all(&project_dir).unwrap();
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(project_dir.join("main.rs"), b"fn main() {}").unwrap();
        fs::write(log_dir.join("iter-1.log"), b"ok").unwrap();

        let output_dir = dir.path().join("output");
        fs::create_dir_all(&output_dir).unwrap();

        let spec = ResultArchiveSpec {
            job_id: "job",
            output_dir: &output_dir,
            result_staging: &dir.path().join("staging"),
            project_dir: &project_dir,
            log_dir: &log_dir,
            started_at_unix: 100,
            ended_at_unix: 200,
            iterations_attempted: 1,
            status: "done",
            stop_reason: "complete_signal",
            name_suffix: ".result",
        };
        let archive = write_result_archive(&spec).unwrap();
        assert_eq!(archive.file_name().unwrap(), "job.result.zip");
        assert!(!output_dir.join("job.result.partial.zip").exists());

        let file = fs::File::open(&archive).unwrap();
        let mut zf = zip::ZipArchive::new(file).unwrap();
        let names: Vec<String> = (0..zf.len()).map(|i| zf.by_index(i).unwrap().name().to_string()).collect();
        assert!(names.contains(&"metadata.txt".to_string()));
        assert!(names.contains(&"project/main.rs".to_string()));
        assert!(names.contains(&"logs/iter-1.log".to_string()));
    }
}
