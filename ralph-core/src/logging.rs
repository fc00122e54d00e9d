use std::fs;
use std::io::Write;
use std::path::Path;

fn timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Console log line with a UTC timestamp, no job scoping.
pub fn log(message: &str) {
    println!("[{}] {message}", timestamp());
}

/// A per-job scoped logger: every line goes to stdout (for the operator
/// watching the console) and to a local transcript file the supervisor owns
/// for the lifetime of the job. The file handle is flushed on drop so a
/// caller never has to remember to do it explicitly.
pub struct JobLogger {
    job_id: String,
    file: fs::File,
}

impl JobLogger {
    pub fn new(job_id: impl Into<String>, transcript_path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = transcript_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(transcript_path)?;
        Ok(Self {
            job_id: job_id.into(),
            file,
        })
    }

    pub fn log(&mut self, message: &str) {
        let line = format!("[{}] [{}] {message}", timestamp(), self.job_id);
        println!("{line}");
        let _ = writeln!(self.file, "{line}");
    }
}

impl Drop for JobLogger {
    fn drop(&mut self) {
        let _ = self.file.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_logger_writes_transcript_and_flushes_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.transcript.log");
        {
            let mut logger = JobLogger::new("job-1", &path).unwrap();
            logger.log("starting");
            logger.log("finished");
        }
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("[job-1] starting"));
        assert!(content.contains("[job-1] finished"));
    }
}
