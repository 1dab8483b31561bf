use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

/// Per-step log file under `artifacts/logs/`.
///
/// Every executor output line lands here and, at debug level, on the
/// console. On failure the file is what `extract_lines_before` digs
/// through, so its path is reported to the user up front.
pub struct StepLog {
    path: PathBuf,
    file: File,
}

impl StepLog {
    /// Creates `logs/{timestamp}-{name}.log`.
    pub fn create(logs_dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(logs_dir)
            .with_context(|| format!("Creating {}", logs_dir.display()))?;
        let timestamp = chrono::Utc::now().format("%Y%m%d%H%M%S");
        let path = logs_dir.join(format!("{timestamp}-{name}.log"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Cannot create log file {}", path.display()))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn line(&mut self, line: &str) {
        debug!("output: {line}");
        let _ = writeln!(self.file, "{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines_to_named_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut log = StepLog::create(dir.path(), "core-qrexec-host-fc32")?;
        log.line("building");
        log.line("done");

        let name = log.path().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-core-qrexec-host-fc32.log"));
        let text = std::fs::read_to_string(log.path())?;
        assert_eq!(text, "building\ndone\n");
        Ok(())
    }
}
