use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

/// Diagnosis hint attached to stage failures: the step log and the lines
/// surrounding the upstream tool's error marker.
#[derive(Debug)]
pub struct AdditionalInfo {
    pub log_file: PathBuf,
    pub start_line: usize,
    pub lines: Vec<String>,
}

/// Stage-local failures. Plugins never recover from each other's errors;
/// any of these aborts the current stage run.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("{0}")]
    Plugin(String),
    #[error("{0}")]
    Fetch(String),
    #[error("{0}")]
    Source(String),
    #[error("{0}")]
    Build(String, Option<Box<AdditionalInfo>>),
    #[error("{0}")]
    Chroot(String),
    #[error("{0}")]
    Sign(String),
    #[error("{0}")]
    Publish(String),
    #[error("{0}")]
    Upload(String),
    #[error("{0}")]
    Template(String),
    #[error("{0}")]
    Installer(String),
}

impl PluginError {
    pub fn additional_info(&self) -> Option<&AdditionalInfo> {
        match self {
            Self::Build(_, Some(info)) => Some(info),
            _ => None,
        }
    }
}

impl From<buildconfig::ConfigError> for PluginError {
    fn from(e: buildconfig::ConfigError) -> Self {
        Self::Plugin(e.to_string())
    }
}

impl From<buildconfig::ComponentError> for PluginError {
    fn from(e: buildconfig::ComponentError) -> Self {
        Self::Plugin(e.to_string())
    }
}

impl From<executor::ExecutorError> for PluginError {
    fn from(e: executor::ExecutorError) -> Self {
        Self::Plugin(e.to_string())
    }
}

impl From<anyhow::Error> for PluginError {
    fn from(e: anyhow::Error) -> Self {
        Self::Plugin(format!("{e:#}"))
    }
}

/// Number of log lines echoed back to the user around a tool error marker.
const CONTEXT_LINES: usize = 100;

/// Finds the last match of `marker` in the log and returns up to
/// [`CONTEXT_LINES`] lines preceding it, with the 1-indexed start line.
pub fn extract_lines_before(log_file: &Path, marker: &str) -> Option<AdditionalInfo> {
    let text = std::fs::read_to_string(log_file).ok()?;
    let regex = Regex::new(marker).ok()?;
    let lines: Vec<&str> = text.lines().collect();
    let marker_index = lines.iter().rposition(|line| regex.is_match(line))?;

    let start = marker_index.saturating_sub(CONTEXT_LINES);
    Some(AdditionalInfo {
        log_file: log_file.to_path_buf(),
        start_line: start + 1,
        lines: lines[start..=marker_index]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_context_before_marker() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("step.log");
        let mut lines: Vec<String> = (1..=150).map(|i| format!("line {i}")).collect();
        lines.push("dpkg-source: error: something broke".to_string());
        std::fs::write(&log, lines.join("\n")).unwrap();

        let info = extract_lines_before(&log, "dpkg-source: error:").unwrap();
        assert_eq!(info.start_line, 51);
        assert_eq!(info.lines.len(), CONTEXT_LINES + 1);
        assert_eq!(info.lines.first().unwrap(), "line 51");
        assert!(info.lines.last().unwrap().contains("dpkg-source"));
    }

    #[test]
    fn missing_marker_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("step.log");
        std::fs::write(&log, "all fine\n").unwrap();
        assert!(extract_lines_before(&log, "EXCEPTION:").is_none());
    }
}
