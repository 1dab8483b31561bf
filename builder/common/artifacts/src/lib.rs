//! Content-addressed artifact info records and the persisted `artifacts/`
//! tree layout.
//!
//! Every stage writes one YAML record per build target under
//! `{basename}.{stage}.yml`; later stages read it back. Records are the only
//! authoritative cross-stage state — repository trees are derived from them.

mod layout;
mod record;

pub use layout::*;
pub use record::*;

use std::path::Path;

use anyhow::{Context, Result};

/// File name of a stage info record, e.g. `qubes-qrexec.publish.yml`.
pub fn info_filename(stage: &str, basename: &str) -> String {
    format!("{basename}.{stage}.yml")
}

/// Mangles a build-target path into a record basename: `/` becomes `_`.
pub fn mangle_path(build: &str) -> String {
    build.replace('/', "_")
}

/// Loads a stage info record, returning the default (empty) record when none
/// exists yet.
pub fn read_info(dir: &Path, stage: &str, basename: &str) -> Result<InfoRecord> {
    let path = dir.join(info_filename(stage, basename));
    if !path.exists() {
        return Ok(InfoRecord::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("{basename}: Failed to read info from {stage} stage."))?;
    serde_yaml::from_str(&text)
        .with_context(|| format!("{basename}: Failed to read info from {stage} stage."))
}

/// Writes a stage info record, replacing any prior record for the same key.
pub fn save_info(dir: &Path, stage: &str, basename: &str, info: &InfoRecord) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(info_filename(stage, basename));
    let text = serde_yaml::to_string(info)
        .with_context(|| format!("{basename}: Failed to write info for {stage} stage."))?;
    std::fs::write(&path, text)
        .with_context(|| format!("{basename}: Failed to write info for {stage} stage."))
}

pub fn delete_info(dir: &Path, stage: &str, basename: &str) -> Result<()> {
    let path = dir.join(info_filename(stage, basename));
    if path.exists() {
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

/// Modification time of a record, used by the minimum-age publish gate.
pub fn info_mtime(dir: &Path, stage: &str, basename: &str) -> Result<std::time::SystemTime> {
    let path = dir.join(info_filename(stage, basename));
    Ok(std::fs::metadata(&path)?.modified()?)
}

/// Publish timestamps are minute-resolution UTC, `YYYYMMDDHHMM`.
pub fn publish_timestamp(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%Y%m%d%H%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn mangles_build_paths() {
        assert_eq!(mangle_path("vmm-xen.spec"), "vmm-xen.spec");
        assert_eq!(mangle_path("installer/qubes-spec"), "installer_qubes-spec");
    }

    #[test]
    fn record_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut info = InfoRecord {
            source_hash: Some("abc123".into()),
            srpm: Some("qubes-core-qrexec-4.1.16-1.fc32.src.rpm".into()),
            rpms: vec!["qubes-core-qrexec-4.1.16-1.fc32.x86_64.rpm".into()],
            ..Default::default()
        };
        info.repository_publish.push(PublishEntry {
            name: "current-testing".into(),
            timestamp: "202301020304".into(),
        });

        save_info(dir.path(), "publish", "qubes-qrexec", &info)?;
        let loaded = read_info(dir.path(), "publish", "qubes-qrexec")?;
        assert_eq!(loaded, info);
        assert!(dir.path().join("qubes-qrexec.publish.yml").exists());
        Ok(())
    }

    #[test]
    fn missing_record_reads_empty() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let info = read_info(dir.path(), "build", "nothing")?;
        assert_eq!(info, InfoRecord::default());
        Ok(())
    }

    #[test]
    fn delete_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        save_info(dir.path(), "prep", "x", &InfoRecord::default())?;
        delete_info(dir.path(), "prep", "x")?;
        delete_info(dir.path(), "prep", "x")?;
        assert!(!dir.path().join("x.prep.yml").exists());
        Ok(())
    }

    #[test]
    fn formats_publish_timestamp() {
        let now = chrono::DateTime::parse_from_rfc3339("2023-05-06T07:08:09Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        assert_eq!(publish_timestamp(now), "202305060708");
    }
}
