//! Prep stage: shape fetched sources into distro-native source packages.

pub mod archlinux;
pub mod deb;
pub mod rpm;
pub mod windows;

use std::path::{Path, PathBuf};

use buildconfig::{Component, Config, Distribution};
use tracing::info;

use crate::PluginError;

/// The skip rule: a stage is skipped when every build target's existing
/// record carries the component's current source hash.
pub(crate) fn source_hash_unchanged(
    config: &Config,
    component: &Component,
    dist: &Distribution,
    stage: &str,
    mangled_builds: &[String],
) -> Result<bool, PluginError> {
    if mangled_builds.is_empty() {
        return Ok(false);
    }
    let dir = dist_stage_dir(config, component, dist, stage)?;
    let current = component.source_hash()?.to_string();
    for build in mangled_builds {
        let record = artifacts::read_info(&dir, stage, build)
            .map_err(|e| PluginError::Plugin(e.to_string()))?;
        if record.source_hash.as_deref() != Some(current.as_str()) {
            return Ok(false);
        }
    }
    Ok(true)
}

pub(crate) fn log_skip(component: &Component, dist: &Distribution, what: &str) {
    info!(
        "{component}:{dist}: Source hash is the same than already {what} source. Skipping."
    );
}

pub(crate) fn dist_stage_dir(
    config: &Config,
    component: &Component,
    dist: &Distribution,
    stage: &str,
) -> Result<PathBuf, PluginError> {
    Ok(config.artifacts().dist_artifacts_dir(
        &component.name,
        &component.verrel()?,
        dist.distribution(),
        stage,
    ))
}

pub(crate) fn component_stage_dir(
    config: &Config,
    component: &Component,
    stage: &str,
) -> Result<PathBuf, PluginError> {
    Ok(config
        .artifacts()
        .component_artifacts_dir(&component.name, &component.verrel()?, stage))
}

/// Wipes and recreates a stage artifacts directory.
pub(crate) fn reset_dir(dir: &Path) -> Result<(), PluginError> {
    fileutil::remove_path(dir).map_err(|e| PluginError::Plugin(e.to_string()))?;
    std::fs::create_dir_all(dir).map_err(|e| PluginError::Plugin(e.to_string()))?;
    Ok(())
}

/// The fetch-stage record, holding commit provenance and module archives.
pub(crate) fn fetch_info(
    config: &Config,
    component: &Component,
) -> Result<artifacts::InfoRecord, PluginError> {
    let dir = component_stage_dir(config, component, "fetch")?;
    artifacts::read_info(&dir, "fetch", "source").map_err(|e| PluginError::Plugin(e.to_string()))
}

pub(crate) fn read_lines(path: &Path) -> Result<Vec<String>, PluginError> {
    let text = std::fs::read_to_string(path).map_err(|e| PluginError::Source(e.to_string()))?;
    Ok(text.lines().map(str::to_string).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildconfig::{ComponentSpec, Distribution, VerificationMode};
    use serde_yaml::Mapping;

    fn setup() -> (tempfile::TempDir, Config, Component, Distribution) {
        let dir = tempfile::tempdir().unwrap();
        let conf_path = dir.path().join("builder.yml");
        std::fs::write(
            &conf_path,
            format!("artifacts-dir: {}\n", dir.path().join("artifacts").display()),
        )
        .unwrap();
        let config = Config::from_file(&conf_path, &[]).unwrap();

        let source_dir = dir.path().join("artifacts/sources/core-qrexec");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("version"), "4.1.16\n").unwrap();
        std::fs::write(source_dir.join("rel"), "1\n").unwrap();
        let component = Component::new(ComponentSpec {
            name: "core-qrexec".to_string(),
            source_dir,
            url: String::new(),
            branch: "main".to_string(),
            maintainers: vec![],
            verification_mode: VerificationMode::Insecure,
            timeout: 3600,
            fetch_versions_only: false,
            min_distinct_maintainers: 1,
            is_plugin: false,
            has_packages: true,
            devel_path: None,
            options: Mapping::new(),
        });
        let dist = Distribution::new("host-fc32").unwrap();
        (dir, config, component, dist)
    }

    #[test]
    fn skip_rule_requires_matching_hash_on_every_target() {
        let (_dir, config, component, dist) = setup();
        let builds = vec!["vmm-xen.spec".to_string()];
        let stage_dir = dist_stage_dir(&config, &component, &dist, "prep").unwrap();

        // No record yet: the stage must run.
        assert!(!source_hash_unchanged(&config, &component, &dist, "prep", &builds).unwrap());

        let mut record = artifacts::InfoRecord::default();
        record.source_hash = Some(component.source_hash().unwrap().to_string());
        artifacts::save_info(&stage_dir, "prep", "vmm-xen.spec", &record).unwrap();
        assert!(source_hash_unchanged(&config, &component, &dist, "prep", &builds).unwrap());

        // A stale hash on any target disables the skip.
        record.source_hash = Some("stale".to_string());
        artifacts::save_info(&stage_dir, "prep", "vmm-xen.spec", &record).unwrap();
        assert!(!source_hash_unchanged(&config, &component, &dist, "prep", &builds).unwrap());
    }
}
