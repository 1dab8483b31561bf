//! Build stage: run the distro-native builder inside an executor seeded
//! with the builder-local repository, collect packages, and re-provision
//! that repository so later components can depend on earlier ones.

pub mod archlinux;
pub mod deb;
pub mod rpm;
pub mod windows;

use std::path::{Path, PathBuf};

use buildconfig::{Component, Distribution};
use tracing::info;

use crate::PluginError;

/// Removes a component's earlier versions from the builder-local
/// repository so only the latest provisioned one remains.
pub(crate) fn clean_local_repository(
    repository_dir: &Path,
    component: &Component,
    dist: &Distribution,
    prefix: &str,
) -> Result<(), PluginError> {
    info!(
        "{component}:{dist}: Cleaning local repository '{}' (all versions).",
        repository_dir.display()
    );
    std::fs::create_dir_all(repository_dir).map_err(|e| PluginError::Build(e.to_string(), None))?;
    for entry in
        std::fs::read_dir(repository_dir).map_err(|e| PluginError::Build(e.to_string(), None))?
    {
        let entry = entry.map_err(|e| PluginError::Build(e.to_string(), None))?;
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            fileutil::remove_path(&entry.path())
                .map_err(|e| PluginError::Build(e.to_string(), None))?;
        }
    }
    Ok(())
}

/// Hardlinks the given artifacts into `repository_dir/target_name`.
///
/// The builder-local repository only ever holds hardlinks; its metadata is
/// regenerated by the next build step that consumes it.
pub(crate) fn provision_local_repository(
    label: &str,
    repository_dir: &Path,
    target_name: &str,
    files: &[PathBuf],
) -> Result<(), PluginError> {
    info!(
        "{label}: Provisioning local repository '{}'.",
        repository_dir.display()
    );
    let target_dir = repository_dir.join(target_name);
    fileutil::remove_path(&target_dir).map_err(|e| PluginError::Build(e.to_string(), None))?;
    std::fs::create_dir_all(&target_dir).map_err(|e| PluginError::Build(e.to_string(), None))?;
    for file in files {
        let name = file.file_name().unwrap_or_default();
        fileutil::force_hardlink(file, &target_dir.join(name)).map_err(|_| {
            PluginError::Build(format!("{label}: Failed to provision local repository."), None)
        })?;
    }
    Ok(())
}

/// Config scalars arrive as strings or numbers depending on the YAML
/// author; normalize for use in commands.
pub(crate) fn value_string(value: &serde_yaml::Value) -> String {
    match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim()
            .to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_replaces_previous_content() -> Result<(), PluginError> {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repository/host-fc32");
        let artifact = dir.path().join("pkg-1.0-1.fc32.x86_64.rpm");
        std::fs::write(&artifact, b"rpm").unwrap();

        provision_local_repository("t", &repo, "pkg_1.0", &[artifact.clone()])?;
        assert!(repo.join("pkg_1.0/pkg-1.0-1.fc32.x86_64.rpm").exists());

        // Re-provisioning starts from a clean target directory.
        std::fs::write(dir.path().join("other.rpm"), b"rpm").unwrap();
        provision_local_repository("t", &repo, "pkg_1.0", &[dir.path().join("other.rpm")])?;
        assert!(!repo.join("pkg_1.0/pkg-1.0-1.fc32.x86_64.rpm").exists());
        assert!(repo.join("pkg_1.0/other.rpm").exists());
        Ok(())
    }
}
