//! Per-(component, distribution) parameter resolution from the component's
//! build manifest.

use std::path::PathBuf;

use buildconfig::{Component, Config, Distribution};
use executor::Executor;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::{Dependency, PluginError, PluginManager};

/// Placeholders available to a component's manifest: the executor's
/// well-known paths plus the component source directory and backend VMM.
pub fn component_placeholders(
    executor: &dyn Executor,
    component: &Component,
    config: &Config,
) -> Vec<(String, String)> {
    let mut placeholders = executor.placeholders();
    placeholders.push((
        "@SOURCE_DIR@".to_string(),
        executor
            .builder_dir()
            .join(&component.name)
            .to_string_lossy()
            .into_owned(),
    ));
    placeholders.push(("@BACKEND_VMM@".to_string(), config.backend_vmm()));
    placeholders
}

/// The merged per-(component, distribution) parameters.
#[derive(Debug)]
pub struct DistParameters {
    /// Build targets (relative paths inside the component).
    pub build: Vec<String>,
    raw: Mapping,
}

impl DistParameters {
    pub fn raw(&self) -> &Mapping {
        &self.raw
    }

    /// Mangled build-target names, unique within the tuple by construction.
    pub fn mangled_builds(&self) -> Vec<String> {
        self.build.iter().map(|b| artifacts::mangle_path(b)).collect()
    }
}

/// Resolves `host/vm → rpm|deb|archlinux`, `host/vm → fullname` and
/// `{distribution} → family` manifest sections, later sections overriding
/// earlier ones key by key.
pub fn dist_parameters(
    executor: &dyn Executor,
    component: &Component,
    dist: &Distribution,
    config: &Config,
) -> Result<DistParameters, PluginError> {
    let manifest = component.manifest(&component_placeholders(executor, component, config))?;

    let mut merged = Mapping::new();
    let layers = [
        section(&manifest, &dist.package_set.to_string(), &dist.family.to_string()),
        section(&manifest, &dist.package_set.to_string(), &dist.fullname),
        section(&manifest, dist.distribution(), &dist.family.to_string()),
    ];
    for layer in layers.into_iter().flatten() {
        for (key, value) in layer {
            merged.insert(key, value);
        }
    }

    let build: Vec<String> = merged
        .get("build")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mangled: Vec<String> = build.iter().map(|b| artifacts::mangle_path(b)).collect();
    let mut unique = mangled.clone();
    unique.sort();
    unique.dedup();
    if unique.len() != mangled.len() {
        return Err(PluginError::Plugin(format!(
            "{}:{}: Conflicting build paths",
            component.name,
            dist.distribution()
        )));
    }

    Ok(DistParameters { build, raw: merged })
}

fn section(manifest: &Mapping, outer: &str, inner: &str) -> Option<Mapping> {
    manifest
        .get(outer)
        .and_then(Value::as_mapping)?
        .get(inner)
        .and_then(Value::as_mapping)
        .cloned()
}

/// The merged `source` section: top-level, per package set, per
/// distribution.
pub fn source_parameters(
    executor: &dyn Executor,
    component: &Component,
    dist: Option<&Distribution>,
    config: &Config,
) -> Result<Mapping, PluginError> {
    let manifest = component.manifest(&component_placeholders(executor, component, config))?;
    let mut merged = Mapping::new();

    let mut layers: Vec<Mapping> = Vec::new();
    if let Some(source) = manifest.get("source").and_then(Value::as_mapping) {
        layers.push(source.clone());
    }
    if let Some(dist) = dist {
        for outer in [dist.package_set.to_string(), dist.distribution().to_string()] {
            if let Some(source) = section(&manifest, &outer, "source") {
                layers.push(source);
            }
        }
    }
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key, value);
        }
    }
    Ok(merged)
}

/// One `files[]` entry of a manifest `source` section.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileEntry {
    pub url: String,
    pub name: Option<String>,
    pub sha256: Option<String>,
    pub sha512: Option<String>,
    pub signature: Option<String>,
    pub pubkeys: Vec<String>,
    pub uncompress: bool,
}

impl FileEntry {
    /// Downloaded file name and final distfile name; they differ only when
    /// `uncompress` drops the archive suffix.
    pub fn distfile_names(&self) -> (String, String) {
        let name = match &self.name {
            Some(name) => name.clone(),
            // Without an explicit name, the last URL path segment is taken
            // as the file name; query-style download links need `name`.
            None => self
                .url
                .rsplit('/')
                .next()
                .unwrap_or(&self.url)
                .to_string(),
        };
        let final_name = if self.uncompress {
            PathBuf::from(&name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.clone())
        } else {
            name.clone()
        };
        (name, final_name)
    }
}

pub fn files_from(params: &Mapping) -> Vec<FileEntry> {
    params
        .get("files")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(|v| serde_yaml::from_value(v.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

pub fn modules_from(params: &Mapping) -> Vec<String> {
    params
        .get("modules")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

pub fn commands_from(params: &Mapping) -> Vec<String> {
    params
        .get("commands")
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Copy-in list every stage starts from: the plugin's own assets and those
/// of its plugin dependencies into the sandbox plugins dir, plus dependency
/// component sources.
pub fn default_copy_in(
    executor: &dyn Executor,
    manager: &PluginManager,
    config: &Config,
    plugin_name: &str,
    dependencies: &[Dependency],
) -> Vec<(PathBuf, PathBuf)> {
    let mut copy_in = Vec::new();
    if let Some(dir) = manager.entity_dir(plugin_name) {
        copy_in.push((dir.to_path_buf(), executor.plugins_dir()));
    }
    for dependency in dependencies {
        match dependency {
            Dependency::Plugin(name) => {
                if let Some(dir) = manager.entity_dir(name) {
                    copy_in.push((dir.to_path_buf(), executor.plugins_dir()));
                }
            }
            Dependency::Component(name) => {
                copy_in.push((
                    config.artifacts().source_dir(name),
                    executor.sources_dir(),
                ));
            }
            Dependency::Job(_) => {}
        }
    }
    copy_in
}

/// Environment handed to every executor run.
pub fn base_environment(config: &Config) -> std::collections::BTreeMap<String, String> {
    let mut env = std::collections::BTreeMap::new();
    if config.verbose() {
        env.insert("VERBOSE".to_string(), "1".to_string());
    }
    if config.debug() {
        env.insert("DEBUG".to_string(), "1".to_string());
    }
    env.insert("BACKEND_VMM".to_string(), config.backend_vmm());
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildconfig::{ComponentSpec, VerificationMode};
    use executor::{ExecutorOptions, LocalExecutor};
    use pretty_assertions::assert_eq;

    fn component_with_manifest(dir: &std::path::Path, manifest: &str) -> (Config, Component) {
        let conf_path = dir.join("builder.yml");
        std::fs::write(&conf_path, "backend-vmm: xen\n").unwrap();
        let config = Config::from_file(&conf_path, &[]).unwrap();

        let source_dir = dir.join("sources/lvm2");
        std::fs::create_dir_all(&source_dir).unwrap();
        std::fs::write(source_dir.join("version"), "2.03\n").unwrap();
        std::fs::write(source_dir.join(".qubesbuilder"), manifest).unwrap();
        let component = Component::new(ComponentSpec {
            name: "lvm2".to_string(),
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
        (config, component)
    }

    #[test]
    fn build_targets_merge_per_distribution() {
        let dir = tempfile::tempdir().unwrap();
        let (config, component) = component_with_manifest(
            dir.path(),
            "host:\n  rpm:\n    build:\n      - lvm2.spec\nhost-fc32:\n  rpm:\n    build:\n      - lvm2.spec\n      - udev/lvm2.spec\n",
        );
        let executor = LocalExecutor::new(ExecutorOptions::default());
        let dist = Distribution::new("host-fc32").unwrap();

        let params = dist_parameters(&executor, &component, &dist, &config).unwrap();
        assert_eq!(params.build, vec!["lvm2.spec", "udev/lvm2.spec"]);
        assert_eq!(
            params.mangled_builds(),
            vec!["lvm2.spec".to_string(), "udev_lvm2.spec".to_string()]
        );
    }

    #[test]
    fn conflicting_mangled_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (config, component) = component_with_manifest(
            dir.path(),
            "host:\n  rpm:\n    build:\n      - udev/lvm2.spec\n      - udev_lvm2.spec\n",
        );
        let executor = LocalExecutor::new(ExecutorOptions::default());
        let dist = Distribution::new("host-fc32").unwrap();

        let err = dist_parameters(&executor, &component, &dist, &config).unwrap_err();
        assert!(err.to_string().contains("Conflicting build paths"));
    }

    #[test]
    fn distfile_names_follow_uncompress() {
        let entry = FileEntry {
            url: "https://example.org/path/archive.tar.gz".to_string(),
            uncompress: false,
            ..Default::default()
        };
        assert_eq!(
            entry.distfile_names(),
            ("archive.tar.gz".to_string(), "archive.tar.gz".to_string())
        );

        let uncompressed = FileEntry {
            uncompress: true,
            ..entry
        };
        assert_eq!(
            uncompressed.distfile_names(),
            ("archive.tar.gz".to_string(), "archive.tar".to_string())
        );
    }

    #[test]
    fn named_entry_wins_over_url() {
        let entry = FileEntry {
            url: "https://example.org/download?id=42".to_string(),
            name: Some("pkg-1.2.tar.bz2".to_string()),
            ..Default::default()
        };
        assert_eq!(entry.distfile_names().0, "pkg-1.2.tar.bz2");
    }
}
