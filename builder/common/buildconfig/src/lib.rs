//! Layered YAML configuration resolver.
//!
//! A builder configuration is the deep-merge of the top-level file, its
//! transitively included files (paths resolved relative to the including
//! file), and command-line `-o` overrides as the last layer. Keys prefixed
//! with `+` accumulate into the same key without the prefix for the five
//! list-valued keys (`distributions`, `templates`, `components`, `stages`,
//! `plugins`); everything else deep-merges with lists replacing.

mod component;
mod distribution;
mod error;
mod gitignore;
mod merge;
mod overrides;
mod safety;
mod stage;
mod template;

pub use component::{Component, ComponentSpec, VerificationMode};
pub use distribution::{Distribution, Family, PackageSet};
pub use error::{ComponentError, ConfigError, DistributionError, TemplateError};
pub use merge::deep_merge;
pub use overrides::parse_cli_overrides;
pub use safety::{deep_check, is_filename_valid, str_to_bool};
pub use stage::{Stage, STAGES};
pub use template::Template;

use std::path::{Path, PathBuf};

use artifacts::ArtifactsLayout;
use serde_yaml::{Mapping, Value};

/// Keys whose `+`-prefixed variants accumulate instead of replacing.
const LIST_KEYS: [&str; 5] = ["distributions", "templates", "components", "stages", "plugins"];

#[derive(Debug)]
pub struct Config {
    conf_file: PathBuf,
    conf: Mapping,
    components: Vec<Component>,
    distributions: Vec<Distribution>,
    templates: Vec<Template>,
    artifacts: ArtifactsLayout,
    plugins_dirs: Vec<PathBuf>,
}

impl Config {
    /// Loads and expands a configuration file, applying `-o` overrides as
    /// the last layer.
    pub fn from_file(conf_file: &Path, cli_options: &[String]) -> Result<Self, ConfigError> {
        let overrides = parse_cli_overrides(cli_options.iter().map(String::as_str))?;
        let conf = parse_configuration_file(conf_file, &overrides)?;

        let artifacts_root = match conf.get("artifacts-dir").and_then(Value::as_str) {
            Some(dir) => PathBuf::from(dir),
            None => std::env::current_dir()
                .map_err(|e| ConfigError(e.to_string()))?
                .join("artifacts"),
        };
        let artifacts = ArtifactsLayout::new(&artifacts_root);

        let mut config = Self {
            conf_file: conf_file.to_path_buf(),
            conf,
            components: Vec::new(),
            distributions: Vec::new(),
            templates: Vec::new(),
            artifacts,
            plugins_dirs: Vec::new(),
        };
        config.expand()?;
        Ok(config)
    }

    fn expand(&mut self) -> Result<(), ConfigError> {
        for entry in self.sequence("distributions") {
            let (name, options) = split_entry(&entry)?;
            self.distributions.push(
                Distribution::with_options(&name, options)
                    .map_err(|e| ConfigError(e.to_string()))?,
            );
        }

        for entry in self.sequence("templates") {
            self.templates
                .push(Template::from_config(&entry).map_err(|e| ConfigError(e.to_string()))?);
        }

        for entry in self.sequence("components") {
            let (name, options) = split_entry(&entry)?;
            let component = self.component_from_options(&name, options)?;
            if component.is_plugin {
                let mut plugin_dir = component.source_dir.clone();
                if let Some(content_dir) =
                    component.options().get("content-dir").and_then(Value::as_str)
                {
                    plugin_dir = plugin_dir.join(content_dir);
                }
                self.plugins_dirs.push(plugin_dir);
            }
            self.components.push(component);
        }

        if let Some(dirs) = self.conf.get("plugins-dirs").and_then(Value::as_sequence) {
            for dir in dirs.iter().filter_map(Value::as_str) {
                self.plugins_dirs.insert(0, PathBuf::from(dir));
            }
        }
        Ok(())
    }

    fn component_from_options(
        &self,
        name: &str,
        options: Mapping,
    ) -> Result<Component, ConfigError> {
        let git = self
            .conf
            .get("git")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        let get = |map: &Mapping, key: &str, default: &str| -> String {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };

        let baseurl = get(&git, "baseurl", "https://github.com");
        let prefix = get(&git, "prefix", "QubesOS/qubes-");
        let suffix = get(&git, "suffix", ".git");
        let branch = get(&git, "branch", "main");

        let prefix = get(&options, "prefix", &prefix);
        let suffix = get(&options, "suffix", &suffix);
        let url = match options.get("url").and_then(Value::as_str) {
            Some(url) => url.to_string(),
            None => format!("{baseurl}/{prefix}{name}{suffix}"),
        };

        let mut maintainers: Vec<String> = git
            .get("maintainers")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        if let Some(own) = options.get("maintainers").and_then(Value::as_sequence) {
            maintainers = own
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }

        let mut verification_mode = VerificationMode::SignedTag;
        if self.string_list("insecure-skip-checking").contains(&name.to_string()) {
            verification_mode = VerificationMode::Insecure;
        }
        if self
            .string_list("less-secure-signed-commits-sufficient")
            .contains(&name.to_string())
        {
            verification_mode = VerificationMode::SignedCommit;
        }
        if let Some(mode) = options.get("verification-mode").and_then(Value::as_str) {
            verification_mode = mode
                .parse()
                .map_err(|_| ConfigError(format!("Unknown verification mode '{mode}'.")))?;
        }

        let timeout = options
            .get("timeout")
            .and_then(Value::as_u64)
            .or_else(|| self.conf.get("timeout").and_then(Value::as_u64))
            .unwrap_or(3600);

        let min_distinct_maintainers = options
            .get("min-distinct-maintainers")
            .and_then(Value::as_u64)
            .or_else(|| {
                self.conf
                    .get("min-distinct-maintainers")
                    .and_then(Value::as_u64)
            })
            .unwrap_or(1) as u32;

        let fetch_versions_only = options
            .get("fetch-versions-only")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| self.fetch_versions_only());

        let devel_path = if self.increment_devel_versions() {
            Some(self.artifacts.devel_path(name))
        } else {
            None
        };

        Ok(Component::new(ComponentSpec {
            name: name.to_string(),
            source_dir: self.artifacts.source_dir(name),
            url,
            branch: get(&options, "branch", &branch),
            maintainers,
            verification_mode,
            timeout,
            fetch_versions_only,
            min_distinct_maintainers,
            is_plugin: options.get("plugin").and_then(Value::as_bool).unwrap_or(false),
            has_packages: options.get("packages").and_then(Value::as_bool).unwrap_or(true),
            devel_path,
            options,
        }))
    }

    fn sequence(&self, key: &str) -> Vec<Value> {
        self.conf
            .get(key)
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default()
    }

    fn string_list(&self, key: &str) -> Vec<String> {
        self.sequence(key)
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect()
    }

    pub fn conf_file(&self) -> &Path {
        &self.conf_file
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.conf.get(key)
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.conf.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.conf
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn verbose(&self) -> bool {
        self.get_bool("verbose", false)
    }

    pub fn debug(&self) -> bool {
        self.get_bool("debug", false)
    }

    pub fn skip_git_fetch(&self) -> bool {
        self.get_bool("skip-git-fetch", false)
    }

    pub fn fetch_versions_only(&self) -> bool {
        self.get_bool("fetch-versions-only", false)
    }

    pub fn increment_devel_versions(&self) -> bool {
        self.get_bool("increment-devel-versions", false)
    }

    pub fn automatic_upload_on_publish(&self) -> bool {
        self.get_bool("automatic-upload-on-publish", false)
    }

    pub fn backend_vmm(&self) -> String {
        self.get_str("backend-vmm", "")
    }

    pub fn gpg_client(&self) -> String {
        self.get_str("gpg-client", "gpg")
    }

    pub fn min_age_days(&self) -> i64 {
        self.conf
            .get("min-age-days")
            .and_then(Value::as_i64)
            .unwrap_or(5)
    }

    pub fn release_name(&self) -> String {
        self.get_str("qubes-release", "r4.2")
    }

    pub fn use_qubes_repo(&self) -> Mapping {
        self.conf
            .get("use-qubes-repo")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default()
    }

    /// Signing key fingerprint for a distribution, by exact distribution
    /// name first, then by family.
    pub fn sign_key(&self, dist: &Distribution) -> Option<String> {
        let keys = self.conf.get("sign-key").and_then(Value::as_mapping)?;
        keys.get(dist.distribution())
            .or_else(|| keys.get(dist.family.to_string().as_str()))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn template_sign_key(&self) -> Option<String> {
        self.conf
            .get("sign-key")
            .and_then(Value::as_mapping)?
            .get("rpm")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Default publish repository for a kind ("components" or "templates").
    pub fn repository_publish(&self, kind: &str) -> Option<String> {
        self.conf
            .get("repository-publish")
            .and_then(Value::as_mapping)?
            .get(kind)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn repository_upload_remote_host(&self, family: Family) -> Option<String> {
        self.conf
            .get("repository-upload-remote-host")
            .and_then(Value::as_mapping)?
            .get(family.to_string().as_str())
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn template_root_size(&self) -> String {
        self.get_str("template-root-size", "20G")
    }

    pub fn template_root_with_partitions(&self) -> bool {
        self.get_bool("template-root-with-partitions", true)
    }

    pub fn iso_option(&self, key: &str) -> Option<Value> {
        self.conf
            .get("iso")
            .and_then(Value::as_mapping)?
            .get(key)
            .cloned()
    }

    pub fn artifacts(&self) -> &ArtifactsLayout {
        &self.artifacts
    }

    pub fn plugins_dirs(&self) -> &[PathBuf] {
        &self.plugins_dirs
    }

    /// The configured stage list for `all` runs; falls back to the standard
    /// pipeline.
    pub fn stages(&self) -> Vec<Stage> {
        let configured: Vec<Stage> = self
            .sequence("stages")
            .iter()
            .filter_map(|entry| match entry {
                Value::String(name) => name.parse().ok(),
                Value::Mapping(mapping) => mapping
                    .iter()
                    .next()
                    .and_then(|(k, _)| k.as_str())
                    .and_then(|name| name.parse().ok()),
                _ => None,
            })
            .collect();
        if configured.is_empty() {
            STAGES.to_vec()
        } else {
            configured
        }
    }

    pub fn components(&self) -> &[Component] {
        &self.components
    }

    pub fn distributions(&self) -> &[Distribution] {
        &self.distributions
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.name == name)
    }

    /// Effective executor options for a (stage, plugin scope): global
    /// `executor`, then per-stage, then per-component per-stage (component-
    /// wide, then per-package-set, then per-distribution), then
    /// per-distribution per-stage. Later layers win.
    pub fn executor_options(
        &self,
        stage: &str,
        dist: Option<&Distribution>,
        component: Option<&Component>,
    ) -> Value {
        let default_options = self
            .conf
            .get("executor")
            .cloned()
            .unwrap_or(Value::Mapping(Mapping::new()));

        let stage_options = stage_executor_entry(&self.sequence("stages"), stage);

        let mut component_options = Value::Mapping(Mapping::new());
        if let Some(component) = component {
            let mut stanzas: Vec<Value> = Vec::new();
            if let Some(v) = component.options().get("stages") {
                stanzas.push(v.clone());
            }
            if let Some(dist) = dist {
                if let Some(set) = component
                    .options()
                    .get(dist.package_set.to_string().as_str())
                    .and_then(Value::as_mapping)
                {
                    if let Some(v) = set.get("stages") {
                        stanzas.push(v.clone());
                    }
                }
                if let Some(per_dist) = component
                    .options()
                    .get(dist.distribution())
                    .and_then(Value::as_mapping)
                {
                    if let Some(v) = per_dist.get("stages") {
                        stanzas.push(v.clone());
                    }
                }
            }
            for stanza in stanzas {
                if let Some(seq) = stanza.as_sequence() {
                    let entry = stage_executor_entry(seq, stage);
                    component_options = deep_merge(&component_options, &entry, false);
                }
            }
        }

        let mut dist_options = Value::Mapping(Mapping::new());
        if let Some(dist) = dist {
            if let Some(seq) = dist.options().get("stages").and_then(Value::as_sequence) {
                dist_options = stage_executor_entry(seq, stage);
            }
        }

        let mut result = Value::Mapping(Mapping::new());
        for options in [default_options, stage_options, component_options, dist_options] {
            result = deep_merge(&result, &options, false);
        }
        result
    }

    /// Builds the executor configured for this (stage, plugin scope).
    pub fn executor_for(
        &self,
        stage: &str,
        dist: Option<&Distribution>,
        component: Option<&Component>,
    ) -> Result<Box<dyn executor::Executor>, ConfigError> {
        let options = self.executor_options(stage, dist, component);
        let spec: executor::ExecutorSpec = serde_yaml::from_value(options)
            .map_err(|e| ConfigError(format!("Invalid executor options: {e}")))?;
        executor::new_executor(&spec)
            .map_err(|_| ConfigError("No defined executor found in configuration file.".to_string()))
    }
}

/// Extracts `stages[… {stage: {executor: …}} …]`'s executor mapping.
fn stage_executor_entry(entries: &[Value], stage: &str) -> Value {
    for entry in entries {
        if let Some(mapping) = entry.as_mapping() {
            if let Some((key, value)) = mapping.iter().next() {
                if key.as_str() == Some(stage) {
                    if let Some(executor) = value.as_mapping().and_then(|m| m.get("executor")) {
                        return executor.clone();
                    }
                }
            }
        }
    }
    Value::Mapping(Mapping::new())
}

/// Splits a `name` or `{name: {options}}` list entry.
fn split_entry(entry: &Value) -> Result<(String, Mapping), ConfigError> {
    match entry {
        Value::String(name) => Ok((name.clone(), Mapping::new())),
        Value::Mapping(mapping) => {
            let (key, value) = mapping
                .iter()
                .next()
                .ok_or_else(|| ConfigError("Empty entry.".to_string()))?;
            let name = key
                .as_str()
                .ok_or_else(|| ConfigError("Entry name must be a string.".to_string()))?;
            let options = match value {
                Value::Mapping(options) => options.clone(),
                Value::Null => Mapping::new(),
                _ => return Err(ConfigError(format!("Invalid options for '{name}'."))),
            };
            Ok((name.to_string(), options))
        }
        _ => Err(ConfigError("Invalid list entry.".to_string())),
    }
}

fn load_yaml_mapping(conf_file: &Path) -> Result<Mapping, ConfigError> {
    if !conf_file.exists() {
        return Err(ConfigError(format!(
            "Cannot find builder configuration '{}'.",
            conf_file.display()
        )));
    }
    let text = std::fs::read_to_string(conf_file).map_err(|e| ConfigError(e.to_string()))?;
    let value: Value = serde_yaml::from_str(&text)
        .map_err(|_| ConfigError(format!("Failed to parse config '{}'.", conf_file.display())))?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => Err(ConfigError(format!(
            "Failed to parse config '{}'.",
            conf_file.display()
        ))),
    }
}

fn is_plus_list_key(key: &Value) -> bool {
    key.as_str()
        .map(|k| LIST_KEYS.iter().any(|lk| format!("+{lk}") == k))
        .unwrap_or(false)
}

fn append_list(combined: &mut Mapping, key: &Value, value: &Value) {
    let slot = combined
        .entry(key.clone())
        .or_insert_with(|| Value::Sequence(Vec::new()));
    if let (Value::Sequence(list), Value::Sequence(new)) = (slot, value) {
        list.extend(new.iter().cloned());
    }
}

/// One include layer folded into the accumulated configuration: mappings
/// merge, anything else (lists included) is replaced by the later layer.
fn fold_layer(combined: &mut Mapping, layer: &Mapping) {
    for (key, value) in layer {
        if is_plus_list_key(key) {
            append_list(combined, key, value);
            continue;
        }
        let merged = match combined.get(key) {
            Some(existing) if existing.is_mapping() => deep_merge(existing, value, false),
            _ => value.clone(),
        };
        combined.insert(key.clone(), merged);
    }
}

fn load_config(conf_file: &Path, options: Option<&Mapping>) -> Result<Mapping, ConfigError> {
    let mut conf = load_yaml_mapping(conf_file)?;

    let includes: Vec<String> = conf
        .remove("include")
        .as_ref()
        .and_then(Value::as_sequence)
        .map(|seq| {
            seq.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut included_data: Vec<Mapping> = Vec::new();
    for include in includes {
        let mut path = PathBuf::from(&include);
        if path.is_relative() {
            // Include paths resolve relative to the file naming them.
            path = conf_file.parent().unwrap_or(Path::new(".")).join(path);
        }
        included_data.push(load_config(&path, None)?);
    }
    if let Some(options) = options {
        included_data.push(options.clone());
    }

    let mut combined = Mapping::new();
    for layer in &included_data {
        fold_layer(&mut combined, layer);
    }

    // The main file overrides included values outright.
    for (key, value) in &conf {
        if is_plus_list_key(key) {
            append_list(&mut combined, key, value);
        } else {
            combined.insert(key.clone(), value.clone());
        }
    }

    // CLI overrides win last, but only for keys that merge cleanly.
    if let Some(options) = options {
        for (key, value) in options {
            let is_protected = key
                .as_str()
                .map(|k| k.starts_with('+') || LIST_KEYS.contains(&k))
                .unwrap_or(false);
            if is_protected {
                continue;
            }
            let merged = match combined.get(key) {
                Some(existing) if existing.is_mapping() && value.is_mapping() => {
                    deep_merge(existing, value, false)
                }
                _ => value.clone(),
            };
            combined.insert(key.clone(), merged);
        }
    }

    Ok(combined)
}

/// Loads the file and folds every `+key` accumulation into its plain key,
/// merging duplicate named entries in order.
fn parse_configuration_file(conf_file: &Path, options: &Mapping) -> Result<Mapping, ConfigError> {
    let mut conf = load_config(conf_file, Some(options))?;

    for key in LIST_KEYS {
        let plus_key = Value::String(format!("+{key}"));
        if !conf.contains_key(&plus_key) {
            continue;
        }
        let base = conf
            .get(key)
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default();
        let extra = conf
            .get(&plus_key)
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default();

        let mut merged: Mapping = Mapping::new();
        for entry in base.iter().chain(extra.iter()) {
            match entry {
                Value::String(name) => {
                    merged
                        .entry(Value::String(name.clone()))
                        .or_insert(Value::Null);
                }
                Value::Mapping(mapping) => {
                    if let Some((name, value)) = mapping.iter().next() {
                        match merged.get(name) {
                            Some(existing) if !existing.is_null() => {
                                let combined = deep_merge(existing, value, false);
                                merged.insert(name.clone(), combined);
                            }
                            _ => {
                                merged.insert(name.clone(), value.clone());
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        let mut list: Vec<Value> = Vec::new();
        for (name, value) in merged {
            if value.is_null() {
                list.push(name);
            } else {
                let mut entry = Mapping::new();
                entry.insert(name, value);
                list.push(Value::Mapping(entry));
            }
        }
        conf.insert(Value::String(key.to_string()), Value::Sequence(list));
        conf.remove(&plus_key);
    }

    Ok(conf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn includes_merge_and_append() {
        let dir = tempfile::tempdir().unwrap();
        write(
            dir.path(),
            "base.yml",
            "distributions: [host-fc32]\nexecutor:\n  type: local\n",
        );
        let main = write(
            dir.path(),
            "builder.yml",
            "include: [base.yml]\n+distributions: [vm-bookworm]\ndebug: true\n",
        );

        let config = Config::from_file(&main, &[]).unwrap();
        let dists: Vec<&str> = config
            .distributions()
            .iter()
            .map(|d| d.distribution())
            .collect();
        assert_eq!(dists, vec!["host-fc32", "vm-bookworm"]);
        assert!(config.debug());
    }

    #[test]
    fn cli_overrides_win_last() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "builder.yml",
            "executor:\n  type: qubes\n  options:\n    dispvm: builder-dvm\ndebug: false\n",
        );

        let config = Config::from_file(
            &main,
            &[
                "debug=true".to_string(),
                "executor:options:dispvm=other-dvm".to_string(),
            ],
        )
        .unwrap();
        assert!(config.debug());
        let options = config.executor_options("build", None, None);
        assert_eq!(options["options"]["dispvm"].as_str(), Some("other-dvm"));
        // The rest of the executor stanza survives the override.
        assert_eq!(options["type"].as_str(), Some("qubes"));
    }

    #[test]
    fn executor_option_layering() {
        let dir = tempfile::tempdir().unwrap();
        let main = write(
            dir.path(),
            "builder.yml",
            r#"
executor:
  type: qubes
  options:
    dispvm: default-dvm
stages:
  - fetch
  - sign:
      executor:
        type: local
distributions:
  - host-fc32:
      stages:
        - build:
            executor:
              type: podman
              options:
                image: builder-fedora
components:
  - core-qrexec:
      host:
        stages:
          - build:
              executor:
                options:
                  clean: false
"#,
        );

        let config = Config::from_file(&main, &[]).unwrap();
        let dist = &config.distributions()[0];
        let component = &config.components()[0];

        // Stage override replaces the global type.
        let sign = config.executor_options("sign", None, None);
        assert_eq!(sign["type"].as_str(), Some("local"));

        // Distribution layer wins over component and global layers.
        let build = config.executor_options("build", Some(dist), Some(component));
        assert_eq!(build["type"].as_str(), Some("podman"));
        assert_eq!(build["options"]["image"].as_str(), Some("builder-fedora"));
        assert_eq!(build["options"]["clean"].as_bool(), Some(false));
        // Untouched stages keep the global executor.
        let fetch = config.executor_options("fetch", Some(dist), Some(component));
        assert_eq!(fetch["type"].as_str(), Some("qubes"));
    }

    #[test]
    fn duplicate_component_entries_merge() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "extra.yml", "+components:\n  - lvm2:\n      branch: stable\n");
        let main = write(
            dir.path(),
            "builder.yml",
            "include: [extra.yml]\ncomponents: [lvm2]\n",
        );
        let config = Config::from_file(&main, &[]).unwrap();
        assert_eq!(config.components().len(), 1);
        assert_eq!(config.components()[0].branch, "stable");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = Config::from_file(Path::new("/no/such/builder.yml"), &[]).unwrap_err();
        assert!(err.to_string().contains("Cannot find builder configuration"));
    }
}
