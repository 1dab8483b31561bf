use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::PluginError;

/// Plugin entities discovered from the configured search directories.
///
/// The stage plugins themselves form a static registry; entities contribute
/// the on-disk assets (scripts, keys, chroot configurations) that are
/// copied into executors, plus extra names plugin dependencies may check.
/// Entity names must be unique across all search directories.
pub struct PluginManager {
    entities: BTreeMap<String, PathBuf>,
}

impl PluginManager {
    pub fn discover(directories: &[PathBuf]) -> Result<Self, PluginError> {
        let mut entities = BTreeMap::new();
        for directory in directories {
            if !directory.exists() {
                warn!(
                    "Ignoring non existing directory '{}'. If directory is a component plugin, \
                     component source may not be fetched.",
                    directory.display()
                );
                continue;
            }
            let children = std::fs::read_dir(directory)
                .map_err(|e| PluginError::Plugin(e.to_string()))?;
            for child in children {
                let child = child.map_err(|e| PluginError::Plugin(e.to_string()))?;
                let path = child.path();
                // Either a directory of assets or a single-file manifest.
                let is_manifest = path
                    .extension()
                    .map(|e| e == "yml" || e == "yaml")
                    .unwrap_or(false);
                if !path.is_dir() && !is_manifest {
                    continue;
                }
                let name = entity_name(&path);
                if entities.contains_key(&name) {
                    return Err(PluginError::Plugin(format!(
                        "Conflicting module name detected: '{name}'."
                    )));
                }
                entities.insert(name, path);
            }
        }
        Ok(Self { entities })
    }

    pub fn empty() -> Self {
        Self {
            entities: BTreeMap::new(),
        }
    }

    pub fn has_entity(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    /// Directory of the entity's assets, if present on the search path.
    pub fn entity_dir(&self, name: &str) -> Option<&Path> {
        self.entities.get(name).map(PathBuf::as_path)
    }
}

/// Entity naming: strip a `qubes-` prefix, translate `-` to `_`.
fn entity_name(path: &Path) -> String {
    let name = if path.is_dir() {
        path.file_name().unwrap_or_default().to_string_lossy().into_owned()
    } else {
        path.file_stem().unwrap_or_default().to_string_lossy().into_owned()
    };
    let name = name.strip_prefix("qubes-").unwrap_or(&name);
    name.replace('-', "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn discovers_and_normalizes_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("fetch")).unwrap();
        std::fs::create_dir(dir.path().join("qubes-extra-plugin")).unwrap();
        std::fs::write(dir.path().join("stray-file"), b"").unwrap();

        let manager = PluginManager::discover(&[dir.path().to_path_buf()]).unwrap();
        assert!(manager.has_entity("fetch"));
        assert!(manager.has_entity("extra_plugin"));
        assert!(!manager.has_entity("stray-file"));
        assert_eq!(
            manager.entity_dir("fetch").unwrap(),
            dir.path().join("fetch")
        );
    }

    #[test]
    fn duplicate_names_fail_loading() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        std::fs::create_dir(a.path().join("qubes-fetch")).unwrap();
        std::fs::create_dir(b.path().join("fetch")).unwrap();

        let result =
            PluginManager::discover(&[a.path().to_path_buf(), b.path().to_path_buf()]);
        assert!(result.is_err());
    }

    #[test]
    fn missing_directories_are_tolerated() {
        let manager =
            PluginManager::discover(&[PathBuf::from("/no/such/plugin/dir")]).unwrap();
        assert!(!manager.has_entity("anything"));
    }
}
