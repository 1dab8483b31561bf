use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use lazy_static::lazy_static;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use sha2::{Digest, Sha512};
use strum_macros::{Display, EnumString};

use crate::gitignore::GitIgnore;
use crate::{deep_check, ComponentError};

lazy_static! {
    static ref VERSION_RE: Regex = Regex::new(r"^[0-9]+(\.[0-9]+)*$").unwrap();
    static ref RELEASE_RE: Regex = Regex::new(r"^[0-9]+(\..*)?$").unwrap();
    static ref DEVEL_RE: Regex = Regex::new(r"^[0-9]+$").unwrap();
    static ref DESCRIBE_RE: Regex = Regex::new(r"^v?([0-9]+(?:\.[0-9]+)*)-([0-9]+.*)$").unwrap();
}

/// How the tip of a fetched component is authenticated.
#[derive(Clone, Copy, Debug, Default, Display, EnumString, Eq, PartialEq)]
#[strum(serialize_all = "kebab-case")]
pub enum VerificationMode {
    Insecure,
    #[default]
    SignedTag,
    SignedCommit,
}

/// A named upstream source tree, created by the config resolver and
/// immutable except for the lazily derived version fields.
#[derive(Debug)]
pub struct Component {
    pub name: String,
    pub source_dir: PathBuf,
    pub url: String,
    pub branch: String,
    pub maintainers: Vec<String>,
    pub verification_mode: VerificationMode,
    /// Fetch timeout in seconds.
    pub timeout: u64,
    pub fetch_versions_only: bool,
    pub min_distinct_maintainers: u32,
    pub is_plugin: bool,
    pub has_packages: bool,
    devel_path: Option<PathBuf>,
    options: Mapping,

    version: OnceLock<String>,
    release: OnceLock<String>,
    devel: OnceLock<String>,
    source_hash: OnceLock<String>,
}

pub struct ComponentSpec {
    pub name: String,
    pub source_dir: PathBuf,
    pub url: String,
    pub branch: String,
    pub maintainers: Vec<String>,
    pub verification_mode: VerificationMode,
    pub timeout: u64,
    pub fetch_versions_only: bool,
    pub min_distinct_maintainers: u32,
    pub is_plugin: bool,
    pub has_packages: bool,
    pub devel_path: Option<PathBuf>,
    pub options: Mapping,
}

impl Component {
    pub fn new(spec: ComponentSpec) -> Self {
        Self {
            name: spec.name,
            source_dir: spec.source_dir,
            url: spec.url,
            branch: spec.branch,
            maintainers: spec.maintainers,
            verification_mode: spec.verification_mode,
            timeout: spec.timeout,
            fetch_versions_only: spec.fetch_versions_only,
            min_distinct_maintainers: spec.min_distinct_maintainers,
            is_plugin: spec.is_plugin,
            has_packages: spec.has_packages,
            devel_path: spec.devel_path,
            options: spec.options,
            version: OnceLock::new(),
            release: OnceLock::new(),
            devel: OnceLock::new(),
            source_hash: OnceLock::new(),
        }
    }

    /// The per-component configuration stanza (stage executor overrides,
    /// git overrides).
    pub fn options(&self) -> &Mapping {
        &self.options
    }

    /// Version from the `version` file, falling back to `git describe`.
    pub fn version(&self) -> Result<&str, ComponentError> {
        self.resolve_versions()?;
        Ok(self.version.get().unwrap())
    }

    /// Release from the `rel` file (or the describe output); defaults to 1.
    pub fn release(&self) -> Result<&str, ComponentError> {
        self.resolve_versions()?;
        Ok(self.release.get().unwrap())
    }

    /// The devel counter value, empty when devel versioning is off.
    pub fn devel(&self) -> Result<&str, ComponentError> {
        if let Some(devel) = self.devel.get() {
            return Ok(devel);
        }
        let devel = match &self.devel_path {
            Some(path) if path.exists() => {
                let devel = read_first_line(path)?;
                if !DEVEL_RE.is_match(&devel) {
                    return Err(ComponentError::Invalid(format!(
                        "Invalid devel version for {}.",
                        self.name
                    )));
                }
                devel
            }
            _ => String::new(),
        };
        Ok(self.devel.get_or_init(|| devel))
    }

    /// Full `{version}-{release}[.{devel}]` string keying artifact dirs.
    pub fn verrel(&self) -> Result<String, ComponentError> {
        let mut verrel = format!("{}-{}", self.version()?, self.release()?);
        let devel = self.devel()?;
        if !devel.is_empty() {
            verrel = format!("{verrel}.{devel}");
        }
        Ok(verrel)
    }

    /// Bumps the devel counter. Called exactly once per pipeline run, before
    /// any prep step consumes the value.
    pub fn increment_devel_versions(&self) -> Result<(), ComponentError> {
        let path = self.devel_path.as_ref().ok_or_else(|| {
            ComponentError::Invalid(format!("Devel path not provided for {}.", self.name))
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ComponentError::Invalid(e.to_string()))?;
        }
        let devel = if path.exists() {
            let current = read_first_line(path)?;
            let current: u64 = current.parse().map_err(|_| {
                ComponentError::Invalid(format!("Invalid devel version for {}.", self.name))
            })?;
            (current + 1).to_string()
        } else {
            "1".to_string()
        };
        std::fs::write(path, &devel).map_err(|e| ComponentError::Invalid(e.to_string()))?;
        let _ = self.devel.set(devel);
        Ok(())
    }

    fn resolve_versions(&self) -> Result<(), ComponentError> {
        if self.version.get().is_some() {
            return Ok(());
        }
        if !self.source_dir.exists() {
            return Err(ComponentError::Invalid(format!(
                "Cannot find source directory {}.",
                self.source_dir.display()
            )));
        }

        let mut version = String::new();
        let mut release = String::new();

        let version_file = self.source_dir.join("version");
        if version_file.exists() {
            version = read_first_line(&version_file)?;
            if !VERSION_RE.is_match(&version) {
                return Err(ComponentError::Invalid(format!(
                    "Invalid version for {}.",
                    self.source_dir.display()
                )));
            }
        } else {
            let output = Command::new("git")
                .args(["describe", "--match=v*", "--abbrev=0"])
                .current_dir(&self.source_dir)
                .output()
                .map_err(|e| ComponentError::Invalid(e.to_string()))?;
            let described = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !described.is_empty() {
                if described.len() > 255 {
                    return Err(ComponentError::Invalid(format!(
                        "Invalid version for {}.",
                        self.source_dir.display()
                    )));
                }
                let captures = DESCRIBE_RE.captures(&described).ok_or_else(|| {
                    ComponentError::Invalid(format!(
                        "Invalid version for {}.",
                        self.source_dir.display()
                    ))
                })?;
                version = captures[1].to_string();
                release = captures[2].to_string();
            }
        }

        if version.is_empty() {
            return Err(ComponentError::Invalid(format!(
                "Cannot determine version for {}.",
                self.source_dir.display()
            )));
        }

        if release.is_empty() {
            let release_file = self.source_dir.join("rel");
            release = if release_file.exists() {
                read_first_line(&release_file)?
            } else {
                "1".to_string()
            };
        }
        if !RELEASE_RE.is_match(&release) {
            return Err(ComponentError::Invalid(format!(
                "Invalid release for {}.",
                self.source_dir.display()
            )));
        }

        let _ = self.version.set(version);
        let _ = self.release.set(release);
        Ok(())
    }

    /// Renders the `.qubesbuilder` manifest with `@VERSION@`/`@REL@` and the
    /// given extra placeholders substituted, then path-safety-checks it.
    pub fn manifest(
        &self,
        placeholders: &[(String, String)],
    ) -> Result<Mapping, ComponentError> {
        let build_file = self.source_dir.join(".qubesbuilder");
        if !build_file.exists() {
            return Err(ComponentError::NoManifest(self.source_dir.clone()));
        }
        let mut data = std::fs::read_to_string(&build_file)
            .map_err(|e| ComponentError::Invalid(e.to_string()))?;

        data = data.replace("@VERSION@", self.version()?);
        let release = self.release()?.to_string();
        data = data.replace("@REL@", &release);
        for (key, value) in placeholders {
            data = data.replace(key, value);
        }

        let rendered: Value = serde_yaml::from_str(&data)
            .map_err(|_| ComponentError::Invalid("Cannot render '.qubesbuilder'.".to_string()))?;
        deep_check(&rendered)
            .map_err(|e| ComponentError::Invalid(format!("Invalid '.qubesbuilder': {e}")))?;
        match rendered {
            Value::Mapping(mapping) => Ok(mapping),
            Value::Null => Ok(Mapping::new()),
            _ => Err(ComponentError::Invalid(
                "Cannot render '.qubesbuilder'.".to_string(),
            )),
        }
    }

    /// SHA-512 over the sorted, gitignore-filtered source tree.
    ///
    /// Entry names and file contents feed the digest; mtimes and traversal
    /// order do not, so the hash is stable across checkouts.
    pub fn source_hash(&self) -> Result<&str, ComponentError> {
        if let Some(hash) = self.source_hash.get() {
            return Ok(hash);
        }
        let mut hasher = Sha512::new();
        hash_directory(&self.source_dir, &mut hasher)?;
        let digest = hex::encode(hasher.finalize());
        Ok(self.source_hash.get_or_init(|| digest))
    }

    pub fn head_commit_hash(&self) -> Result<String, ComponentError> {
        let output = Command::new("git")
            .args(["-C"])
            .arg(&self.source_dir)
            .args(["rev-parse", "HEAD^{}"])
            .output()
            .map_err(|e| ComponentError::Invalid(e.to_string()))?;
        if !output.status.success() {
            return Err(ComponentError::Invalid(format!(
                "Cannot determine source commit hash for {}.",
                self.source_dir.display()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn read_first_line(path: &Path) -> Result<String, ComponentError> {
    let text =
        std::fs::read_to_string(path).map_err(|e| ComponentError::Invalid(e.to_string()))?;
    Ok(text.lines().next().unwrap_or_default().to_string())
}

fn hash_directory(dir: &Path, hasher: &mut Sha512) -> Result<(), ComponentError> {
    if !dir.is_dir() {
        return Err(ComponentError::Invalid(format!(
            "Cannot find '{}'.",
            dir.display()
        )));
    }
    // Each directory's own .gitignore filters its direct children; a parent's
    // patterns never cascade into subdirectories.
    let ignore = match std::fs::read_to_string(dir.join(".gitignore")) {
        Ok(text) => Some(GitIgnore::from_lines(text.lines())),
        Err(_) => None,
    };
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .map_err(|e| ComponentError::Invalid(e.to_string()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();
    // Always hash in one canonical order regardless of readdir order.
    entries.sort_by_key(|path| path.to_string_lossy().to_lowercase());

    for path in entries {
        let name = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        if name == ".git" {
            continue;
        }
        let is_dir = path.is_dir();
        if let Some(ignore) = &ignore {
            if ignore.matches(&name, is_dir) {
                continue;
            }
        }
        hasher.update(name.as_bytes());
        if is_dir {
            hash_directory(&path, hasher)?;
        } else if path.is_file() {
            let data =
                std::fs::read(&path).map_err(|e| ComponentError::Invalid(e.to_string()))?;
            hasher.update(&data);
        }
    }
    Ok(())
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl PartialEq for Component {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.source_dir == other.source_dir
    }
}

impl Eq for Component {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn component(dir: &Path) -> Component {
        Component::new(ComponentSpec {
            name: "core-qrexec".to_string(),
            source_dir: dir.to_path_buf(),
            url: "https://github.com/QubesOS/qubes-core-qrexec".to_string(),
            branch: "main".to_string(),
            maintainers: vec![],
            verification_mode: VerificationMode::SignedTag,
            timeout: 3600,
            fetch_versions_only: false,
            min_distinct_maintainers: 1,
            is_plugin: false,
            has_packages: true,
            devel_path: None,
            options: Mapping::new(),
        })
    }

    #[test]
    fn reads_version_and_release_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "4.1.16\n").unwrap();
        std::fs::write(dir.path().join("rel"), "1\n").unwrap();
        let component = component(dir.path());
        assert_eq!(component.version().unwrap(), "4.1.16");
        assert_eq!(component.release().unwrap(), "1");
        assert_eq!(component.verrel().unwrap(), "4.1.16-1");
    }

    #[test]
    fn rejects_malformed_version() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "v4.1\n").unwrap();
        assert!(component(dir.path()).version().is_err());
    }

    #[test]
    fn release_defaults_to_one() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "1.0\n").unwrap();
        assert_eq!(component(dir.path()).release().unwrap(), "1");
    }

    #[test]
    fn source_hash_ignores_mtime_and_gitignored_files() {
        let make_tree = |ignored: bool| {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("version"), "1.0\n").unwrap();
            std::fs::write(dir.path().join(".gitignore"), "*.tmp\n").unwrap();
            std::fs::write(dir.path().join("main.c"), "int main;\n").unwrap();
            if ignored {
                std::fs::write(dir.path().join("scratch.tmp"), "junk").unwrap();
            }
            dir
        };
        let a = make_tree(false);
        let b = make_tree(true);
        let hash_a = component(a.path()).source_hash().unwrap().to_string();
        let hash_b = component(b.path()).source_hash().unwrap().to_string();
        assert_eq!(hash_a, hash_b);
        assert_eq!(hash_a.len(), 128);
    }

    #[test]
    fn source_hash_applies_gitignore_per_directory() {
        let make_tree = |with_sub_junk: bool, with_sub_log: bool| {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("version"), "1.0\n").unwrap();
            std::fs::write(dir.path().join(".gitignore"), "*.log\n").unwrap();
            let sub = dir.path().join("sub");
            std::fs::create_dir(&sub).unwrap();
            std::fs::write(sub.join(".gitignore"), "*.tmp\n").unwrap();
            std::fs::write(sub.join("code.c"), "int x;\n").unwrap();
            if with_sub_junk {
                std::fs::write(sub.join("junk.tmp"), "junk").unwrap();
            }
            if with_sub_log {
                std::fs::write(sub.join("app.log"), "log").unwrap();
            }
            dir
        };

        // The subdirectory's own .gitignore excludes its direct children.
        let a = make_tree(false, false);
        let b = make_tree(true, false);
        assert_eq!(
            component(a.path()).source_hash().unwrap(),
            component(b.path()).source_hash().unwrap()
        );

        // The root's patterns do not cascade into subdirectories.
        let c = make_tree(false, true);
        assert_ne!(
            component(a.path()).source_hash().unwrap(),
            component(c.path()).source_hash().unwrap()
        );
    }

    #[test]
    fn devel_counter_increments() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "1.0\n").unwrap();
        let devel_path = dir.path().join("noversion/devel");
        let mut spec_component = component(dir.path());
        spec_component.devel_path = Some(devel_path.clone());

        spec_component.increment_devel_versions().unwrap();
        assert_eq!(spec_component.devel().unwrap(), "1");
        assert_eq!(std::fs::read_to_string(&devel_path).unwrap(), "1");
        assert_eq!(spec_component.verrel().unwrap(), "1.0-1.1");
    }

    #[test]
    fn manifest_substitutes_placeholders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "2.5\n").unwrap();
        std::fs::write(
            dir.path().join(".qubesbuilder"),
            "source:\n  files:\n    - url: https://example.org/pkg-@VERSION@.tar.gz\n      sha256: pkg-@VERSION@.tar.gz.sha256\n",
        )
        .unwrap();
        let manifest = component(dir.path()).manifest(&[]).unwrap();
        let source = manifest.get("source").unwrap();
        let url = source["files"][0]["url"].as_str().unwrap();
        assert_eq!(url, "https://example.org/pkg-2.5.tar.gz");
    }

    #[test]
    fn missing_manifest_is_distinct_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version"), "1.0\n").unwrap();
        assert!(matches!(
            component(dir.path()).manifest(&[]),
            Err(ComponentError::NoManifest(_))
        ));
    }
}
