use serde::{Deserialize, Serialize};

/// A submodule snapshot taken at fetch time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    /// Short commit hash of the submodule HEAD.
    pub hash: String,
    /// Deterministic archive name, `{name}-{hash}.tar.gz`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
}

/// One repository a record is published in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishEntry {
    pub name: String,
    pub timestamp: String,
}

/// One stage info record.
///
/// A single shape serves every stage and family; fields a stage does not
/// produce are absent from the YAML. `source-hash` propagates unchanged from
/// prep through publish so that any stage can detect stale artifacts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct InfoRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git_commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub git_version_tags: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub modules: Vec<ModuleInfo>,

    // RPM family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srpm: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rpms: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buildinfo: Option<String>,

    // Debian family.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_release_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_release_name_full: Option<String>,
    /// `native` or `quilt`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dsc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub orig: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debian: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub changes: Option<String>,

    // Debian and Arch Linux package lists.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<String>,

    /// Stage outputs relative to the stage artifacts directory.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,

    // Installer ISO.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iso: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kickstart: Option<String>,

    // Templates and ISO build timestamps.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_pkg: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub repository_publish: Vec<PublishEntry>,
}

impl InfoRecord {
    /// True when the record references no produced package at all.
    pub fn is_empty_build(&self) -> bool {
        self.srpm.is_none()
            && self.rpms.is_empty()
            && self.dsc.is_none()
            && self.packages.is_empty()
            && self.template_pkg.is_none()
    }

    /// Appends a publish entry; the list grows strictly by append.
    pub fn record_publish(&mut self, repository: &str, timestamp: &str) {
        self.repository_publish.push(PublishEntry {
            name: repository.to_string(),
            timestamp: timestamp.to_string(),
        });
    }

    /// Removes exactly the entries for `repository`; returns true when the
    /// list is now empty and the whole record should be deleted.
    pub fn drop_publish(&mut self, repository: &str) -> bool {
        self.repository_publish.retain(|e| e.name != repository);
        self.repository_publish.is_empty()
    }

    pub fn is_published_in(&self, repository: &str) -> bool {
        self.repository_publish.iter().any(|e| e.name == repository)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn publish_list_grows_by_append() {
        let mut info = InfoRecord::default();
        info.record_publish("unstable", "202301010000");
        info.record_publish("current-testing", "202301020000");
        assert_eq!(
            info.repository_publish
                .iter()
                .map(|e| e.name.as_str())
                .collect::<Vec<_>>(),
            vec!["unstable", "current-testing"]
        );

        assert!(!info.drop_publish("unstable"));
        assert!(info.is_published_in("current-testing"));
        assert!(info.drop_publish("current-testing"));
    }

    #[test]
    fn kebab_case_field_names() {
        let info = InfoRecord {
            source_hash: Some("h".into()),
            git_commit_hash: Some("c".into()),
            ..Default::default()
        };
        let yaml = serde_yaml::to_string(&info).unwrap();
        assert!(yaml.contains("source-hash: h"));
        assert!(yaml.contains("git-commit-hash: c"));
    }
}
