//! Publish stage: gated promotion of signed artifacts into the
//! hardlink-only repository tree, metadata regeneration and detached
//! metadata signatures, plus the unpublish inverse.

pub mod archlinux;
pub mod deb;
pub mod rpm;

use std::path::Path;

use buildconfig::{Config, Distribution};
use chrono::Utc;
use executor::Executor;

use crate::PluginError;

/// Repositories a standard component may be published into.
pub const COMPONENT_REPOSITORIES: [&str; 4] =
    ["current", "current-testing", "security-testing", "unstable"];

/// Repositories a template may be published into.
pub const TEMPLATE_REPOSITORIES: [&str; 4] = [
    "templates-itl",
    "templates-itl-testing",
    "templates-community",
    "templates-community-testing",
];

/// Repositories that count as testing for the minimum-age gate.
const TESTING_REPOSITORIES: [&str; 2] = ["current-testing", "security-testing"];

pub(crate) fn require_local(executor: &dyn Executor) -> Result<(), PluginError> {
    if executor.description() != "local" {
        return Err(PluginError::Publish(
            "This plugin only supports local executor.".to_string(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_component_repository(
    repository: &str,
    scope: &str,
) -> Result<(), PluginError> {
    if !COMPONENT_REPOSITORIES.contains(&repository) {
        return Err(PluginError::Publish(format!(
            "{scope}: Refusing to publish components into '{repository}'."
        )));
    }
    Ok(())
}

pub(crate) fn min_age_failure_msg(scope: &str, min_age_days: i64) -> String {
    format!(
        "{scope}: Refusing to publish to 'current' as packages are not uploaded to \
         'current-testing' or 'security-testing' for at least {min_age_days} days."
    )
}

/// The minimum-age gate for promotion to stable.
///
/// True when the artifact already sits in `current`, or has been in a
/// testing repository for at least `min-age-days` (measured from the mtime
/// of the publish record). `ignore_min_age` waives the age, never the
/// testing-repository requirement.
pub(crate) fn can_be_published_in_stable(
    config: &Config,
    publish_dir: &Path,
    basename: &str,
    ignore_min_age: bool,
) -> Result<bool, PluginError> {
    let record = artifacts::read_info(publish_dir, "publish", basename)
        .map_err(|e| PluginError::Publish(e.to_string()))?;
    if record.repository_publish.is_empty() {
        return Ok(false);
    }
    if record.is_published_in("current") {
        return Ok(true);
    }
    if !TESTING_REPOSITORIES
        .iter()
        .any(|repo| record.is_published_in(repo))
    {
        return Ok(false);
    }
    if ignore_min_age {
        return Ok(true);
    }

    let mtime = artifacts::info_mtime(publish_dir, "publish", basename)
        .map_err(|e| PluginError::Publish(e.to_string()))?;
    let published = chrono::DateTime::<Utc>::from(mtime);
    let age = Utc::now().signed_duration_since(published);
    Ok(age >= chrono::Duration::days(config.min_age_days()))
}

/// Debian suite a publish repository maps to, e.g. `bookworm-testing`.
pub(crate) fn debian_suite(dist: &Distribution, repository: &str) -> String {
    let mut suite = dist.name.clone();
    match repository {
        "current-testing" => suite.push_str("-testing"),
        "security-testing" => suite.push_str("-securitytesting"),
        "unstable" => suite.push_str("-unstable"),
        _ => {}
    }
    suite
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config_with_min_age(dir: &Path) -> Config {
        let path = dir.join("builder.yml");
        std::fs::write(&path, "min-age-days: 5\n").unwrap();
        Config::from_file(&path, &[]).unwrap()
    }

    fn record_with(repos: &[&str]) -> artifacts::InfoRecord {
        let mut record = artifacts::InfoRecord::default();
        for repo in repos {
            record.record_publish(repo, "202301010101");
        }
        record
    }

    #[test]
    fn gate_refuses_fresh_testing_publication() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_min_age(dir.path());
        let publish_dir = dir.path().join("publish");
        artifacts::save_info(&publish_dir, "publish", "pkg", &record_with(&["current-testing"]))
            .unwrap();

        // The record was written moments ago: younger than five days.
        assert!(!can_be_published_in_stable(&config, &publish_dir, "pkg", false).unwrap());
        // --ignore-min-age waives the age requirement.
        assert!(can_be_published_in_stable(&config, &publish_dir, "pkg", true).unwrap());
    }

    #[test]
    fn gate_requires_testing_repository() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_min_age(dir.path());
        let publish_dir = dir.path().join("publish");
        artifacts::save_info(&publish_dir, "publish", "pkg", &record_with(&["unstable"]))
            .unwrap();

        // Even with the age waived, unstable never feeds current.
        assert!(!can_be_published_in_stable(&config, &publish_dir, "pkg", true).unwrap());
    }

    #[test]
    fn gate_accepts_already_stable() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_min_age(dir.path());
        let publish_dir = dir.path().join("publish");
        artifacts::save_info(&publish_dir, "publish", "pkg", &record_with(&["current"]))
            .unwrap();

        assert!(can_be_published_in_stable(&config, &publish_dir, "pkg", false).unwrap());
    }

    #[test]
    fn missing_record_fails_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_min_age(dir.path());
        assert!(
            !can_be_published_in_stable(&config, &PathBuf::from(dir.path()), "pkg", false)
                .unwrap()
        );
    }

    #[test]
    fn suites_follow_repositories() {
        let dist = Distribution::new("vm-bookworm").unwrap();
        assert_eq!(debian_suite(&dist, "current"), "bookworm");
        assert_eq!(debian_suite(&dist, "current-testing"), "bookworm-testing");
        assert_eq!(debian_suite(&dist, "unstable"), "bookworm-unstable");
    }
}
