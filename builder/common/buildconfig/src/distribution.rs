use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde_yaml::Mapping;
use strum_macros::{Display, EnumString};

use crate::DistributionError;

lazy_static! {
    static ref FEDORA_RE: Regex = Regex::new(r"^fc([0-9]+)$").unwrap();
    static ref CENTOS_STREAM_RE: Regex = Regex::new(r"^centos-stream([0-9]+)$").unwrap();
}

const DEBIAN: &[(&str, &str)] = &[
    ("stretch", "9"),
    ("buster", "10"),
    ("bullseye", "11"),
    ("bookworm", "12"),
    ("trixie", "13"),
];

// LTS releases only.
const UBUNTU: &[(&str, &str)] = &[
    ("bionic", "18.04"),
    ("focal", "20.04"),
    ("jammy", "22.04"),
    ("noble", "24.04"),
];

fn debian_architecture(arch: &str) -> &str {
    match arch {
        "x86_64" => "amd64",
        "ppc64le" => "ppc64el",
        other => other,
    }
}

/// Packaging family a distribution belongs to.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Family {
    Rpm,
    Deb,
    Archlinux,
    Gentoo,
    Windows,
}

/// Whether packages target the host system or guest VM images.
#[derive(Clone, Copy, Debug, Display, EnumString, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum PackageSet {
    Host,
    Vm,
}

/// A build target distribution, parsed from `{package-set}-{name}[.arch]`.
#[derive(Clone, Debug)]
pub struct Distribution {
    distribution: String,
    pub package_set: PackageSet,
    pub name: String,
    pub architecture: String,
    pub fullname: String,
    pub version: String,
    /// Release tag embedded in package names, e.g. `fc38`, `deb12u`.
    pub tag: String,
    pub family: Family,
    options: Mapping,
}

impl Distribution {
    pub fn new(distribution: &str) -> Result<Self, DistributionError> {
        Self::with_options(distribution, Mapping::new())
    }

    pub fn with_options(distribution: &str, options: Mapping) -> Result<Self, DistributionError> {
        let (package_set, rest) = distribution.split_once('-').ok_or_else(|| {
            DistributionError("Please specify package set either 'host' or 'vm'.".to_string())
        })?;
        let package_set: PackageSet = package_set.parse().map_err(|_| {
            DistributionError("Please specify package set either 'host' or 'vm'.".to_string())
        })?;

        let name = match rest.split_once('.') {
            Some((name, _)) => name.to_string(),
            None => rest.to_string(),
        };

        let (fullname, version, tag, family, architecture);
        if let Some(captures) = FEDORA_RE.captures(&name) {
            fullname = "fedora".to_string();
            version = captures[1].to_string();
            tag = name.clone();
            family = Family::Rpm;
            architecture = Self::default_arch(rest);
        } else if let Some(captures) = CENTOS_STREAM_RE.captures(&name) {
            fullname = "centos-stream".to_string();
            version = captures[1].to_string();
            tag = format!("el{version}");
            family = Family::Rpm;
            architecture = Self::default_arch(rest);
        } else if let Some((_, v)) = DEBIAN.iter().find(|(n, _)| *n == name) {
            fullname = "debian".to_string();
            version = v.to_string();
            tag = format!("deb{version}u");
            family = Family::Deb;
            architecture = debian_architecture(&Self::default_arch(rest)).to_string();
        } else if let Some((_, v)) = UBUNTU.iter().find(|(n, _)| *n == name) {
            fullname = "ubuntu".to_string();
            version = v.to_string();
            tag = name.clone();
            family = Family::Deb;
            architecture = debian_architecture(&Self::default_arch(rest)).to_string();
        } else if name == "archlinux" {
            fullname = "archlinux".to_string();
            version = "rolling".to_string();
            tag = "archlinux".to_string();
            family = Family::Archlinux;
            architecture = Self::default_arch(rest);
        } else if name == "gentoo" {
            fullname = "gentoo".to_string();
            version = "rolling".to_string();
            tag = "gentoo".to_string();
            family = Family::Gentoo;
            architecture = Self::default_arch(rest);
        } else if let Some(v) = name.strip_prefix("win") {
            fullname = "windows".to_string();
            version = v.to_string();
            tag = name.clone();
            family = Family::Windows;
            architecture = Self::default_arch(rest);
        } else {
            return Err(DistributionError(format!(
                "Unsupported distribution '{distribution}'."
            )));
        }

        Ok(Self {
            distribution: distribution.to_string(),
            package_set,
            name,
            architecture,
            fullname,
            version,
            tag,
            family,
            options,
        })
    }

    fn default_arch(rest: &str) -> String {
        match rest.split_once('.') {
            Some((_, arch)) => arch.to_string(),
            None => "x86_64".to_string(),
        }
    }

    /// The raw identifier from configuration, e.g. `host-fc32`.
    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    /// The per-distribution configuration stanza (stage executor overrides).
    pub fn options(&self) -> &Mapping {
        &self.options
    }

    pub fn is_rpm(&self) -> bool {
        self.family == Family::Rpm
    }

    pub fn is_deb(&self) -> bool {
        self.family == Family::Deb && self.fullname == "debian"
    }

    pub fn is_ubuntu(&self) -> bool {
        self.fullname == "ubuntu"
    }

    pub fn is_archlinux(&self) -> bool {
        self.family == Family::Archlinux
    }

    pub fn is_gentoo(&self) -> bool {
        self.family == Family::Gentoo
    }

    pub fn is_windows(&self) -> bool {
        self.family == Family::Windows
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}.{}",
            self.package_set, self.fullname, self.version, self.architecture
        )
    }
}

impl PartialEq for Distribution {
    fn eq(&self, other: &Self) -> bool {
        self.distribution == other.distribution
    }
}

impl Eq for Distribution {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_fedora() {
        let dist = Distribution::new("host-fc32").unwrap();
        assert_eq!(dist.package_set, PackageSet::Host);
        assert_eq!(dist.fullname, "fedora");
        assert_eq!(dist.version, "32");
        assert_eq!(dist.tag, "fc32");
        assert_eq!(dist.architecture, "x86_64");
        assert_eq!(dist.family, Family::Rpm);
        assert_eq!(dist.to_string(), "host-fedora-32.x86_64");
    }

    #[test]
    fn parses_debian_with_arch_mapping() {
        let dist = Distribution::new("vm-bookworm.ppc64le").unwrap();
        assert_eq!(dist.fullname, "debian");
        assert_eq!(dist.version, "12");
        assert_eq!(dist.tag, "deb12u");
        assert_eq!(dist.architecture, "ppc64el");
        assert!(dist.is_deb());
        assert!(!dist.is_ubuntu());
    }

    #[test]
    fn parses_ubuntu_and_archlinux() {
        let jammy = Distribution::new("vm-jammy").unwrap();
        assert_eq!(jammy.tag, "jammy");
        assert_eq!(jammy.architecture, "amd64");
        assert!(jammy.is_ubuntu());

        let arch = Distribution::new("vm-archlinux").unwrap();
        assert_eq!(arch.version, "rolling");
        assert_eq!(arch.family, Family::Archlinux);
    }

    #[test]
    fn rejects_missing_package_set_and_unknown_names() {
        assert!(Distribution::new("fc32").is_err());
        assert!(Distribution::new("host-slackware").is_err());
    }
}
