use std::path::PathBuf;

use thiserror::Error;

/// Malformed, missing, or unsafe configuration.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

/// Bad source tree: missing or invalid `version`, `rel`, or build manifest.
#[derive(Debug, Error)]
pub enum ComponentError {
    #[error("Cannot find '.qubesbuilder' in {0}.")]
    NoManifest(PathBuf),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct DistributionError(pub String);

#[derive(Debug, Error)]
#[error("{0}")]
pub struct TemplateError(pub String);
