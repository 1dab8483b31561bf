//! Sign stage: detach-sign built artifacts with the configured key and
//! re-provision the builder-local repository so its content carries the
//! signatures.
//!
//! Signing always happens on the host (local executor); the signing key
//! never enters a sandbox.

pub mod archlinux;
pub mod deb;
pub mod rpm;

use std::path::Path;

use buildconfig::Config;
use executor::{Executor, RunSpec};
use fileutil::SafeTempDir;

use crate::{PluginError, StepLog};

pub(crate) fn require_local(executor: &dyn Executor) -> Result<(), PluginError> {
    if executor.description() != "local" {
        return Err(PluginError::Sign(
            "This plugin only supports local executor.".to_string(),
        ));
    }
    Ok(())
}

/// Exports the public half of `sign_key` into a scratch GPG home used only
/// for verification.
pub(crate) fn export_keyring(
    executor: &mut dyn Executor,
    config: &Config,
    sign_key: &str,
    keyring_dir: &Path,
    log: &mut StepLog,
) -> Result<(), PluginError> {
    std::fs::create_dir_all(keyring_dir).map_err(|e| PluginError::Sign(e.to_string()))?;
    let temp_dir = SafeTempDir::new().map_err(|e| PluginError::Sign(e.to_string()))?;
    let sign_key_asc = temp_dir.path().join(format!("{sign_key}.asc"));
    let spec = RunSpec {
        cmd: vec![
            format!(
                "{} --armor --export {sign_key} > {}",
                config.gpg_client(),
                sign_key_asc.display()
            ),
            format!(
                "gpg2 --homedir {} --import {}",
                keyring_dir.display(),
                sign_key_asc.display()
            ),
        ],
        ..Default::default()
    };
    executor
        .run(&spec, &mut |line| log.line(line))
        .map_err(|e| PluginError::Sign(e.to_string()))
}
