use std::path::Path;
use std::process::Command;

use anyhow::{bail, Result};
use tracing::debug;

/// Replaces zero-filled ranges of `path` with holes.
///
/// Template and installer images are mostly zeroes after creation; punching
/// holes keeps the artifacts tree at its logical rather than allocated size.
pub fn dig_holes(path: &Path) -> Result<()> {
    debug!("detecting zeroes and replacing with holes in {}", path.display());
    let status = Command::new("/usr/bin/fallocate")
        .arg("--dig-holes")
        .arg("--")
        .arg(path)
        .status()?;
    if !status.success() {
        bail!("fallocate --dig-holes failed on {} ({})", path.display(), status);
    }
    Ok(())
}
