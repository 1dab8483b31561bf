use std::path::Path;

use anyhow::{Context, Result};

/// Hardlinks `source` to `target`, replacing any existing entry.
///
/// Repository trees are built exclusively from hardlinks so that publishing
/// never duplicates package payloads and unpublishing is a plain unlink.
pub fn force_hardlink(source: &Path, target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Creating {}", parent.display()))?;
    }
    if target.symlink_metadata().is_ok() {
        std::fs::remove_file(target)
            .with_context(|| format!("Removing {}", target.display()))?;
    }
    std::fs::hard_link(source, target).with_context(|| {
        format!("Linking {} to {}", source.display(), target.display())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn links_and_replaces() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let source = dir.path().join("pkg.rpm");
        let target = dir.path().join("repo/pkg.rpm");
        std::fs::write(&source, b"payload")?;
        std::fs::create_dir_all(target.parent().unwrap())?;
        std::fs::write(&target, b"stale")?;

        force_hardlink(&source, &target)?;
        assert_eq!(
            std::fs::metadata(&source)?.ino(),
            std::fs::metadata(&target)?.ino()
        );
        Ok(())
    }
}
