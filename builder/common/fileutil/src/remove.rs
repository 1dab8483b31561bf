use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};

/// Removes a directory tree, making entries writable first when a plain
/// [`std::fs::remove_dir_all`] fails.
///
/// Build chroots routinely leave read-only directories behind; plain removal
/// fails on those with EACCES.
pub fn remove_dir_all_with_chmod(dir: &Path) -> Result<()> {
    if dir.symlink_metadata().is_err() {
        return Ok(());
    }
    if std::fs::remove_dir_all(dir).is_ok() {
        return Ok(());
    }

    for entry in walkdir::WalkDir::new(dir).into_iter().flatten() {
        if entry.file_type().is_dir() {
            let _ = std::fs::set_permissions(entry.path(), Permissions::from_mode(0o755));
        }
    }
    std::fs::remove_dir_all(dir).with_context(|| format!("Removing {}", dir.display()))
}

/// Removes a file or a directory tree if it exists.
pub fn remove_path(path: &Path) -> Result<()> {
    match path.symlink_metadata() {
        Ok(metadata) if metadata.is_dir() => remove_dir_all_with_chmod(path),
        Ok(_) => std::fs::remove_file(path).with_context(|| format!("Removing {}", path.display())),
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removes_read_only_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked)?;
        std::fs::write(locked.join("file"), b"x")?;
        std::fs::set_permissions(&locked, Permissions::from_mode(0o555))?;

        remove_dir_all_with_chmod(&dir.path().join("locked"))?;
        assert!(!locked.exists());
        Ok(())
    }

    #[test]
    fn missing_path_is_not_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        remove_path(&dir.path().join("no-such-entry"))?;
        Ok(())
    }
}
