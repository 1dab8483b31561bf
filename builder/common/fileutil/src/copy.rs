use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::remove_path;

/// Copies a file or a directory tree into `dest_dir`, replacing any
/// pre-existing entry of the same name.
///
/// Mirrors the copy-in/copy-out contract of executors: the source keeps its
/// base name, directories are copied recursively, permissions are preserved.
pub fn copy_into(source: &Path, dest_dir: &Path) -> Result<()> {
    let file_name = source
        .file_name()
        .with_context(|| format!("Source {} has no file name", source.display()))?;
    let dest = dest_dir.join(file_name);

    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("Creating {}", dest_dir.display()))?;

    let metadata = source
        .symlink_metadata()
        .with_context(|| format!("Cannot stat {}", source.display()))?;

    if metadata.is_dir() {
        remove_path(&dest)?;
        copy_dir_recursive(source, &dest)?;
    } else if metadata.is_file() {
        // Replace instead of overwriting in place so hardlinked copies in
        // repository trees are not clobbered through the link.
        remove_path(&dest)?;
        std::fs::copy(source, &dest)
            .with_context(|| format!("Copying {} to {}", source.display(), dest.display()))?;
    } else {
        bail!("Refusing to copy special file {}", source.display());
    }
    Ok(())
}

fn copy_dir_recursive(source: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    let permissions = std::fs::metadata(source)?.permissions();
    std::fs::set_permissions(dest, permissions)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn copies_file_and_replaces_existing() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        std::fs::write(src.path().join("a.txt"), b"new")?;
        std::fs::write(dst.path().join("a.txt"), b"old")?;

        copy_into(&src.path().join("a.txt"), dst.path())?;
        assert_eq!(std::fs::read(dst.path().join("a.txt"))?, b"new");
        Ok(())
    }

    #[test]
    fn copies_directory_tree() -> Result<()> {
        let src = tempfile::tempdir()?;
        let dst = tempfile::tempdir()?;
        std::fs::create_dir_all(src.path().join("tree/sub"))?;
        std::fs::write(src.path().join("tree/sub/f"), b"content")?;

        copy_into(&src.path().join("tree"), dst.path())?;
        assert_eq!(std::fs::read(dst.path().join("tree/sub/f"))?, b"content");
        Ok(())
    }
}
