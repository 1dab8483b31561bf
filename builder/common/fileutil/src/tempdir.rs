use std::{
    ffi::{OsStr, OsString},
    path::{Path, PathBuf},
};

use anyhow::Result;
use lazy_static::lazy_static;
use tracing::info_span;

use crate::remove_dir_all_with_chmod;

lazy_static! {
    static ref DEFAULT_PREFIX: OsString = {
        let current_exe = std::env::current_exe().unwrap_or_default();
        let current_program_name = current_exe
            .file_name()
            .unwrap_or(OsStr::new("__unknown__"))
            .to_string_lossy();
        format!("builder.{}.", current_program_name).into()
    };
}

/// Safer version of [`tempfile::TempDir`].
///
/// Directory names are prefixed with the current program name so that stray
/// temporary directories are attributable, and removal falls back to
/// [`remove_dir_all_with_chmod`] for entries a chroot left read-only.
pub struct SafeTempDir {
    dir: Option<PathBuf>,
}

impl SafeTempDir {
    pub fn new() -> Result<Self> {
        Self::new_in(&std::env::temp_dir())
    }

    /// Creates a new temporary directory under `base_dir`.
    pub fn new_in(base_dir: &Path) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix(&*DEFAULT_PREFIX)
            .tempdir_in(base_dir)?;
        Ok(Self::take(&dir.into_path()))
    }

    /// Creates a [`SafeTempDir`] by taking the ownership of an existing
    /// directory.
    pub fn take(dir: &Path) -> Self {
        Self {
            dir: Some(dir.to_path_buf()),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.as_ref().unwrap()
    }

    /// Converts [`SafeTempDir`] into [`PathBuf`]. After calling this function,
    /// it is the caller's responsibility to remove the directory after use.
    pub fn into_path(mut self) -> PathBuf {
        self.dir.take().unwrap()
    }
}

impl Drop for SafeTempDir {
    fn drop(&mut self) {
        if let Some(dir) = &self.dir {
            let _span = info_span!("SafeTempDir::drop", dir = ?dir).entered();
            remove_dir_all_with_chmod(dir).expect("Failed to remove temporary directory");
        }
    }
}
