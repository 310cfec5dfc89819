// SPDX-License-Identifier: Apache-2.0

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use extempore_core::SiteError;

/// A directory all site file operations are rooted at. Joins refuse path
/// separators and dot-dot names, so a journal line or slug can never address
/// anything outside the site.
#[derive(Debug, Clone)]
pub struct SiteDir {
    path: PathBuf,
}

impl SiteDir {
    /// Open an existing directory as a site root.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SiteError> {
        let path = path.into();
        if !path.is_dir() {
            return Err(SiteError::io(format!(
                "not a directory: {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    /// Create the directory (and parents) if needed, then open it.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, SiteError> {
        let path = path.into();
        fs::create_dir_all(&path)
            .map_err(|err| SiteError::io(format!("failed to create {}: {err}", path.display())))?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> Result<PathBuf, SiteError> {
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains('/')
            || name.contains('\\')
        {
            return Err(SiteError::io(format!("unsafe file name: {name}")));
        }
        Ok(self.path.join(name))
    }
}

/// Write `contents` to `{name}` via `{name}.tmp` and a same-directory
/// rename, so readers only ever observe the complete bytes. Concurrent
/// writers for the same name are the caller's problem; the per-resource lock
/// provides that.
pub fn write_file_atomic(dir: &SiteDir, name: &str, contents: &[u8]) -> Result<(), SiteError> {
    let tmp_name = format!("{name}.tmp");
    let tmp = dir.join(&tmp_name)?;
    let target = dir.join(name)?;

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp)
        .map_err(|err| SiteError::io(format!("failed to open {tmp_name} for write: {err}")))?;
    file.write_all(contents)
        .map_err(|err| SiteError::io(format!("failed to write to {tmp_name}: {err}")))?;
    file.sync_all()
        .map_err(|err| SiteError::io(format!("failed to sync {tmp_name}: {err}")))?;
    drop(file);

    fs::rename(&tmp, &target)
        .map_err(|err| SiteError::io(format!("failed to rename {tmp_name} to {name}: {err}")))?;
    Ok(())
}

/// Append to a file, creating it on first use. Used for the links journal;
/// each append is one short write and the reader tolerates duplicates and
/// blank lines.
pub fn append_contents(dir: &SiteDir, name: &str, contents: &[u8]) -> Result<(), SiteError> {
    let path = dir.join(name)?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| SiteError::io(format!("failed to open {name}: {err}")))?;
    file.write_all(contents)
        .map_err(|err| SiteError::io(format!("failed to write to {name}: {err}")))?;
    Ok(())
}
