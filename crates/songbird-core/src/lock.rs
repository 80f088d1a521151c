//! Opt-in advisory lock serialising load → mutate → save cycles.
//!
//! Without it two overlapping invocations race and the later save wins.
//! Advisory locks are cooperative: only writers that also take the lock are
//! kept out.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::store::CheckpointError;

#[derive(Debug)]
pub struct CheckpointLock {
    file: File,
    path: PathBuf,
}

pub fn lock_path(checkpoint: &Path) -> PathBuf {
    let mut name = checkpoint
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    checkpoint.with_file_name(name)
}

impl CheckpointLock {
    /// Blocks until the exclusive lock beside `checkpoint` is held.
    pub fn acquire(checkpoint: &Path) -> Result<Self, CheckpointError> {
        let (file, path) = open_lock_file(checkpoint)?;
        file.lock_exclusive()
            .map_err(|source| CheckpointError::Lock {
                path: path.clone(),
                source,
            })?;
        Ok(Self { file, path })
    }

    /// Returns `Ok(None)` instead of waiting when another process holds the lock.
    pub fn try_acquire(checkpoint: &Path) -> Result<Option<Self>, CheckpointError> {
        let (file, path) = open_lock_file(checkpoint)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file, path })),
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(source) => Err(CheckpointError::Lock { path, source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CheckpointLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(checkpoint: &Path) -> Result<(File, PathBuf), CheckpointError> {
    let path = lock_path(checkpoint);
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .map_err(|source| CheckpointError::Lock {
            path: path.clone(),
            source,
        })?;
    Ok((file, path))
}
