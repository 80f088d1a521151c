//! Durable load/save of a checkpoint file.
//!
//! Saves never write the target in place: the serialized checkpoint is staged
//! in `<name>.tmp` beside the target, synced, then renamed over it. A reader
//! therefore sees either the previous checkpoint or the new one in full.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::task::{now_rfc3339, timestamp_or_now, TaskRecord};

pub const FORMAT_VERSION: &str = "2.0";
pub const DEFAULT_SESSION_TYPE: &str = "recording";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Malformed checkpoint {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Failed to lock checkpoint {}: {source}", .path.display())]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    #[serde(default = "now_rfc3339", deserialize_with = "timestamp_or_now")]
    pub created: String,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default = "default_session_type")]
    pub session_type: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// Keys written by other tooling; carried through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SessionMetadata {
    pub fn new(session_type: &str) -> Self {
        Self {
            created: now_rfc3339(),
            last_updated: None,
            session_type: session_type.to_string(),
            version: FORMAT_VERSION.to_string(),
            extra: BTreeMap::new(),
        }
    }
}

impl Default for SessionMetadata {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TYPE)
    }
}

fn default_session_type() -> String {
    DEFAULT_SESSION_TYPE.to_string()
}

fn default_version() -> String {
    FORMAT_VERSION.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default)]
    pub metadata: SessionMetadata,
    #[serde(default)]
    pub tasks: Vec<TaskRecord>,
}

/// Reads the checkpoint at `path`.
///
/// `Ok(None)` means there is no checkpoint yet. Content that does not parse,
/// invalid UTF-8 included, is reported as [`CheckpointError::Corrupt`];
/// deciding whether that is fatal is left to the caller.
pub fn read_checkpoint(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    let checkpoint =
        serde_json::from_slice::<Checkpoint>(&bytes).map_err(|source| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Some(checkpoint))
}

pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let body = serde_json::to_string_pretty(checkpoint)?;
    atomic_write(path, body.as_bytes())?;
    Ok(())
}

pub fn temp_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, ".tmp")
}

pub fn corrupt_backup_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, ".corrupt")
}

/// Replaces `path` with `contents` via a synced temp file and a rename.
pub fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = stage_temp(path, contents)?;
    commit_temp(&tmp, path)
}

/// First half of [`atomic_write`]: writes and syncs the temp file only.
pub fn stage_temp(path: &Path, contents: &[u8]) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let tmp = temp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    Ok(tmp)
}

/// Second half of [`atomic_write`]: renames the staged file over the target.
pub fn commit_temp(tmp: &Path, path: &Path) -> std::io::Result<()> {
    if let Err(err) = fs::rename(tmp, path) {
        let _ = fs::remove_file(tmp);
        return Err(err);
    }
    Ok(())
}

/// Copies an unparseable checkpoint aside so a later save cannot erase it.
pub fn preserve_corrupt(path: &Path) -> std::io::Result<PathBuf> {
    let backup = corrupt_backup_path(path);
    fs::copy(path, &backup)?;
    Ok(backup)
}

fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}
