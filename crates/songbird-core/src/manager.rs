//! In-memory task registry backed by one checkpoint file.
//!
//! Every mutation is persisted before it returns. When the save fails the
//! mutation is rolled back, so the registry keeps matching the file on disk.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::identity::task_id;
use crate::legacy::write_legacy;
use crate::store::{
    preserve_corrupt, read_checkpoint, write_checkpoint, Checkpoint, CheckpointError,
    SessionMetadata, DEFAULT_SESSION_TYPE,
};
use crate::summary::{summarize, SessionSummary};
use crate::task::{now_rfc3339, TaskRecord, TaskStatus};

/// What registering an already-known composite key does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterPolicy {
    /// Replace the record and reset it to PENDING, dropping its history.
    #[default]
    Replace,
    /// Return the existing id and leave the record untouched.
    KeepExisting,
}

/// How a checkpoint that exists but does not parse is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Warn and start empty. The unreadable file is copied to
    /// `<checkpoint>.corrupt` before it is first overwritten.
    #[default]
    Lenient,
    /// Fail with [`CheckpointError::Corrupt`].
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerOptions {
    pub register_policy: RegisterPolicy,
    pub load_mode: LoadMode,
    /// Session type recorded when no checkpoint exists yet.
    pub session_type: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            register_policy: RegisterPolicy::default(),
            load_mode: LoadMode::default(),
            session_type: DEFAULT_SESSION_TYPE.to_string(),
        }
    }
}

#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    options: ManagerOptions,
    metadata: SessionMetadata,
    tasks: IndexMap<String, TaskRecord>,
    corrupt_on_disk: bool,
}

impl CheckpointManager {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        Self::open_with(path, ManagerOptions::default())
    }

    /// Loads the checkpoint at `path`, or starts an empty registry when there is none.
    pub fn open_with(
        path: impl Into<PathBuf>,
        options: ManagerOptions,
    ) -> Result<Self, CheckpointError> {
        let path = path.into();
        let mut manager = Self {
            metadata: SessionMetadata::new(&options.session_type),
            path,
            options,
            tasks: IndexMap::new(),
            corrupt_on_disk: false,
        };

        match read_checkpoint(&manager.path) {
            Ok(Some(checkpoint)) => manager.absorb(checkpoint),
            Ok(None) => {}
            Err(err @ CheckpointError::Corrupt { .. }) => match manager.options.load_mode {
                LoadMode::Strict => return Err(err),
                LoadMode::Lenient => {
                    warn!(
                        path = %manager.path.display(),
                        error = %err,
                        "could not load checkpoint; starting with an empty registry"
                    );
                    manager.corrupt_on_disk = true;
                }
            },
            Err(err) => return Err(err),
        }
        Ok(manager)
    }

    fn absorb(&mut self, checkpoint: Checkpoint) {
        self.metadata = checkpoint.metadata;
        for task in checkpoint.tasks {
            self.tasks.insert(task.task_id(), task);
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn metadata(&self) -> &SessionMetadata {
        &self.metadata
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Records in registration order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskRecord> {
        self.tasks.values()
    }

    /// Persists the whole registry and stamps `last_updated`.
    pub fn save(&mut self) -> Result<(), CheckpointError> {
        if self.corrupt_on_disk && self.path.exists() {
            match preserve_corrupt(&self.path) {
                Ok(backup) => warn!(
                    backup = %backup.display(),
                    "kept a copy of the unreadable checkpoint"
                ),
                Err(err) => {
                    error!(
                        path = %self.path.display(),
                        error = %err,
                        "could not back up unreadable checkpoint"
                    );
                    return Err(err.into());
                }
            }
        }

        let previous = self.metadata.last_updated.replace(now_rfc3339());
        let checkpoint = Checkpoint {
            metadata: self.metadata.clone(),
            tasks: self.tasks.values().cloned().collect(),
        };
        if let Err(err) = write_checkpoint(&self.path, &checkpoint) {
            error!(path = %self.path.display(), error = %err, "error saving checkpoint");
            self.metadata.last_updated = previous;
            return Err(err);
        }
        self.corrupt_on_disk = false;
        Ok(())
    }

    pub fn register_task(
        &mut self,
        subject: &str,
        variant: &str,
        source_filename: &str,
        output_path: &str,
    ) -> Result<String, CheckpointError> {
        let policy = self.options.register_policy;
        self.register_task_with(policy, subject, variant, source_filename, output_path)
    }

    pub fn register_task_with(
        &mut self,
        policy: RegisterPolicy,
        subject: &str,
        variant: &str,
        source_filename: &str,
        output_path: &str,
    ) -> Result<String, CheckpointError> {
        let record = TaskRecord::new(subject, variant, source_filename, output_path);
        let id = record.task_id();

        if policy == RegisterPolicy::KeepExisting {
            if let Some(existing) = self.tasks.get(&id) {
                debug!(task_id = %id, status = %existing.status, "task already registered");
                return Ok(id);
            }
        }

        let previous = self.tasks.insert(id.clone(), record);
        if let Err(err) = self.save() {
            match previous {
                Some(previous) => {
                    self.tasks.insert(id, previous);
                }
                None => {
                    self.tasks.shift_remove(&id);
                }
            }
            return Err(err);
        }
        debug!(task_id = %id, replaced = previous.is_some(), "registered task");
        Ok(id)
    }

    /// Moves a task to `status`. Returns `Ok(false)` for an unknown id without
    /// touching the checkpoint.
    ///
    /// Transitions are not checked against the expected protocol; any status
    /// may follow any other.
    pub fn update_status(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        error_message: Option<&str>,
        validation_result: Option<Value>,
    ) -> Result<bool, CheckpointError> {
        let Some(task) = self.tasks.get_mut(task_id) else {
            debug!(task_id, "status update for unknown task");
            return Ok(false);
        };
        let previous = task.clone();
        task.transition(status, error_message, validation_result);

        if let Err(err) = self.save() {
            self.tasks.insert(task_id.to_string(), previous);
            return Err(err);
        }
        debug!(task_id, status = %status, "updated task status");
        Ok(true)
    }

    /// True only when the task exists and is COMPLETED.
    pub fn is_completed(&self, subject: &str, variant: &str, source_filename: &str) -> bool {
        self.get_task(subject, variant, source_filename)
            .map(|task| task.status.is_done())
            .unwrap_or(false)
    }

    pub fn get_task(
        &self,
        subject: &str,
        variant: &str,
        source_filename: &str,
    ) -> Option<&TaskRecord> {
        self.tasks.get(&task_id(subject, variant, source_filename))
    }

    pub fn get_task_by_id(&self, task_id: &str) -> Option<&TaskRecord> {
        self.tasks.get(task_id)
    }

    pub fn summary(&self) -> SessionSummary {
        summarize(self.tasks.values(), &self.metadata)
    }

    pub fn failed_tasks(&self) -> Vec<&TaskRecord> {
        self.tasks
            .values()
            .filter(|task| task.status == TaskStatus::Failed)
            .collect()
    }

    /// Returns every FAILED task to PENDING and clears its error message.
    /// Saves once, and only when something changed.
    pub fn reset_failed_tasks(&mut self) -> Result<usize, CheckpointError> {
        let mut previous = Vec::new();
        for (id, task) in self.tasks.iter_mut() {
            if task.status == TaskStatus::Failed {
                previous.push((id.clone(), task.clone()));
                task.status = TaskStatus::Pending;
                task.error_message = None;
                task.timestamp = now_rfc3339();
            }
        }
        if previous.is_empty() {
            return Ok(0);
        }

        if let Err(err) = self.save() {
            for (id, task) in previous {
                self.tasks.insert(id, task);
            }
            return Err(err);
        }
        debug!(count = previous.len(), "reset failed tasks");
        Ok(previous.len())
    }

    /// Writes the legacy line format to `path`, replacing whatever is there.
    /// The checkpoint itself is never touched.
    pub fn export_legacy(&self, path: &Path) -> Result<(), CheckpointError> {
        write_legacy(path, self.tasks.values()).map_err(|err| {
            error!(path = %path.display(), error = %err, "error exporting legacy format");
            err
        })
    }
}
