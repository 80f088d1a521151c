//! Checkpointed task tracking for resumable batch recording/processing runs.

pub mod config;
pub mod identity;
pub mod legacy;
pub mod lock;
pub mod manager;
pub mod store;
pub mod summary;
pub mod task;

pub use identity::task_id;
pub use manager::{CheckpointManager, LoadMode, ManagerOptions, RegisterPolicy};
pub use store::CheckpointError;
pub use task::{TaskRecord, TaskStatus};

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
