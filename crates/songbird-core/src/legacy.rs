//! Flat `|`-delimited export for shell tooling that cannot read the JSON checkpoint.

use std::path::Path;

use crate::store::{atomic_write, CheckpointError};
use crate::task::{now_rfc3339, TaskRecord};

pub const LEGACY_COLUMNS: &str = "speaker|mode_name|source_filename|output_path|status|timestamp";

pub fn legacy_line(task: &TaskRecord) -> String {
    format!(
        "{}|{}|{}|{}|{}|{}",
        task.subject,
        task.variant,
        task.source_filename,
        task.output_path,
        task.status,
        task.timestamp
    )
}

pub fn render_legacy<'a, I>(tasks: I, generated_at: &str) -> String
where
    I: IntoIterator<Item = &'a TaskRecord>,
{
    let mut lines = vec![
        "# Recording Progress Checkpoint File".to_string(),
        format!("# Generated on {}", generated_at),
        format!("# Format: {}", LEGACY_COLUMNS),
    ];
    lines.extend(tasks.into_iter().map(legacy_line));
    let mut body = lines.join("\n");
    body.push('\n');
    body
}

pub fn write_legacy<'a, I>(path: &Path, tasks: I) -> Result<(), CheckpointError>
where
    I: IntoIterator<Item = &'a TaskRecord>,
{
    let body = render_legacy(tasks, &now_rfc3339());
    atomic_write(path, body.as_bytes())?;
    Ok(())
}
