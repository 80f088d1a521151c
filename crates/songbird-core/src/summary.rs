use indexmap::IndexMap;
use serde::Serialize;

use crate::store::SessionMetadata;
use crate::task::{TaskRecord, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub total_tasks: usize,
    pub status_counts: IndexMap<TaskStatus, usize>,
    /// Percentage of tasks in COMPLETED, 0 for an empty registry.
    pub completion_rate: f64,
    pub session_created: String,
    pub last_updated: Option<String>,
}

impl SessionSummary {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.status_counts.get(&status).copied().unwrap_or(0)
    }

    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!("Tasks: {}", self.total_tasks));
        for (status, count) in &self.status_counts {
            lines.push(format!("- {}: {}", status, count));
        }
        lines.push(format!("Completion: {:.1}%", self.completion_rate));
        lines.push(format!("Session created: {}", self.session_created));
        lines.push(format!(
            "Last updated: {}",
            self.last_updated.as_deref().unwrap_or("never")
        ));
        lines.join("\n")
    }
}

pub fn summarize<'a, I>(tasks: I, metadata: &SessionMetadata) -> SessionSummary
where
    I: IntoIterator<Item = &'a TaskRecord>,
{
    let mut status_counts: IndexMap<TaskStatus, usize> =
        TaskStatus::ALL.iter().map(|status| (*status, 0)).collect();
    let mut total_tasks = 0;
    for task in tasks {
        total_tasks += 1;
        *status_counts.entry(task.status).or_insert(0) += 1;
    }
    let completed = status_counts
        .get(&TaskStatus::Completed)
        .copied()
        .unwrap_or(0);
    let completion_rate = if total_tasks > 0 {
        completed as f64 / total_tasks as f64 * 100.0
    } else {
        0.0
    };
    SessionSummary {
        total_tasks,
        status_counts,
        completion_rate,
        session_created: metadata.created.clone(),
        last_updated: metadata.last_updated.clone(),
    }
}
