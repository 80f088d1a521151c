use std::fmt;

use chrono::Local;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::identity::task_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
    Skipped,
    InProgress,
}

impl TaskStatus {
    /// Every status, in the order summaries report them.
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Skipped,
        TaskStatus::InProgress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Completed => "COMPLETED",
            TaskStatus::Failed => "FAILED",
            TaskStatus::Skipped => "SKIPPED",
            TaskStatus::InProgress => "IN_PROGRESS",
        }
    }

    /// Only COMPLETED counts as done for the idempotency check; SKIPPED work is retried.
    pub fn is_done(&self) -> bool {
        matches!(self, TaskStatus::Completed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of trackable work.
///
/// Field names on the wire follow the recording workflow that produced the
/// format (`speaker`, `mode_name`); absent optionals are written as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(rename = "speaker")]
    pub subject: String,
    #[serde(rename = "mode_name")]
    pub variant: String,
    pub source_filename: String,
    pub output_path: String,
    pub status: TaskStatus,
    #[serde(default = "now_rfc3339", deserialize_with = "timestamp_or_now")]
    pub timestamp: String,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub validation_result: Option<Value>,
}

impl TaskRecord {
    pub fn new(subject: &str, variant: &str, source_filename: &str, output_path: &str) -> Self {
        Self {
            subject: subject.to_string(),
            variant: variant.to_string(),
            source_filename: source_filename.to_string(),
            output_path: output_path.to_string(),
            status: TaskStatus::Pending,
            timestamp: now_rfc3339(),
            error_message: None,
            validation_result: None,
        }
    }

    pub fn task_id(&self) -> String {
        task_id(&self.subject, &self.variant, &self.source_filename)
    }

    /// Moves the record to `status` and stamps the transition time.
    ///
    /// Payloads are additive: `None`, an empty message or an empty validation
    /// payload (`null`, `{}`, `[]`) leaves whatever an earlier transition
    /// attached in place.
    pub fn transition(
        &mut self,
        status: TaskStatus,
        error_message: Option<&str>,
        validation_result: Option<Value>,
    ) {
        self.status = status;
        self.timestamp = now_rfc3339();
        if let Some(message) = error_message.filter(|message| !message.is_empty()) {
            self.error_message = Some(message.to_string());
        }
        if let Some(result) = validation_result.filter(|value| !is_empty_payload(value)) {
            self.validation_result = Some(result);
        }
    }
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

pub fn now_rfc3339() -> String {
    Local::now().to_rfc3339()
}

pub(crate) fn timestamp_or_now<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(now_rfc3339))
}
