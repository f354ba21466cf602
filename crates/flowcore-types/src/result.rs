use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExecutionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentEncoding {
    Base64,
    Url,
    Text,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub mime: String,
    pub encoding: AttachmentEncoding,
    /// Base64 payload, URL, or raw text depending on `encoding`.
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub last_provider: Option<String>,
    /// Partial content collected from streaming before the error, if any.
    #[serde(default)]
    pub partial_content: Option<String>,
}

impl From<&ExecutionError> for ErrorInfo {
    fn from(err: &ExecutionError) -> Self {
        ErrorInfo {
            kind: err.kind_name().to_string(),
            message: err.to_string(),
            last_provider: None,
            partial_content: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: i64,
    pub project_sequence: i64,
    pub status: ResultStatus,
    /// Polymorphic: plain text, a structured JSON value, or an image
    /// reference (URL or absolute path), distinguished by `output`'s shape.
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub tokens: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
    #[serde(default)]
    pub error: Option<ErrorInfo>,
}

impl TaskResult {
    pub fn skipped(task_id: i64, project_sequence: i64, now: DateTime<Utc>) -> Self {
        TaskResult {
            task_id,
            project_sequence,
            status: ResultStatus::Skipped,
            output: Value::Null,
            attachments: Vec::new(),
            start_time: now,
            end_time: now,
            duration_ms: 0,
            cost: 0.0,
            tokens: 0,
            retries: 0,
            metadata: serde_json::Map::new(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    /// Extracts the human-readable body of this result's output, following
    /// a fixed field-probe order. Used by the Macro Engine and
    /// Context Propagation so both agree on what "content" means.
    pub fn content(&self) -> String {
        if let Some(text) = self.output.as_str() {
            return text.to_string();
        }
        if let Value::Object(map) = &self.output {
            for field in ["imageUrl", "content", "text", "result", "message"] {
                if let Some(Value::String(s)) = map.get(field) {
                    return s.clone();
                }
            }
        }
        if self.output.is_null() {
            return String::new();
        }
        serde_json::to_string(&self.output).unwrap_or_default()
    }

    pub fn summary(&self, max_chars: usize) -> String {
        let content = self.content();
        if content.chars().count() <= max_chars {
            content
        } else {
            content.chars().take(max_chars).collect()
        }
    }
}
