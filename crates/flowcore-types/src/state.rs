use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Partial
                | WorkflowStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_id: String,
    pub completed_task_ids: Vec<i64>,
    pub context: ExecutionContext,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub stage_index: usize,
    pub stage_total: usize,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_total: usize,
    pub percent: f32,
    /// Linear extrapolation from elapsed time; `None` before the first
    /// stage completes.
    pub eta_ms: Option<i64>,
}

/// The Runner's live record of one workflow run. Owned exclusively by the
/// Runner; created on `run`/`resume`, destroyed at terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub current_stage: usize,
    pub completed_tasks: Vec<i64>,
    pub failed_tasks: Vec<i64>,
    pub context: ExecutionContext,
    pub checkpoints: Vec<Checkpoint>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub paused_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub completed_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    pub duration_ms: i64,
}
