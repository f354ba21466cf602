use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    /// Task ids eligible to run once every dependency of every member has
    /// completed.
    pub tasks: Vec<i64>,
    pub can_run_in_parallel: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub stages: Vec<Stage>,
    pub estimated_duration_ms: i64,
}

impl ExecutionPlan {
    pub fn total_tasks(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}
