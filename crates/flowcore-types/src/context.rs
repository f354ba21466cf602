use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::TaskResult;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    pub max_cost: f64,
    pub max_tokens: u64,
    #[serde(default)]
    pub current_cost: f64,
    #[serde(default)]
    pub current_tokens: u64,
}

impl Budget {
    pub fn has_room(&self) -> bool {
        self.current_cost < self.max_cost && self.current_tokens < self.max_tokens
    }
}

/// Per-workflow state carried into every task. Mutation is confined to the
/// Runner between stages; a stage's own tasks see a
/// read-only `Arc<ExecutionContext>`, so no locking is needed inside a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub workflow_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub project_id: i64,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Append-only; the Runner appends after each stage completes, in
    /// ascending `projectSequence` order within the stage.
    #[serde(default)]
    pub previous_results: Vec<TaskResult>,
    #[serde(default)]
    pub budget: Option<Budget>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, project_id: i64) -> Self {
        ExecutionContext {
            workflow_id: workflow_id.into(),
            user_id: None,
            project_id,
            variables: HashMap::new(),
            previous_results: Vec::new(),
            budget: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn result_for_sequence(&self, project_sequence: i64) -> Option<&TaskResult> {
        self.previous_results
            .iter()
            .find(|r| r.project_sequence == project_sequence)
    }

    /// Applies a successful `TaskResult` to this context's budget totals.
    /// Monotonic by construction: callers never subtract.
    pub fn record_budget_usage(&mut self, cost: f64, tokens: u64) {
        if let Some(budget) = &mut self.budget {
            budget.current_cost += cost;
            budget.current_tokens += tokens;
        }
    }
}
