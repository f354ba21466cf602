use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::ExecutionError;
use crate::state::{Checkpoint, WorkflowStatus};
use crate::task::Task;

/// Read-only task access for the core. Host applications back this
/// with whatever storage they use; the core never writes tasks beyond
/// terminal-status updates.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn get_task(&self, id: i64) -> anyhow::Result<Task>;
    async fn get_tasks_for_project(&self, project_id: i64) -> anyhow::Result<Vec<Task>>;
    async fn update_task_status(&self, id: i64, status: WorkflowTaskStatus) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowTaskStatus {
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProjectInfo {
    pub title: String,
    #[serde(default)]
    pub goal: Option<String>,
    #[serde(default)]
    pub constraints: Option<String>,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    #[serde(default)]
    pub base_dev_folder: Option<String>,
    #[serde(default)]
    pub mcp_config: serde_json::Map<String, serde_json::Value>,
}

/// Read-only project metadata (goal, constraints, phase, memory) the core
/// folds into prompt assembly.
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn get_project(&self, project_id: i64) -> anyhow::Result<ProjectInfo>;
}

#[derive(Debug, Clone, Default)]
pub struct ScriptOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Runs a script task's source in a host-chosen sandbox. `signal` is a
/// cooperative cancellation token; implementations should terminate the
/// child process promptly on cancellation.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    async fn run_script(
        &self,
        language: crate::task::ScriptLanguage,
        source: &str,
        env: &HashMap<String, String>,
        signal: tokio_util::sync::CancellationToken,
    ) -> Result<ScriptOutput, ExecutionError>;
}

#[derive(Debug, Clone, Default)]
pub struct InputResponse {
    pub text: Option<String>,
    pub attachments: Vec<crate::result::Attachment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Required,
    Optional,
}

/// Requests input from a user, a local file, or a remote resource on
/// behalf of an `input` task.
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn request_user_input(
        &self,
        prompt: &str,
        mode: InputMode,
    ) -> Result<InputResponse, ExecutionError>;
    async fn read_local_file(
        &self,
        path: &str,
        accepted_extensions: &[String],
    ) -> Result<InputResponse, ExecutionError>;
    async fn fetch_remote_resource(&self, url: &str) -> Result<InputResponse, ExecutionError>;
}

/// Delivers an `output` task's content to a file, notification channel,
/// or HTTP endpoint.
#[async_trait]
pub trait OutputProvider: Send + Sync {
    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecutionError>;
    async fn send_notification(&self, channel: &str, body: &str) -> Result<(), ExecutionError>;
    async fn post_http(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &str,
    ) -> Result<(), ExecutionError>;
}

/// Durable checkpoint storage. "Latest wins" per workflow.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: Checkpoint) -> anyhow::Result<()>;
    async fn latest(&self, workflow_id: &str) -> anyhow::Result<Option<Checkpoint>>;
    async fn list(&self, workflow_id: &str) -> anyhow::Result<Vec<Checkpoint>>;
}

/// In-memory reference implementation used by this workspace's own tests
/// and as a starting point for host integrations that don't yet have a
/// durable checkpoint store wired up.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    by_workflow: Arc<RwLock<HashMap<String, Vec<Checkpoint>>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> anyhow::Result<()> {
        let mut guard = self.by_workflow.write().await;
        guard
            .entry(checkpoint.workflow_id.clone())
            .or_default()
            .push(checkpoint);
        Ok(())
    }

    async fn latest(&self, workflow_id: &str) -> anyhow::Result<Option<Checkpoint>> {
        let guard = self.by_workflow.read().await;
        Ok(guard
            .get(workflow_id)
            .and_then(|list| list.last())
            .cloned())
    }

    async fn list(&self, workflow_id: &str) -> anyhow::Result<Vec<Checkpoint>> {
        let guard = self.by_workflow.read().await;
        Ok(guard.get(workflow_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct InMemoryTaskRepository {
    tasks: Arc<RwLock<HashMap<i64, Task>>>,
}

impl InMemoryTaskRepository {
    pub fn new(tasks: Vec<Task>) -> Self {
        let map = tasks.into_iter().map(|t| (t.id, t)).collect();
        Self {
            tasks: Arc::new(RwLock::new(map)),
        }
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskRepository {
    async fn get_task(&self, id: i64) -> anyhow::Result<Task> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such task: {id}"))
    }

    async fn get_tasks_for_project(&self, project_id: i64) -> anyhow::Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn update_task_status(&self, id: i64, status: WorkflowTaskStatus) -> anyhow::Result<()> {
        let mut guard = self.tasks.write().await;
        if let Some(task) = guard.get_mut(&id) {
            task.status = match status {
                WorkflowTaskStatus::Done => crate::task::TaskStatus::Done,
                WorkflowTaskStatus::Failed => crate::task::TaskStatus::Failed,
                WorkflowTaskStatus::Skipped => crate::task::TaskStatus::Skipped,
            };
        }
        Ok(())
    }
}

/// Progress/log event sink, exposed rather than consumed: the Runner
/// publishes onto this, host applications subscribe.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn on_progress(&self, progress: crate::state::Progress);
    async fn on_log(&self, level: tracing::Level, message: &str, details: Option<serde_json::Value>);
}

#[allow(unused)]
fn _status_unused(_: WorkflowStatus) {}
