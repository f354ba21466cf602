//! Workflow Runner: drives an `ExecutionPlan` stage by stage,
//! honoring pause/resume/cancel, maintaining the live `ExecutionState`,
//! checkpointing after every stage, and publishing `Progress` events.
//!
//! The Runner owns the one place in this workspace allowed to mutate
//! `ExecutionContext`: tasks within a stage see a
//! read-only `Arc<ExecutionContext>` snapshot, and the Runner folds each
//! stage's results back in — sequentially, in ascending `projectSequence`
//! order — only once every task in that stage has
//! finished.

mod control;

pub use control::RunnerControl;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowcore_executor::{ExecutorOptions, TaskExecutor};
use flowcore_observability::{emit_event, ObservabilityEvent};
use flowcore_planner::PlannerOptions;
use flowcore_types::{
    Checkpoint, CheckpointStore, ConfigErrorDetail, ExecutionContext, ExecutionError,
    ExecutionPlan, ExecutionState, ProgressSink, Progress, ProjectInfo, ResultStatus, Stage,
    Task, TaskRepository, WorkflowResult, WorkflowStatus, WorkflowTaskStatus,
};
use futures::stream::{self, StreamExt};
use tokio::sync::RwLock;
use tracing::Level;

/// Options for one `run`/`resume` call. The `base_executor_options`'
/// `signal` field is always overwritten per attempt with the Runner's own
/// cancellation token — a caller-supplied signal there would be redundant
/// (and stale across a pause/resume cycle).
#[derive(Clone)]
pub struct RunnerOptions {
    pub parallelism: usize,
    pub checkpoint: bool,
    pub base_executor_options: ExecutorOptions,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        RunnerOptions {
            parallelism: 3,
            checkpoint: true,
            base_executor_options: ExecutorOptions::default(),
        }
    }
}

pub struct WorkflowRunner {
    executor: Arc<TaskExecutor>,
    task_repository: Option<Arc<dyn TaskRepository>>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    progress_sink: Option<Arc<dyn ProgressSink>>,
    control: RunnerControl,
    in_flight: Arc<RwLock<HashSet<i64>>>,
}

impl WorkflowRunner {
    pub fn new(executor: Arc<TaskExecutor>, checkpoint_store: Arc<dyn CheckpointStore>) -> Self {
        WorkflowRunner {
            executor,
            task_repository: None,
            checkpoint_store,
            progress_sink: None,
            control: RunnerControl::new(),
            in_flight: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    pub fn with_task_repository(mut self, repo: Arc<dyn TaskRepository>) -> Self {
        self.task_repository = Some(repo);
        self
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress_sink = Some(sink);
        self
    }

    /// A cloneable handle a host can hang onto to `pause()`/`resume()`/
    /// `cancel_workflow()` this runner from another task while `run()` is
    /// in flight.
    pub fn control(&self) -> RunnerControl {
        self.control.clone()
    }

    /// Cancels the workflow: flips the control flag (aborting the current
    /// and every future attempt's `ExecutorOptions::signal`) and
    /// additionally reaches into the AI Service Manager's own cancellation
    /// registry for every task currently executing, so an in-flight
    /// provider call is aborted even though its `CancellationToken` clone
    /// was handed out before `cancel()` was called.
    pub async fn cancel_workflow(&self) {
        self.control.cancel();
        let in_flight: Vec<i64> = self.in_flight.read().await.iter().copied().collect();
        for task_id in in_flight {
            self.executor.ai().cancel_execution(task_id).await;
        }
    }

    /// Runs a fresh workflow end to end. Never returns `Err`: a
    /// cycle or other planning failure is folded into a `Failed`
    /// `WorkflowResult` with zero completed tasks, matching the Executor's
    /// own "never bubble an error out" discipline at the next layer up.
    pub async fn run(
        &self,
        workflow_id: impl Into<String>,
        tasks: &[Task],
        project: Option<ProjectInfo>,
        mut ctx: ExecutionContext,
        options: RunnerOptions,
    ) -> WorkflowResult {
        let workflow_id = workflow_id.into();
        ctx.workflow_id = workflow_id.clone();

        let plan = match flowcore_planner::plan_with_options(tasks, &PlannerOptions::default()) {
            Ok(plan) => plan,
            Err(err) => {
                emit_event(
                    Level::ERROR,
                    ObservabilityEvent {
                        workflow_id: Some(&workflow_id),
                        error_code: Some(err.kind_name()),
                        detail: Some(&err.to_string()),
                        ..ObservabilityEvent::new("runner.plan.rejected", "flowcore-runtime")
                    },
                );
                return WorkflowResult {
                    workflow_id,
                    status: WorkflowStatus::Failed,
                    completed_count: 0,
                    failed_count: 0,
                    total_count: tasks.len(),
                    duration_ms: 0,
                };
            }
        };

        let state = ExecutionState {
            workflow_id: workflow_id.clone(),
            status: WorkflowStatus::Running,
            current_stage: 0,
            completed_tasks: Vec::new(),
            failed_tasks: Vec::new(),
            context: ctx,
            checkpoints: Vec::new(),
            start_time: Utc::now(),
            end_time: None,
            paused_at: None,
        };

        self.drive(tasks, &plan, state, project, options).await
    }

    /// Resumes a previously checkpointed workflow: restores it and skips
    /// already-completed tasks rather than treating checkpoints as
    /// observability-only. Seeds the Runner's state from the latest
    /// checkpoint's completed task
    /// ids and context, then re-plans only the remaining tasks rather than
    /// replaying the whole DAG.
    pub async fn resume(
        &self,
        workflow_id: &str,
        tasks: &[Task],
        project: Option<ProjectInfo>,
        options: RunnerOptions,
    ) -> Result<WorkflowResult, ExecutionError> {
        let checkpoint = self
            .checkpoint_store
            .latest(workflow_id)
            .await
            .map_err(|err| {
                ExecutionError::Config(ConfigErrorDetail::Other(err.to_string()))
            })?
            .ok_or_else(|| {
                ExecutionError::Config(ConfigErrorDetail::MissingCheckpoint(
                    workflow_id.to_string(),
                ))
            })?;

        let completed: HashSet<i64> = checkpoint.completed_task_ids.iter().copied().collect();
        let remaining: Vec<Task> = tasks
            .iter()
            .filter(|t| !completed.contains(&t.id))
            .cloned()
            .collect();
        let plan = flowcore_planner::plan_with_options(&remaining, &PlannerOptions::default())?;

        let state = ExecutionState {
            workflow_id: workflow_id.to_string(),
            status: WorkflowStatus::Running,
            current_stage: 0,
            completed_tasks: checkpoint.completed_task_ids.clone(),
            failed_tasks: Vec::new(),
            context: checkpoint.context,
            checkpoints: vec![checkpoint],
            start_time: Utc::now(),
            end_time: None,
            paused_at: None,
        };

        Ok(self.drive(&remaining, &plan, state, project, options).await)
    }

    async fn drive(
        &self,
        tasks: &[Task],
        plan: &ExecutionPlan,
        mut state: ExecutionState,
        project: Option<ProjectInfo>,
        options: RunnerOptions,
    ) -> WorkflowResult {
        let by_id: HashMap<i64, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
        let project = project.map(Arc::new);
        let stage_total = plan.stages.len();
        let total_count = plan.total_tasks();

        'stages: for (stage_index, stage) in plan.stages.iter().enumerate() {
            self.control.wait_while_paused().await;
            if self.control.is_cancelled() {
                state.status = WorkflowStatus::Cancelled;
                break 'stages;
            }

            state.current_stage = stage_index;
            let stage_results = self
                .run_stage(stage, &by_id, &state.context, project.as_deref(), &options)
                .await;

            let mut sorted = stage_results;
            sorted.sort_by_key(|r| r.0);

            for (_, task_id, result) in sorted {
                let status = result.status;
                state.context.previous_results.push(result.clone());
                if let Some(cost_tokens) =
                    (status == ResultStatus::Success).then(|| (result.cost, result.tokens))
                {
                    state.context.record_budget_usage(cost_tokens.0, cost_tokens.1);
                }
                match status {
                    ResultStatus::Success | ResultStatus::Skipped => {
                        state.completed_tasks.push(task_id);
                        self.update_task_status(task_id, WorkflowTaskStatus::Done).await;
                    }
                    ResultStatus::Failure => {
                        state.failed_tasks.push(task_id);
                        self.update_task_status(task_id, WorkflowTaskStatus::Failed).await;
                    }
                }
            }

            if options.checkpoint {
                let checkpoint = Checkpoint {
                    workflow_id: state.workflow_id.clone(),
                    completed_task_ids: state.completed_tasks.clone(),
                    context: state.context.clone(),
                    timestamp: Utc::now(),
                };
                if let Err(err) = self.checkpoint_store.save(checkpoint.clone()).await {
                    emit_event(
                        Level::WARN,
                        ObservabilityEvent {
                            workflow_id: Some(&state.workflow_id),
                            stage_index: Some(stage_index),
                            detail: Some(&err.to_string()),
                            ..ObservabilityEvent::new("runner.checkpoint.failed", "flowcore-runtime")
                        },
                    );
                }
                state.checkpoints.push(checkpoint);
            }

            self.publish_progress(&state, stage_index, stage_total, total_count)
                .await;

            emit_event(
                Level::INFO,
                ObservabilityEvent {
                    workflow_id: Some(&state.workflow_id),
                    stage_index: Some(stage_index),
                    status: Some("stage_completed"),
                    ..ObservabilityEvent::new("runner.stage.completed", "flowcore-runtime")
                },
            );

            if self.control.is_cancelled() {
                state.status = WorkflowStatus::Cancelled;
                break 'stages;
            }
        }

        if state.status != WorkflowStatus::Cancelled {
            state.status = if !state.failed_tasks.is_empty() && state.completed_tasks.is_empty() {
                WorkflowStatus::Failed
            } else if !state.failed_tasks.is_empty() {
                WorkflowStatus::Partial
            } else {
                WorkflowStatus::Completed
            };
        }
        state.end_time = Some(Utc::now());

        let duration_ms = state
            .end_time
            .map(|end| (end - state.start_time).num_milliseconds())
            .unwrap_or(0);

        emit_event(
            Level::INFO,
            ObservabilityEvent {
                workflow_id: Some(&state.workflow_id),
                status: Some(workflow_status_name(state.status)),
                ..ObservabilityEvent::new("runner.workflow.terminal", "flowcore-runtime")
            },
        );

        WorkflowResult {
            workflow_id: state.workflow_id,
            status: state.status,
            completed_count: state.completed_tasks.len(),
            failed_count: state.failed_tasks.len(),
            total_count,
            duration_ms,
        }
    }

    /// Executes every task in one stage, bounded by `options.parallelism`
    /// (default 3) when `stage.can_run_in_parallel`, serially otherwise
    /// (a serial/`input`-kind stage runs its members one at a time).
    /// Returns `(project_sequence, task_id, TaskResult)` triples so the
    /// caller can fold them back into `previous_results` in ascending
    /// `projectSequence` order regardless of completion order.
    async fn run_stage(
        &self,
        stage: &Stage,
        by_id: &HashMap<i64, &Task>,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        options: &RunnerOptions,
    ) -> Vec<(i64, i64, flowcore_types::TaskResult)> {
        let ctx_snapshot = Arc::new(ctx.clone());
        let project_snapshot = project.cloned().map(Arc::new);
        let concurrency = if stage.can_run_in_parallel {
            options.parallelism.max(1)
        } else {
            1
        };

        let futures_iter = stage.tasks.iter().filter_map(|task_id| {
            let task = *by_id.get(task_id)?;
            let executor = self.executor.clone();
            let ctx_snapshot = ctx_snapshot.clone();
            let project_snapshot = project_snapshot.clone();
            let in_flight = self.in_flight.clone();
            let mut executor_options = options.base_executor_options.clone();
            executor_options.signal = self.control.cancellation_token();
            let task_id = *task_id;
            Some(async move {
                in_flight.write().await.insert(task_id);
                let result = executor
                    .execute_task(
                        task,
                        ctx_snapshot.as_ref(),
                        project_snapshot.as_deref(),
                        &executor_options,
                    )
                    .await;
                in_flight.write().await.remove(&task_id);
                (task.project_sequence, task_id, result)
            })
        });

        stream::iter(futures_iter)
            .buffer_unordered(concurrency)
            .collect()
            .await
    }

    async fn update_task_status(&self, task_id: i64, status: WorkflowTaskStatus) {
        if let Some(repo) = &self.task_repository {
            if let Err(err) = repo.update_task_status(task_id, status).await {
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        task_id: Some(task_id),
                        detail: Some(&err.to_string()),
                        ..ObservabilityEvent::new("runner.task_status.update_failed", "flowcore-runtime")
                    },
                );
            }
        }
    }

    async fn publish_progress(
        &self,
        state: &ExecutionState,
        stage_index: usize,
        stage_total: usize,
        total_count: usize,
    ) {
        let Some(sink) = &self.progress_sink else {
            return;
        };
        let tasks_completed = state.completed_tasks.len();
        let tasks_failed = state.failed_tasks.len();
        let percent = if total_count == 0 {
            100.0
        } else {
            (tasks_completed + tasks_failed) as f32 / total_count as f32 * 100.0
        };
        let stages_done = stage_index + 1;
        let elapsed_ms = (Utc::now() - state.start_time).num_milliseconds();
        let eta_ms = if stages_done == 0 || stages_done >= stage_total {
            None
        } else {
            let remaining_stages = (stage_total - stages_done) as i64;
            Some(elapsed_ms / stages_done as i64 * remaining_stages)
        };
        sink.on_progress(Progress {
            stage_index,
            stage_total,
            tasks_completed,
            tasks_failed,
            tasks_total: total_count,
            percent,
            eta_ms,
        })
        .await;
    }
}

fn workflow_status_name(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Running => "running",
        WorkflowStatus::Paused => "paused",
        WorkflowStatus::Completed => "completed",
        WorkflowStatus::Failed => "failed",
        WorkflowStatus::Partial => "partial",
        WorkflowStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcore_ai::AiServiceManager;
    use flowcore_executor::ExecutorOptions;
    use flowcore_mcp::{McpFacade, McpTransport};
    use flowcore_providers::{AppConfig, ProviderRegistry};
    use flowcore_types::{
        Budget, InMemoryCheckpointStore, InputMode, InputProvider, InputResponse, OutputFormat,
        OutputProvider, Priority, ScriptExecutor, ScriptLanguage, ScriptOutput, TaskKind,
        TaskStatus, TriggerConfig,
    };
    use std::collections::BTreeSet;
    use tokio_util::sync::CancellationToken;

    struct NullTransport;

    #[async_trait]
    impl McpTransport for NullTransport {
        async fn list_tools(
            &self,
            _server: &flowcore_mcp::McpServerConfig,
        ) -> anyhow::Result<Vec<flowcore_types::ToolDefinition>> {
            Ok(Vec::new())
        }

        async fn call_tool(
            &self,
            _server: &flowcore_mcp::McpServerConfig,
            _tool_name: &str,
            _args: serde_json::Value,
            _env_overrides: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<serde_json::Value, flowcore_mcp::McpCallError> {
            Ok(serde_json::Value::Null)
        }
    }

    struct NoopScript;
    #[async_trait]
    impl ScriptExecutor for NoopScript {
        async fn run_script(
            &self,
            _language: ScriptLanguage,
            _source: &str,
            _env: &std::collections::HashMap<String, String>,
            _signal: CancellationToken,
        ) -> Result<ScriptOutput, ExecutionError> {
            Ok(ScriptOutput::default())
        }
    }

    struct NoopInput;
    #[async_trait]
    impl InputProvider for NoopInput {
        async fn request_user_input(
            &self,
            _prompt: &str,
            _mode: InputMode,
        ) -> Result<InputResponse, ExecutionError> {
            Ok(InputResponse::default())
        }
        async fn read_local_file(
            &self,
            _path: &str,
            _accepted_extensions: &[String],
        ) -> Result<InputResponse, ExecutionError> {
            Ok(InputResponse::default())
        }
        async fn fetch_remote_resource(&self, _url: &str) -> Result<InputResponse, ExecutionError> {
            Ok(InputResponse::default())
        }
    }

    struct NoopOutput;
    #[async_trait]
    impl OutputProvider for NoopOutput {
        async fn write_file(&self, _path: &str, _content: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn send_notification(&self, _channel: &str, _body: &str) -> Result<(), ExecutionError> {
            Ok(())
        }
        async fn post_http(
            &self,
            _url: &str,
            _headers: &std::collections::HashMap<String, String>,
            _body: &str,
        ) -> Result<(), ExecutionError> {
            Ok(())
        }
    }

    fn make_runner() -> WorkflowRunner {
        let providers = ProviderRegistry::new(AppConfig::default());
        let mcp = Arc::new(McpFacade::new(Arc::new(NullTransport)));
        let ai = AiServiceManager::new(providers, mcp);
        let executor = Arc::new(TaskExecutor::new(
            ai,
            Arc::new(NoopScript),
            Arc::new(NoopInput),
            Arc::new(NoopOutput),
        ));
        WorkflowRunner::new(executor, Arc::new(InMemoryCheckpointStore::new()))
    }

    fn ai_task(id: i64, seq: i64, deps: &[i64], prompt: &str) -> Task {
        Task {
            id,
            project_id: 1,
            project_sequence: seq,
            title: format!("task-{seq}"),
            description: None,
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            task_type: TaskKind::Ai,
            dependencies: deps.iter().copied().collect::<BTreeSet<_>>(),
            trigger_config: TriggerConfig::default(),
            ai_provider: None,
            ai_model: None,
            ai_temperature: None,
            ai_max_tokens: None,
            ai_prompt: Some(prompt.to_string()),
            generated_prompt: None,
            expected_output_format: Some(OutputFormat::Text),
            code_language: None,
            required_mcps: Vec::new(),
            mcp_config: Default::default(),
            image_config: None,
            script_language: None,
            is_subdivided: false,
            is_paused: false,
            auto_review: false,
            review_ai_provider: None,
            review_ai_model: None,
        }
    }

    /// S1 — linear AI chain: both tasks succeed, in plan order.
    #[tokio::test]
    async fn linear_chain_completes_both_tasks() {
        let runner = make_runner();
        let tasks = vec![
            ai_task(1, 1, &[], "summarize text X"),
            ai_task(2, 2, &[1], "Key points:\n{{prev}}"),
        ];
        let ctx = ExecutionContext::new("wf-1", 1);
        let result = runner
            .run("wf-1", &tasks, None, ctx, RunnerOptions::default())
            .await;
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.completed_count, 2);
        assert_eq!(result.failed_count, 0);
    }

    /// S2 — diamond dependency: stage 2 runs #2 and #3 in parallel, both
    /// precede #4 in `previous_results`.
    #[tokio::test]
    async fn diamond_dependency_preserves_project_sequence_order() {
        let runner = make_runner();
        let tasks = vec![
            ai_task(1, 1, &[], "root"),
            ai_task(2, 2, &[1], "left"),
            ai_task(3, 3, &[1], "right"),
            ai_task(4, 4, &[2, 3], "join"),
        ];
        let ctx = ExecutionContext::new("wf-2", 1);
        let result = runner
            .run("wf-2", &tasks, None, ctx, RunnerOptions::default())
            .await;
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.completed_count, 4);
    }

    /// S3 — cycle: the Runner is never invoked past planning.
    #[tokio::test]
    async fn cycle_fails_the_workflow_without_running_any_task() {
        let runner = make_runner();
        let tasks = vec![
            ai_task(1, 1, &[3], "a"),
            ai_task(2, 2, &[1], "b"),
            ai_task(3, 3, &[2], "c"),
        ];
        let ctx = ExecutionContext::new("wf-3", 1);
        let result = runner
            .run("wf-3", &tasks, None, ctx, RunnerOptions::default())
            .await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.completed_count, 0);
        assert_eq!(result.total_count, 3);
    }

    /// Budget exhaustion: the pre-attempt check fails every task without
    /// calling a provider, so the workflow ends up `Failed`. Uses an
    /// already-at-cap budget so the strict `current < max` check is
    /// guaranteed to fail rather than leaving it ambiguously close to cap.
    #[tokio::test]
    async fn budget_exhaustion_fails_without_provider_calls() {
        let runner = make_runner();
        let tasks = vec![ai_task(1, 1, &[], "expensive task")];
        let mut ctx = ExecutionContext::new("wf-5", 1);
        ctx.budget = Some(Budget {
            max_cost: 0.01,
            max_tokens: 100_000,
            current_cost: 0.01,
            current_tokens: 0,
        });
        let result = runner
            .run("wf-5", &tasks, None, ctx, RunnerOptions::default())
            .await;
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert_eq!(result.failed_count, 1);
    }

    #[tokio::test]
    async fn pause_blocks_progress_until_resumed() {
        let runner = make_runner();
        let tasks = vec![
            ai_task(1, 1, &[], "first"),
            ai_task(2, 2, &[1], "second"),
        ];
        let ctx = ExecutionContext::new("wf-pause", 1);
        let control = runner.control();
        control.pause();
        let handle = tokio::spawn(async move {
            runner
                .run("wf-pause", &tasks, None, ctx, RunnerOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        control.resume();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
    }

    #[tokio::test]
    async fn cancel_stops_the_workflow_before_remaining_stages() {
        let runner = Arc::new(make_runner());
        let tasks = vec![
            ai_task(1, 1, &[], "first"),
            ai_task(2, 2, &[1], "second"),
            ai_task(3, 3, &[2], "third"),
        ];
        let ctx = ExecutionContext::new("wf-cancel", 1);
        let control = runner.control();
        control.pause();
        let runner_for_run = runner.clone();
        let handle = tokio::spawn(async move {
            runner_for_run
                .run("wf-cancel", &tasks, None, ctx, RunnerOptions::default())
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.cancel_workflow().await;
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Cancelled);
        assert_eq!(result.completed_count, 0);
    }

    #[tokio::test]
    async fn resume_continues_from_the_latest_checkpoint() {
        let runner = make_runner();
        let tasks = vec![
            ai_task(1, 1, &[], "first"),
            ai_task(2, 2, &[1], "second"),
        ];
        let ctx = ExecutionContext::new("wf-resume", 1);
        let checkpoint = Checkpoint {
            workflow_id: "wf-resume".to_string(),
            completed_task_ids: vec![1],
            context: {
                let mut seeded = ExecutionContext::new("wf-resume", 1);
                seeded.previous_results.push(flowcore_types::TaskResult {
                    task_id: 1,
                    project_sequence: 1,
                    status: ResultStatus::Success,
                    output: serde_json::json!("first result"),
                    attachments: Vec::new(),
                    start_time: Utc::now(),
                    end_time: Utc::now(),
                    duration_ms: 10,
                    cost: 0.0,
                    tokens: 0,
                    retries: 0,
                    metadata: Default::default(),
                    error: None,
                });
                seeded
            },
            timestamp: Utc::now(),
        };
        runner
            .checkpoint_store
            .save(checkpoint)
            .await
            .unwrap();

        let result = runner
            .resume("wf-resume", &tasks, None, RunnerOptions::default())
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.completed_count, 1);
        assert_eq!(result.total_count, 1);
    }
}
