//! Advanced Task Executor: runs one task, of any kind, to a
//! `TaskResult`. Owns the retry/backoff/fallback-provider loop; delegation
//! to `flowcore-ai` for `ai` tasks, and to the host-supplied
//! `ScriptExecutor`/`InputProvider`/`OutputProvider` collaborators for the
//! other three kinds, happens once per attempt inside that loop.

mod backoff;
mod output_target;
mod prompt;

pub use backoff::{delay_for_attempt, RetryStrategy};
pub use output_target::OutputTarget;
pub use prompt::{assemble, variables_as_env, AssembledPrompt};

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use flowcore_ai::{AiExecutionOptions, AiServiceManager, LogCallback};
use flowcore_observability::{emit_event, ObservabilityEvent};
use flowcore_types::{
    AiResultFormat, AiResultKind, Attachment, AttachmentEncoding, BudgetErrorDetail, ErrorInfo,
    ExecutionContext, ExecutionError, InputMode, InputProvider, OutputFormat, OutputProvider,
    ProjectInfo, ResultStatus, ScriptErrorDetail, ScriptExecutor, ScriptLanguage, Task, TaskKind,
    TaskResult,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Options threaded through one `executeTask` call. Unlike
/// `flowcore-ai`'s `AiExecutionOptions`, this is the caller-facing shape:
/// the retry loop itself lives in this crate, so `retry_strategy` here is
/// honored rather than merely carried.
#[derive(Clone)]
pub struct ExecutorOptions {
    pub retry_strategy: RetryStrategy,
    pub timeout: Duration,
    pub fallback_providers: Vec<String>,
    pub on_log: Option<LogCallback>,
    pub signal: CancellationToken,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            retry_strategy: RetryStrategy::default(),
            timeout: Duration::from_millis(300_000),
            fallback_providers: Vec::new(),
            on_log: None,
            signal: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReviewResult {
    pub success: bool,
    pub content: String,
    pub cost: f64,
    pub tokens: u64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub duration_ms: i64,
}

/// Owns the AI Service Manager plus the three external-I/O collaborators
/// a `script`/`input`/`output` task needs. All three are injected by the
/// host application.
#[derive(Clone)]
pub struct TaskExecutor {
    ai: AiServiceManager,
    script: Arc<dyn ScriptExecutor>,
    input: Arc<dyn InputProvider>,
    output: Arc<dyn OutputProvider>,
}

impl TaskExecutor {
    pub fn new(
        ai: AiServiceManager,
        script: Arc<dyn ScriptExecutor>,
        input: Arc<dyn InputProvider>,
        output: Arc<dyn OutputProvider>,
    ) -> Self {
        TaskExecutor {
            ai,
            script,
            input,
            output,
        }
    }

    /// Exposes the underlying AI Service Manager so a caller (the Workflow
    /// Runner) can reach its cancellation registry directly: cancellation
    /// aborts any in-flight AI executions through that registry.
    pub fn ai(&self) -> &AiServiceManager {
        &self.ai
    }

    /// Runs `task` to completion, never returning `Err`: recoverable and
    /// unrecoverable failures alike surface as a `status=failure`
    /// `TaskResult`.
    pub async fn execute_task(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        options: &ExecutorOptions,
    ) -> TaskResult {
        let start = Utc::now();

        if task.is_subdivided {
            return TaskResult::skipped(task.id, task.project_sequence, start);
        }

        let max_retries = options.retry_strategy.max_retries.max(1);
        let mut last_error = ExecutionError::Timeout;
        let mut last_provider: Option<String> = None;

        for attempt in 0..max_retries {
            if options.signal.is_cancelled() {
                return self.failure(task, start, ExecutionError::Cancelled, last_provider, attempt);
            }

            if let Some(budget) = &ctx.budget {
                if !budget.has_room() {
                    let err = ExecutionError::Budget(BudgetErrorDetail {
                        max_cost: budget.max_cost,
                        current_cost: budget.current_cost,
                        max_tokens: budget.max_tokens,
                        current_tokens: budget.current_tokens,
                    });
                    return self.failure(task, start, err, last_provider, attempt);
                }
            }

            let assembled = prompt::assemble(task, ctx);
            let fallback_provider = fallback_provider_for_attempt(&options.fallback_providers, attempt);

            let outcome = self
                .dispatch(task, &assembled, ctx, project, options, fallback_provider.as_deref())
                .await;

            match outcome {
                Ok(mut result) => {
                    result.retries = attempt;
                    return result;
                }
                Err(err) => {
                    last_error = err.clone();
                    last_provider = fallback_provider.or(last_provider);
                    let retryable = err.is_retryable();

                    emit_event(
                        Level::WARN,
                        ObservabilityEvent {
                            workflow_id: Some(ctx.workflow_id.as_str()),
                            task_id: Some(task.id),
                            status: Some(if retryable { "retrying" } else { "failed" }),
                            error_code: Some(err.kind_name()),
                            detail: Some(&err.to_string()),
                            ..ObservabilityEvent::new("executor.attempt.error", "flowcore-executor")
                        },
                    );
                    if let Some(on_log) = &options.on_log {
                        on_log(Level::WARN, &format!("task {} attempt {attempt} failed: {err}", task.id));
                    }

                    if !retryable || attempt + 1 == max_retries {
                        break;
                    }

                    let delay = backoff::delay_for_attempt(&options.retry_strategy, attempt);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        self.failure(task, start, last_error, last_provider, max_retries - 1)
    }

    async fn dispatch(
        &self,
        task: &Task,
        assembled: &AssembledPrompt,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        options: &ExecutorOptions,
        fallback_provider: Option<&str>,
    ) -> Result<TaskResult, ExecutionError> {
        let start = Utc::now();
        match task.task_type {
            TaskKind::Ai => self.dispatch_ai(task, assembled, ctx, project, options, fallback_provider, start).await,
            TaskKind::Script => self.dispatch_script(task, assembled, ctx, options, start).await,
            TaskKind::Input => self.dispatch_input(task, assembled, start).await,
            TaskKind::Output => self.dispatch_output(task, assembled, start).await,
        }
    }

    async fn dispatch_ai(
        &self,
        task: &Task,
        assembled: &AssembledPrompt,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        options: &ExecutorOptions,
        fallback_provider: Option<&str>,
        start: DateTime<Utc>,
    ) -> Result<TaskResult, ExecutionError> {
        let mut augmented_task = task.clone();
        augmented_task.ai_prompt = Some(assembled.augmented.clone());
        if let Some(provider) = fallback_provider {
            augmented_task.ai_provider = Some(provider.to_string());
        }

        let ai_options = AiExecutionOptions {
            timeout: options.timeout,
            on_log: options.on_log.clone(),
            signal: options.signal.clone(),
            ..Default::default()
        };

        let result = self
            .ai
            .execute_task(&augmented_task, ctx, project, ai_options)
            .await?;

        Ok(ai_result_to_task_result(task, result, start, &assembled.dependency_attachments))
    }

    async fn dispatch_script(
        &self,
        task: &Task,
        assembled: &AssembledPrompt,
        ctx: &ExecutionContext,
        options: &ExecutorOptions,
        start: DateTime<Utc>,
    ) -> Result<TaskResult, ExecutionError> {
        let language = task.script_language.unwrap_or(ScriptLanguage::Bash);
        let env = prompt::variables_as_env(ctx);

        let output = self
            .script
            .run_script(language, &assembled.macro_resolved, &env, options.signal.clone())
            .await?;

        if output.exit_code != 0 {
            return Err(ExecutionError::Script(ScriptErrorDetail::NonZeroExit {
                code: output.exit_code,
                stderr: output.stderr.clone(),
            }));
        }

        let end = Utc::now();
        let mut metadata = serde_json::Map::new();
        if !output.stderr.is_empty() {
            metadata.insert("stderr".to_string(), serde_json::Value::String(output.stderr));
        }

        Ok(TaskResult {
            task_id: task.id,
            project_sequence: task.project_sequence,
            status: ResultStatus::Success,
            output: serde_json::Value::String(output.stdout),
            attachments: assembled.dependency_attachments.clone(),
            start_time: start,
            end_time: end,
            duration_ms: (end - start).num_milliseconds(),
            cost: 0.0,
            tokens: 0,
            retries: 0,
            metadata,
            error: None,
        })
    }

    async fn dispatch_input(
        &self,
        task: &Task,
        assembled: &AssembledPrompt,
        start: DateTime<Utc>,
    ) -> Result<TaskResult, ExecutionError> {
        let response = self
            .input
            .request_user_input(&assembled.augmented, InputMode::Required)
            .await?;

        let end = Utc::now();
        let mut attachments = assembled.dependency_attachments.clone();
        attachments.extend(response.attachments);

        Ok(TaskResult {
            task_id: task.id,
            project_sequence: task.project_sequence,
            status: ResultStatus::Success,
            output: response.text.map(serde_json::Value::String).unwrap_or(serde_json::Value::Null),
            attachments,
            start_time: start,
            end_time: end,
            duration_ms: (end - start).num_milliseconds(),
            cost: 0.0,
            tokens: 0,
            retries: 0,
            metadata: Default::default(),
            error: None,
        })
    }

    async fn dispatch_output(
        &self,
        task: &Task,
        assembled: &AssembledPrompt,
        start: DateTime<Utc>,
    ) -> Result<TaskResult, ExecutionError> {
        let (target, content) = OutputTarget::parse(&assembled.augmented, task.id);

        match &target {
            OutputTarget::Path(path) => self.output.write_file(path, &content).await?,
            OutputTarget::Channel(channel) => self.output.send_notification(channel, &content).await?,
            OutputTarget::Url(url) => {
                self.output
                    .post_http(url, &std::collections::HashMap::new(), &content)
                    .await?
            }
        }

        let end = Utc::now();
        Ok(TaskResult {
            task_id: task.id,
            project_sequence: task.project_sequence,
            status: ResultStatus::Success,
            output: serde_json::Value::String(content),
            attachments: assembled.dependency_attachments.clone(),
            start_time: start,
            end_time: end,
            duration_ms: (end - start).num_milliseconds(),
            cost: 0.0,
            tokens: 0,
            retries: 0,
            metadata: Default::default(),
            error: None,
        })
    }

    /// AI review specialization: invokes the AI Service
    /// Manager with the task's review provider/model (falling back to its
    /// execution provider/model), forced text output, and an optional
    /// image attachment for visual review.
    pub async fn review_task(
        &self,
        task: &Task,
        content: &str,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        image: Option<Attachment>,
        options: &ExecutorOptions,
    ) -> ReviewResult {
        let start = Utc::now();

        let mut review_ctx = ctx.clone();
        if let Some(attachment) = image {
            let now = Utc::now();
            review_ctx.previous_results.push(TaskResult {
                task_id: task.id,
                project_sequence: -1,
                status: ResultStatus::Success,
                output: serde_json::Value::Null,
                attachments: vec![attachment],
                start_time: now,
                end_time: now,
                duration_ms: 0,
                cost: 0.0,
                tokens: 0,
                retries: 0,
                metadata: Default::default(),
                error: None,
            });
        }

        let mut review_task = task.clone();
        review_task.task_type = TaskKind::Ai;
        review_task.ai_provider = task.review_ai_provider.clone().or_else(|| task.ai_provider.clone());
        review_task.ai_model = task.review_ai_model.clone().or_else(|| task.ai_model.clone());
        review_task.expected_output_format = Some(OutputFormat::Text);
        review_task.ai_prompt = Some(format!(
            "Review the following content and provide constructive feedback:\n\n{content}"
        ));

        let ai_options = AiExecutionOptions {
            timeout: options.timeout,
            signal: options.signal.clone(),
            ..Default::default()
        };

        match self.ai.execute_task(&review_task, &review_ctx, project, ai_options).await {
            Ok(result) => ReviewResult {
                success: true,
                content: result.content,
                cost: result.cost,
                tokens: result.tokens_used,
                provider: result.provider,
                model: result.model,
                duration_ms: (Utc::now() - start).num_milliseconds(),
            },
            Err(err) => ReviewResult {
                success: false,
                content: err.to_string(),
                cost: 0.0,
                tokens: 0,
                provider: None,
                model: None,
                duration_ms: (Utc::now() - start).num_milliseconds(),
            },
        }
    }

    fn failure(
        &self,
        task: &Task,
        start: DateTime<Utc>,
        err: ExecutionError,
        last_provider: Option<String>,
        retries: u32,
    ) -> TaskResult {
        let end = Utc::now();
        let mut error = ErrorInfo::from(&err);
        error.last_provider = last_provider;

        TaskResult {
            task_id: task.id,
            project_sequence: task.project_sequence,
            status: ResultStatus::Failure,
            output: serde_json::Value::Null,
            attachments: Vec::new(),
            start_time: start,
            end_time: end,
            duration_ms: (end - start).num_milliseconds(),
            cost: 0.0,
            tokens: 0,
            retries,
            metadata: Default::default(),
            error: Some(error),
        }
    }
}

/// The provider to substitute for a given retry attempt. Attempt 0 always
/// runs with the task's own configured provider (`None` here); only once
/// that attempt has failed does a fallback get swapped in for the *next*
/// attempt, so `fallback_providers[0]` first applies at `attempt == 1`.
fn fallback_provider_for_attempt(fallback_providers: &[String], attempt: u32) -> Option<String> {
    if attempt == 0 {
        None
    } else {
        fallback_providers.get((attempt - 1) as usize).cloned()
    }
}

/// Maps a non-text `AiResult` onto a `TaskResult` attachment, with
/// `format` determining the attachment's encoding.
fn ai_result_to_task_result(
    task: &Task,
    ai: flowcore_ai::AIExecutionResult,
    start: DateTime<Utc>,
    dependency_attachments: &[Attachment],
) -> TaskResult {
    let end = Utc::now();
    let mut attachments = dependency_attachments.to_vec();

    if let Some(result) = &ai.ai_result {
        if result.kind != AiResultKind::Text {
            attachments.push(Attachment {
                name: format!("task-{}-{}", task.id, kind_extension(result.kind)),
                mime: result
                    .mime
                    .clone()
                    .unwrap_or_else(|| default_mime(result.kind)),
                encoding: match result.format {
                    AiResultFormat::Base64 => AttachmentEncoding::Base64,
                    AiResultFormat::Url => AttachmentEncoding::Url,
                    AiResultFormat::Plain | AiResultFormat::Binary => AttachmentEncoding::Text,
                },
                content: result.value.clone(),
            });
        }
    }

    TaskResult {
        task_id: task.id,
        project_sequence: task.project_sequence,
        status: ResultStatus::Success,
        output: serde_json::Value::String(ai.content),
        attachments,
        start_time: start,
        end_time: end,
        duration_ms: (end - start).num_milliseconds(),
        cost: ai.cost,
        tokens: ai.tokens_used,
        retries: 0,
        metadata: ai.metadata,
        error: None,
    }
}

fn kind_extension(kind: AiResultKind) -> &'static str {
    match kind {
        AiResultKind::Text => "txt",
        AiResultKind::Image => "png",
        AiResultKind::Audio => "mp3",
        AiResultKind::Video => "mp4",
        AiResultKind::Document => "pdf",
        AiResultKind::Data => "json",
    }
}

fn default_mime(kind: AiResultKind) -> String {
    match kind {
        AiResultKind::Text => "text/plain",
        AiResultKind::Image => "image/png",
        AiResultKind::Audio => "audio/mpeg",
        AiResultKind::Video => "video/mp4",
        AiResultKind::Document => "application/pdf",
        AiResultKind::Data => "application/json",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_types::{AiResult, AiResultMeta};

    fn task() -> Task {
        Task {
            id: 1,
            project_id: 1,
            project_sequence: 1,
            title: "t".to_string(),
            description: None,
            priority: flowcore_types::Priority::Medium,
            status: flowcore_types::TaskStatus::Todo,
            task_type: TaskKind::Ai,
            dependencies: Default::default(),
            trigger_config: Default::default(),
            ai_provider: None,
            ai_model: None,
            ai_temperature: None,
            ai_max_tokens: None,
            ai_prompt: None,
            generated_prompt: None,
            expected_output_format: None,
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

    #[test]
    fn text_ai_result_yields_no_attachment() {
        let ai = flowcore_ai::AIExecutionResult {
            success: true,
            content: "hi".to_string(),
            ai_result: Some(AiResult::text("hi", AiResultMeta::default())),
            tokens_used: 3,
            cost: 0.0,
            duration_ms: 0,
            provider: None,
            model: None,
            finish_reason: None,
            metadata: Default::default(),
            error: None,
        };
        let result = ai_result_to_task_result(&task(), ai, Utc::now(), &[]);
        assert!(result.attachments.is_empty());
        assert_eq!(result.status, ResultStatus::Success);
    }

    #[test]
    fn image_ai_result_yields_a_base64_attachment() {
        let ai = flowcore_ai::AIExecutionResult {
            success: true,
            content: "an image".to_string(),
            ai_result: Some(AiResult {
                kind: AiResultKind::Image,
                sub_type: None,
                format: AiResultFormat::Base64,
                value: "Zm9v".to_string(),
                mime: Some("image/png".to_string()),
                meta: AiResultMeta::default(),
            }),
            tokens_used: 0,
            cost: 0.0,
            duration_ms: 0,
            provider: None,
            model: None,
            finish_reason: None,
            metadata: Default::default(),
            error: None,
        };
        let result = ai_result_to_task_result(&task(), ai, Utc::now(), &[]);
        assert_eq!(result.attachments.len(), 1);
        assert_eq!(result.attachments[0].encoding, AttachmentEncoding::Base64);
    }

    #[test]
    fn first_attempt_keeps_the_tasks_own_provider() {
        let fallbacks = vec!["openai".to_string()];
        assert_eq!(fallback_provider_for_attempt(&fallbacks, 0), None);
    }

    #[test]
    fn second_attempt_swaps_in_the_first_fallback() {
        let fallbacks = vec!["openai".to_string()];
        assert_eq!(fallback_provider_for_attempt(&fallbacks, 1), Some("openai".to_string()));
    }

    #[test]
    fn third_attempt_swaps_in_the_second_fallback() {
        let fallbacks = vec!["openai".to_string(), "mistral".to_string()];
        assert_eq!(fallback_provider_for_attempt(&fallbacks, 2), Some("mistral".to_string()));
    }

    #[test]
    fn attempt_past_the_fallback_list_yields_none() {
        let fallbacks = vec!["openai".to_string()];
        assert_eq!(fallback_provider_for_attempt(&fallbacks, 2), None);
    }

    #[test]
    fn subdivided_task_is_skipped_without_dispatch() {
        let mut t = task();
        t.is_subdivided = true;
        let result = TaskResult::skipped(t.id, t.project_sequence, Utc::now());
        assert_eq!(result.status, ResultStatus::Skipped);
    }
}
