//! AI Service Manager: executes one AI task end-to-end — provider
//! and model resolution, MCP requirement detection and pre-flight, prompt
//! assembly, and the image/tool-loop/streaming/non-streaming execution
//! branches. Everything about *how* an upstream model gets called lives in
//! `flowcore-providers`; this crate is the policy layer on top of it.

mod cancellation;
mod mcp_detection;
mod prompt;
mod provider_resolution;
mod tool_loop;

pub use cancellation::CancellationRegistry;
pub use mcp_detection::{preflight_insights, required_mcps};
pub use prompt::{build_system_prompt, build_user_prompt};
pub use provider_resolution::{resolve_provider, ResolvedProvider};
pub use tool_loop::{collect_tool_definitions, parse_json_tool_call_fallback, run_tool_loop};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flowcore_mcp::McpFacade;
use flowcore_observability::{emit_event, ObservabilityEvent};
use flowcore_providers::ProviderRegistry;
use flowcore_types::{
    AiResult, AiResultMeta, ExecutionContext, ExecutionError, MCPContextInsight, Message, ProjectInfo,
    Role, Task,
};
use tokio_util::sync::CancellationToken;
use tracing::Level;

pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type LogCallback = Arc<dyn Fn(tracing::Level, &str) + Send + Sync>;

/// Options threaded through one `executeTask` call. Retry
/// orchestration and fallback-provider swapping on failure are the Advanced
/// Task Executor's job, not this crate's — `max_retries` and
/// `fallback_providers` are carried here only so a single call can honor a
/// caller-selected alternate provider without looping itself.
#[derive(Clone)]
pub struct AiExecutionOptions {
    pub streaming: bool,
    pub on_token: Option<TokenCallback>,
    pub on_log: Option<LogCallback>,
    pub timeout: Duration,
    pub max_retries: u32,
    pub fallback_providers: Vec<String>,
    pub signal: CancellationToken,
}

impl Default for AiExecutionOptions {
    fn default() -> Self {
        AiExecutionOptions {
            streaming: false,
            on_token: None,
            on_log: None,
            timeout: Duration::from_millis(300_000),
            max_retries: 3,
            fallback_providers: Vec::new(),
            signal: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AIExecutionResult {
    pub success: bool,
    pub content: String,
    pub ai_result: Option<AiResult>,
    pub tokens_used: u64,
    pub cost: f64,
    pub duration_ms: i64,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub finish_reason: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub error: Option<ExecutionError>,
}

/// Owns the provider registry and MCP facade this workspace's collaborators
/// inject, plus the cancellation registry for in-flight executions.
#[derive(Clone)]
pub struct AiServiceManager {
    providers: ProviderRegistry,
    mcp: Arc<McpFacade>,
    cancellations: CancellationRegistry,
}

impl AiServiceManager {
    pub fn new(providers: ProviderRegistry, mcp: Arc<McpFacade>) -> Self {
        AiServiceManager {
            providers,
            mcp,
            cancellations: CancellationRegistry::new(),
        }
    }

    pub fn cancellations(&self) -> &CancellationRegistry {
        &self.cancellations
    }

    pub async fn cancel_execution(&self, task_id: i64) {
        self.cancellations.cancel_task(task_id).await;
    }

    pub async fn execute_task(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        options: AiExecutionOptions,
    ) -> Result<AIExecutionResult, ExecutionError> {
        let started = Utc::now();
        let (exec_key, cancel) = self.cancellations.register(task.id, options.signal.clone()).await;
        let result = self.execute_task_inner(task, ctx, project, &options, &cancel, started).await;
        self.cancellations.remove(&exec_key).await;
        result
    }

    async fn execute_task_inner(
        &self,
        task: &Task,
        ctx: &ExecutionContext,
        project: Option<&ProjectInfo>,
        options: &AiExecutionOptions,
        cancel: &CancellationToken,
        started: chrono::DateTime<Utc>,
    ) -> Result<AIExecutionResult, ExecutionError> {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let resolved = resolve_provider(&self.providers, task).await;
        emit_event(
            Level::INFO,
            ObservabilityEvent {
                workflow_id: Some(ctx.workflow_id.as_str()),
                task_id: Some(task.id),
                provider_id: resolved.provider_id.as_deref(),
                model_id: resolved.model_id.as_deref(),
                status: Some("resolved"),
                ..ObservabilityEvent::new("ai.provider.resolve", "flowcore-ai")
            },
        );

        let required = required_mcps(task);
        let insights = preflight_insights(&self.mcp, task, &required).await;

        let system_prompt = build_system_prompt(task, project, &required, &insights);
        let resolved_description = task.effective_prompt();
        let user_prompt = build_user_prompt(task, ctx, &resolved_description, &insights);
        let user_msg = prompt::user_message(&user_prompt);

        let messages = vec![Message::text(Role::System, system_prompt), user_msg];

        let output_format = task.expected_output_format;
        let wants_image_generation = output_format.map(|f| f.is_image()).unwrap_or(false)
            && user_prompt.images.is_empty();

        let outcome = if wants_image_generation {
            self.run_image_path(task, &resolved, &resolved_description).await
        } else {
            let tools = collect_tool_definitions(&self.mcp, task.id, &required).await;
            if !tools.is_empty() {
                self.run_tool_path(task, &resolved, messages, tools, cancel).await
            } else if options.streaming {
                self.run_streaming_path(&resolved, messages, options, cancel).await
            } else {
                self.run_plain_path(&resolved, messages).await
            }
        };

        let duration_ms = (Utc::now() - started).num_milliseconds();

        match outcome {
            Ok(mut built) => {
                built.duration_ms = duration_ms;
                built.content = post_process(&built.content, output_format, &insights);
                Ok(built)
            }
            Err(err) => {
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        workflow_id: Some(ctx.workflow_id.as_str()),
                        task_id: Some(task.id),
                        provider_id: resolved.provider_id.as_deref(),
                        model_id: resolved.model_id.as_deref(),
                        status: Some("error"),
                        error_code: Some(err.kind_name()),
                        detail: Some(&err.to_string()),
                        ..ObservabilityEvent::new("ai.execute.error", "flowcore-ai")
                    },
                );
                Err(err)
            }
        }
    }

    async fn run_plain_path(
        &self,
        resolved: &ResolvedProvider,
        messages: Vec<Message>,
    ) -> Result<AIExecutionResult, ExecutionError> {
        let response = self
            .providers
            .execute(
                resolved.provider_id.as_deref(),
                &messages,
                resolved.model_id.as_deref(),
                None,
            )
            .await
            .map_err(|err| provider_error(resolved.provider_id.as_deref(), err))?;

        let meta = &response.result.meta;
        let cost = self
            .providers
            .calculate_cost(
                resolved.provider_id.as_deref(),
                resolved.model_id.as_deref(),
                meta.prompt_tokens,
                meta.completion_tokens,
            )
            .await
            .unwrap_or(0.0);

        Ok(AIExecutionResult {
            success: true,
            content: response.result.value.clone(),
            tokens_used: meta.prompt_tokens + meta.completion_tokens,
            cost,
            duration_ms: 0,
            provider: meta.provider.clone(),
            model: meta.model.clone(),
            finish_reason: meta.finish_reason.clone(),
            metadata: Default::default(),
            error: None,
            ai_result: Some(response.result),
        })
    }

    async fn run_streaming_path(
        &self,
        resolved: &ResolvedProvider,
        messages: Vec<Message>,
        options: &AiExecutionOptions,
        cancel: &CancellationToken,
    ) -> Result<AIExecutionResult, ExecutionError> {
        use futures::StreamExt;

        let mut stream = self
            .providers
            .stream_execute(
                resolved.provider_id.as_deref(),
                messages,
                resolved.model_id.as_deref(),
                None,
                cancel.clone(),
            )
            .await
            .map_err(|err| provider_error(resolved.provider_id.as_deref(), err))?;

        let mut content = String::new();
        let mut usage = None;
        let mut finish_reason = None;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            match chunk.map_err(|err| provider_error(resolved.provider_id.as_deref(), err))? {
                flowcore_providers::StreamChunk::TextDelta(delta) => {
                    if let Some(on_token) = &options.on_token {
                        on_token(&delta);
                    }
                    content.push_str(&delta);
                }
                flowcore_providers::StreamChunk::ReasoningDelta(_) => {}
                flowcore_providers::StreamChunk::ToolCallStart { .. }
                | flowcore_providers::StreamChunk::ToolCallDelta { .. }
                | flowcore_providers::StreamChunk::ToolCallEnd { .. } => {}
                flowcore_providers::StreamChunk::Done {
                    finish_reason: reason,
                    usage: chunk_usage,
                } => {
                    finish_reason = Some(reason);
                    usage = chunk_usage;
                }
            }
        }

        let (prompt_tokens, completion_tokens) = usage
            .as_ref()
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((0, 0));
        let cost = self
            .providers
            .calculate_cost(
                resolved.provider_id.as_deref(),
                resolved.model_id.as_deref(),
                prompt_tokens,
                completion_tokens,
            )
            .await
            .unwrap_or(0.0);

        Ok(AIExecutionResult {
            success: true,
            content: content.clone(),
            tokens_used: prompt_tokens + completion_tokens,
            cost,
            duration_ms: 0,
            provider: resolved.provider_id.clone(),
            model: resolved.model_id.clone(),
            finish_reason: finish_reason.clone(),
            metadata: Default::default(),
            error: None,
            ai_result: Some(AiResult::text(
                content,
                AiResultMeta {
                    provider: resolved.provider_id.clone(),
                    model: resolved.model_id.clone(),
                    prompt_tokens,
                    completion_tokens,
                    tool_calls: Vec::new(),
                    finish_reason,
                },
            )),
        })
    }

    async fn run_tool_path(
        &self,
        task: &Task,
        resolved: &ResolvedProvider,
        messages: Vec<Message>,
        tools: Vec<flowcore_types::ToolDefinition>,
        cancel: &CancellationToken,
    ) -> Result<AIExecutionResult, ExecutionError> {
        let outcome = run_tool_loop(
            &self.providers,
            &self.mcp,
            resolved.provider_id.as_deref(),
            resolved.model_id.as_deref(),
            messages,
            tools,
            task,
            cancel,
        )
        .await?;

        let cost = self
            .providers
            .calculate_cost(
                resolved.provider_id.as_deref(),
                resolved.model_id.as_deref(),
                outcome.prompt_tokens,
                outcome.completion_tokens,
            )
            .await
            .unwrap_or(0.0);

        Ok(AIExecutionResult {
            success: true,
            content: outcome.final_text.clone(),
            tokens_used: outcome.prompt_tokens + outcome.completion_tokens,
            cost,
            duration_ms: 0,
            provider: resolved.provider_id.clone(),
            model: resolved.model_id.clone(),
            finish_reason: outcome.finish_reason.clone(),
            metadata: Default::default(),
            error: None,
            ai_result: Some(AiResult::text(
                outcome.final_text,
                AiResultMeta {
                    provider: resolved.provider_id.clone(),
                    model: resolved.model_id.clone(),
                    prompt_tokens: outcome.prompt_tokens,
                    completion_tokens: outcome.completion_tokens,
                    tool_calls: Vec::new(),
                    finish_reason: outcome.finish_reason,
                },
            )),
        })
    }

    /// Delegates straight to the provider's image generation, with
    /// any `imageConfig` knobs folded into the prompt text since
    /// `Provider::generate_image` speaks a plain prompt string.
    async fn run_image_path(
        &self,
        task: &Task,
        resolved: &ResolvedProvider,
        base_prompt: &str,
    ) -> Result<AIExecutionResult, ExecutionError> {
        let prompt = match &task.image_config {
            Some(cfg) => {
                let mut qualifiers = Vec::new();
                if let Some(size) = &cfg.size {
                    qualifiers.push(format!("size={size}"));
                }
                if let Some(quality) = &cfg.quality {
                    qualifiers.push(format!("quality={quality}"));
                }
                if let Some(style) = &cfg.style {
                    qualifiers.push(format!("style={style}"));
                }
                if let Some(count) = cfg.count {
                    qualifiers.push(format!("count={count}"));
                }
                if qualifiers.is_empty() {
                    base_prompt.to_string()
                } else {
                    format!("{base_prompt}\n\n[image options: {}]", qualifiers.join(", "))
                }
            }
            None => base_prompt.to_string(),
        };

        let result = self
            .providers
            .generate_image(resolved.provider_id.as_deref(), &prompt, resolved.model_id.as_deref())
            .await
            .map_err(|err| provider_error(resolved.provider_id.as_deref(), err))?;

        Ok(AIExecutionResult {
            success: true,
            content: result.value.clone(),
            tokens_used: result.meta.prompt_tokens + result.meta.completion_tokens,
            cost: 0.0,
            duration_ms: 0,
            provider: result.meta.provider.clone(),
            model: result.meta.model.clone(),
            finish_reason: result.meta.finish_reason.clone(),
            metadata: Default::default(),
            error: None,
            ai_result: Some(result),
        })
    }
}

fn provider_error(provider_id: Option<&str>, err: anyhow::Error) -> ExecutionError {
    ExecutionError::Provider(flowcore_types::ProviderErrorDetail::Http {
        provider: provider_id.unwrap_or("unresolved").to_string(),
        status: 0,
        message: err.to_string(),
    })
}

/// Post-processing: strips stray Markdown fences when the
/// model wrapped a JSON response, and appends a "System Alerts" section
/// when any MCP insight reports an error.
fn post_process(
    content: &str,
    output_format: Option<flowcore_types::OutputFormat>,
    insights: &[MCPContextInsight],
) -> String {
    let mut content = if output_format == Some(flowcore_types::OutputFormat::Json) {
        strip_json_fences(content)
    } else {
        content.to_string()
    };

    let erroring: Vec<&MCPContextInsight> = insights.iter().filter(|i| i.is_error()).collect();
    if !erroring.is_empty() {
        content.push_str("\n\n## System Alerts\n\n");
        for insight in erroring {
            content.push_str(&format!(
                "- {}: {}\n",
                insight.name,
                insight.error.as_deref().unwrap_or("unknown error")
            ));
        }
    }

    content
}

fn strip_json_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    else {
        return content.to_string();
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_json_fences_unwraps_fenced_block() {
        let wrapped = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_json_fences(wrapped), "{\"a\":1}");
    }

    #[test]
    fn strip_json_fences_leaves_plain_json_untouched() {
        let plain = "{\"a\":1}";
        assert_eq!(strip_json_fences(plain), plain);
    }

    #[test]
    fn post_process_appends_system_alerts_for_erroring_insights() {
        let insights = vec![MCPContextInsight {
            name: "slack".to_string(),
            description: None,
            endpoint: None,
            recommended_tools: Vec::new(),
            sample_output: None,
            error: Some("token expired".to_string()),
            user_context: None,
            env_vars: Default::default(),
        }];
        let result = post_process("done", None, &insights);
        assert!(result.contains("## System Alerts"));
        assert!(result.contains("token expired"));
    }

    #[test]
    fn post_process_leaves_content_alone_when_no_errors() {
        let result = post_process("done", None, &[]);
        assert_eq!(result, "done");
    }
}
