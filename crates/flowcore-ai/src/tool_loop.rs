//! The bounded tool (MCP) call loop.

use flowcore_mcp::{McpCallError, McpFacade, ToolCallSource};
use flowcore_providers::ProviderRegistry;
use flowcore_types::{
    ExecutionError, Message, MessagePart, Role, Task, ToolCall, ToolDefinition, ToolErrorDetail,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

const MAX_ITERATIONS: u32 = 5;
const TOOL_RESULT_CHAR_CAP: usize = 6000;

pub struct ToolLoopOutcome {
    pub final_text: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub finish_reason: Option<String>,
}

/// Gathers tools from every required MCP, prefixing each with
/// `<mcp>_` so a call can be routed back to its server.
pub async fn collect_tool_definitions(
    mcp: &McpFacade,
    task_id: i64,
    required_mcps: &[String],
) -> Vec<ToolDefinition> {
    let mut definitions = Vec::new();
    for slug in required_mcps {
        if let Ok(tools) = mcp.list_tools(slug, task_id).await {
            for tool in tools {
                definitions.push(ToolDefinition {
                    name: format!("{slug}_{}", tool.name),
                    description: tool.description,
                    parameters_schema: tool.parameters_schema,
                });
            }
        }
    }
    definitions
}

fn parse_prefixed_tool_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('_')
}

fn cap_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text;
    }
    let mut capped: String = text.chars().take(max_chars).collect();
    capped.push_str("...[truncated]");
    capped
}

/// JSON tool-call fallback, used when the provider returns
/// no native `toolCalls` but the assistant text encodes one as
/// `{"tool": "...", "parameters": {...}}`, bare or inside a fenced code
/// block.
pub fn parse_json_tool_call_fallback(text: &str) -> Option<ToolCall> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(call) = tool_call_from_value(&value) {
            return Some(call);
        }
    }

    if let Some(block) = extract_fenced_json(trimmed).or_else(|| extract_first_json_object(trimmed)) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if let Some(call) = tool_call_from_value(&value) {
                return Some(call);
            }
        }
    }

    None
}

fn tool_call_from_value(value: &Value) -> Option<ToolCall> {
    let obj = value.as_object()?;
    let name = obj.get("tool").and_then(Value::as_str)?;
    let arguments = obj
        .get("parameters")
        .or_else(|| obj.get("arguments"))
        .or_else(|| obj.get("args"))
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));
    Some(ToolCall {
        id: format!("fallback-{}", uuid::Uuid::new_v4()),
        name: name.to_string(),
        arguments,
    })
}

fn extract_fenced_json(input: &str) -> Option<String> {
    let start = input.find("```json")? + "```json".len();
    let rest = &input[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

fn extract_first_json_object(input: &str) -> Option<String> {
    let mut start = None;
    let mut depth = 0usize;
    for (idx, ch) in input.char_indices() {
        if ch == '{' {
            if start.is_none() {
                start = Some(idx);
            }
            depth += 1;
        } else if ch == '}' {
            if depth == 0 {
                continue;
            }
            depth -= 1;
            if depth == 0 {
                let begin = start?;
                return Some(input[begin..=idx].to_string());
            }
        }
    }
    None
}

/// Drives the bounded tool-call loop. `messages` must already contain the
/// system and initial user message; tool and assistant messages are
/// appended in place across iterations.
#[allow(clippy::too_many_arguments)]
pub async fn run_tool_loop(
    providers: &ProviderRegistry,
    mcp: &McpFacade,
    provider_id: Option<&str>,
    model_id: Option<&str>,
    mut messages: Vec<Message>,
    tools: Vec<ToolDefinition>,
    task: &Task,
    cancel: &CancellationToken,
) -> Result<ToolLoopOutcome, ExecutionError> {
    let mut prompt_tokens = 0u64;
    let mut completion_tokens = 0u64;
    let mut finish_reason = None;

    for _iteration in 0..MAX_ITERATIONS {
        if cancel.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }

        let response = providers
            .execute(provider_id, &messages, model_id, Some(&tools))
            .await
            .map_err(|err| provider_error(provider_id, err))?;

        prompt_tokens += response.result.meta.prompt_tokens;
        completion_tokens += response.result.meta.completion_tokens;
        finish_reason = response.result.meta.finish_reason.clone();

        let mut pending = response.pending_tool_calls;
        if pending.is_empty() {
            if let Some(call) = parse_json_tool_call_fallback(&response.result.value) {
                pending.push(call);
            }
        }

        if pending.is_empty() {
            return Ok(ToolLoopOutcome {
                final_text: response.result.value,
                prompt_tokens,
                completion_tokens,
                finish_reason,
            });
        }

        messages.push(Message {
            role: Role::Assistant,
            parts: vec![MessagePart::Text {
                text: response.result.value,
            }],
            tool_call_id: None,
            tool_calls: pending.clone(),
        });

        for call in pending.drain(..) {
            let Some((slug, remote)) = parse_prefixed_tool_name(&call.name) else {
                messages.push(Message::tool_result(
                    call.id,
                    serde_json::json!({"error": format!("malformed tool name `{}`", call.name)})
                        .to_string(),
                ));
                continue;
            };

            let outcome = mcp
                .execute_mcp_tool(
                    slug,
                    remote,
                    call.arguments.clone(),
                    ToolCallSource {
                        task_id: task.id,
                        project_id: task.project_id,
                        source: "ai-loop",
                    },
                )
                .await;

            match outcome {
                Ok(result) if result.success => {
                    let content = result
                        .data
                        .map(|d| d.to_string())
                        .unwrap_or_else(|| "null".to_string());
                    messages.push(Message::tool_result(call.id, cap_chars(content, TOOL_RESULT_CHAR_CAP)));
                }
                Ok(result) => {
                    let content = serde_json::json!({ "error": result.error }).to_string();
                    messages.push(Message::tool_result(call.id, cap_chars(content, TOOL_RESULT_CHAR_CAP)));
                }
                Err(McpCallError::Permission(message)) => {
                    return Err(ExecutionError::Tool(ToolErrorDetail::PermissionDenied {
                        tool: format!("{}: {message}", call.name),
                    }));
                }
                Err(McpCallError::Other(message)) => {
                    let content = serde_json::json!({ "error": message }).to_string();
                    messages.push(Message::tool_result(call.id, cap_chars(content, TOOL_RESULT_CHAR_CAP)));
                }
            }
        }
    }

    Err(ExecutionError::Tool(ToolErrorDetail::MaxIterations {
        max_iterations: MAX_ITERATIONS,
    }))
}

fn provider_error(provider_id: Option<&str>, err: anyhow::Error) -> ExecutionError {
    ExecutionError::Provider(flowcore_types::ProviderErrorDetail::Http {
        provider: provider_id.unwrap_or("unresolved").to_string(),
        status: 0,
        message: err.to_string(),
    })
}
