//! MCP requirement detection and context pre-flight.

use chrono::{Duration, Utc};
use flowcore_mcp::{normalize_slug, McpFacade, ToolCallSource};
use flowcore_types::{MCPContextInsight, Task};
use regex::Regex;
use std::sync::OnceLock;

/// Fixed keyword table consulted only when a task declares no explicit
/// `requiredMCPs`. An explicit list is never extended by auto-detection.
const AUTO_DETECT_KEYWORDS: &[(&str, &[&str])] = &[
    ("slack", &["slack", "channel", "dm"]),
    ("github", &["github", "pull request", "pr #", "issue #", "repo"]),
    ("filesystem", &["file", "directory", "folder", "path"]),
    ("database", &["database", "sql", "query", "table row"]),
    ("web", &["website", "web page", "url", "http"]),
    ("email", &["email", "inbox", "mailbox"]),
];

/// Returns the MCP slugs a task requires: the explicit list if non-empty,
/// otherwise whatever the keyword scan over title/description/prompt
/// surfaces.
pub fn required_mcps(task: &Task) -> Vec<String> {
    if !task.required_mcps.is_empty() {
        return task.required_mcps.clone();
    }

    let haystack = format!(
        "{} {} {}",
        task.title,
        task.description.as_deref().unwrap_or_default(),
        task.effective_prompt()
    )
    .to_ascii_lowercase();

    AUTO_DETECT_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| haystack.contains(kw)))
        .map(|(slug, _)| slug.to_string())
        .collect()
}

/// Resolves each required MCP, lists its tools, and runs a best-effort
/// "describe" pre-flight so the prompt assembly step can surface live
/// context instead of a bare tool list. Errors are captured into the
/// returned insight, never propagated.
pub async fn preflight_insights(
    mcp: &McpFacade,
    task: &Task,
    required: &[String],
) -> Vec<MCPContextInsight> {
    let mut insights = Vec::with_capacity(required.len());

    for slug in required {
        let Some(server) = mcp.find_mcp_by_name(slug).await else {
            insights.push(MCPContextInsight {
                name: slug.clone(),
                description: None,
                endpoint: None,
                recommended_tools: Vec::new(),
                sample_output: None,
                error: Some(format!("no MCP server configured for `{slug}`")),
                user_context: None,
                env_vars: Default::default(),
            });
            continue;
        };

        match mcp.list_tools(&server.id, task.id).await {
            Ok(tools) => {
                let recommended_tools: Vec<String> =
                    tools.iter().map(|t| t.name.clone()).collect();
                let sample_output = if normalize_slug(&server.id) == "slack" {
                    slack_channel_history_preflight(mcp, &server.id, task, &recommended_tools)
                        .await
                        .or(describe_preflight(mcp, &server.id, task, &recommended_tools).await)
                } else {
                    describe_preflight(mcp, &server.id, task, &recommended_tools).await
                };
                insights.push(MCPContextInsight {
                    name: server.name.clone(),
                    description: Some(format!("MCP server `{}` at {}", server.name, server.endpoint)),
                    endpoint: Some(server.endpoint.clone()),
                    recommended_tools,
                    sample_output,
                    error: None,
                    user_context: None,
                    env_vars: server.env.clone(),
                });
            }
            Err(err) => insights.push(MCPContextInsight {
                name: server.name.clone(),
                description: None,
                endpoint: Some(server.endpoint.clone()),
                recommended_tools: Vec::new(),
                sample_output: None,
                error: Some(err.to_string()),
                user_context: None,
                env_vars: Default::default(),
            }),
        }
    }

    insights
}

/// Best-effort "describe"/"summary" pre-flight call: if the server exposes
/// an obviously descriptive tool, call it with empty arguments and surface
/// whatever it returns as a sample. Never fails the pre-flight.
async fn describe_preflight(
    mcp: &McpFacade,
    server_id: &str,
    task: &Task,
    tools: &[String],
) -> Option<serde_json::Value> {
    let describe_tool = tools.iter().find(|name| {
        let lower = name.to_ascii_lowercase();
        lower.contains("describe") || lower.contains("summary") || lower.contains("list_channels")
    })?;

    let outcome = mcp
        .execute_mcp_tool(
            server_id,
            describe_tool,
            serde_json::json!({}),
            ToolCallSource {
                task_id: task.id,
                project_id: task.project_id,
                source: "preflight",
            },
        )
        .await
        .ok()?;

    if outcome.success {
        outcome.data
    } else {
        Some(serde_json::json!({ "ok": false, "error": outcome.error }))
    }
}

fn channel_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // No trailing `\b`: Korean particles (e.g. "...123456의") attach directly
    // to the id with no separator, and since both the last id character and
    // the following Hangul syllable are Unicode word characters there is no
    // boundary between them to anchor on. The `[A-Z0-9]` class itself stops
    // the match at the first non-matching character, so it isn't needed.
    RE.get_or_init(|| Regex::new(r"\b([CGD][A-Z0-9]{7,})").expect("static regex"))
}

fn relative_hours_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Matches "24 hours"/"24h" as well as Korean "24시간".
    RE.get_or_init(|| Regex::new(r"(\d+)\s*(?:hours?|hrs?|h\b|시간)").expect("static regex"))
}

/// Extracts a Slack channel id (`C`/`G`/`D`-prefixed) from a task's own
/// text, if one is named.
fn extract_channel_id(haystack: &str) -> Option<String> {
    channel_id_regex()
        .captures(haystack)
        .map(|caps| caps[1].to_string())
}

/// Extracts a relative lookback window ("last 24 hours", "지난 24시간") from
/// a task's own text, defaulting to 24 hours when a channel is named but no
/// explicit window is.
fn extract_lookback_hours(haystack: &str) -> i64 {
    relative_hours_regex()
        .captures(haystack)
        .and_then(|caps| caps[1].parse::<i64>().ok())
        .unwrap_or(24)
}

/// Service-specific pre-flight for the Slack MCP (S4): when the task names
/// a channel id, derive `channelId`/`oldest`/`limit` from the prompt and
/// call a channel-history tool directly, rather than falling back to the
/// generic `describe_preflight`'s empty-args call.
async fn slack_channel_history_preflight(
    mcp: &McpFacade,
    server_id: &str,
    task: &Task,
    tools: &[String],
) -> Option<serde_json::Value> {
    let haystack = format!(
        "{} {} {}",
        task.title,
        task.description.as_deref().unwrap_or_default(),
        task.effective_prompt()
    );
    let channel_id = extract_channel_id(&haystack)?;
    let hours = extract_lookback_hours(&haystack);

    let history_tool = tools.iter().find(|name| {
        let lower = name.to_ascii_lowercase();
        lower.contains("history") || lower.contains("messages")
    })?;

    let oldest = (Utc::now() - Duration::hours(hours)).timestamp();
    let args = serde_json::json!({
        "channelId": channel_id,
        "oldest": oldest.to_string(),
        "limit": 200,
    });

    let outcome = mcp
        .execute_mcp_tool(
            server_id,
            history_tool,
            args,
            ToolCallSource {
                task_id: task.id,
                project_id: task.project_id,
                source: "preflight",
            },
        )
        .await
        .ok()?;

    if outcome.success {
        outcome.data
    } else {
        Some(serde_json::json!({ "ok": false, "error": outcome.error }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flowcore_mcp::{McpCallError, McpFacade, McpServerConfig, McpTransport};
    use flowcore_types::{Priority, TaskKind, TaskStatus, TriggerConfig};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn task_with(title: &str, description: Option<&str>, required: Vec<String>) -> Task {
        Task {
            id: 1,
            project_id: 1,
            project_sequence: 1,
            title: title.to_string(),
            description: description.map(|d| d.to_string()),
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            task_type: TaskKind::Ai,
            dependencies: Default::default(),
            trigger_config: TriggerConfig::default(),
            ai_provider: None,
            ai_model: None,
            ai_temperature: None,
            ai_max_tokens: None,
            ai_prompt: None,
            generated_prompt: None,
            expected_output_format: None,
            code_language: None,
            required_mcps: required,
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
    fn explicit_list_is_never_extended_by_auto_detect() {
        let task = task_with("Post to #general", None, vec!["github".to_string()]);
        assert_eq!(required_mcps(&task), vec!["github".to_string()]);
    }

    #[test]
    fn auto_detect_scans_title_and_description_when_list_is_empty() {
        let task = task_with("Summarize the #general channel", Some("check Slack history"), vec![]);
        assert_eq!(required_mcps(&task), vec!["slack".to_string()]);
    }

    #[test]
    fn auto_detect_can_surface_multiple_slugs() {
        let task = task_with(
            "Open a pull request and notify the team on Slack",
            None,
            vec![],
        );
        let mut detected = required_mcps(&task);
        detected.sort();
        assert_eq!(detected, vec!["github".to_string(), "slack".to_string()]);
    }

    #[test]
    fn extracts_slack_channel_id_and_relative_korean_timeframe() {
        let prompt = "채널 C08AB123456의 최근 24시간 메시지를 요약해줘";
        assert_eq!(extract_channel_id(prompt), Some("C08AB123456".to_string()));
        assert_eq!(extract_lookback_hours(prompt), 24);
    }

    #[test]
    fn extracts_english_relative_timeframe() {
        let prompt = "summarize channel C01234567 over the last 48 hours";
        assert_eq!(extract_channel_id(prompt), Some("C01234567".to_string()));
        assert_eq!(extract_lookback_hours(prompt), 48);
    }

    #[test]
    fn no_channel_id_means_no_channel_history_preflight_input() {
        assert_eq!(extract_channel_id("summarize the general discussion"), None);
    }

    #[test]
    fn missing_explicit_window_defaults_to_24_hours() {
        let prompt = "summarize channel C01234567";
        assert_eq!(extract_lookback_hours(prompt), 24);
    }

    struct RecordingTransport {
        calls: Arc<Mutex<Vec<(String, serde_json::Value)>>>,
    }

    #[async_trait]
    impl McpTransport for RecordingTransport {
        async fn list_tools(
            &self,
            _server: &McpServerConfig,
        ) -> anyhow::Result<Vec<flowcore_types::ToolDefinition>> {
            Ok(vec![flowcore_types::ToolDefinition {
                name: "slack_history".to_string(),
                description: Some("fetch channel history".to_string()),
                parameters_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call_tool(
            &self,
            _server: &McpServerConfig,
            tool_name: &str,
            args: serde_json::Value,
            _env_overrides: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<serde_json::Value, McpCallError> {
            self.calls.lock().await.push((tool_name.to_string(), args));
            Ok(serde_json::json!({"messages": []}))
        }
    }

    #[tokio::test]
    async fn preflight_calls_slack_history_with_derived_channel_and_window() {
        let calls: Arc<Mutex<Vec<(String, serde_json::Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let facade = McpFacade::new(Arc::new(RecordingTransport { calls: calls.clone() }));
        facade
            .set_runtime_servers(vec![McpServerConfig::new("slack-mcp", "Slack MCP", "stdio:slack")])
            .await;

        let task = task_with(
            "채널 C08AB123456의 최근 24시간 메시지를 요약해줘",
            None,
            vec!["slack".to_string()],
        );

        let insights = preflight_insights(&facade, &task, &["slack".to_string()]).await;
        assert_eq!(insights.len(), 1);
        assert!(insights[0].error.is_none());
        assert!(insights[0].sample_output.is_some());

        let recorded = calls.lock().await;
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].0, "slack_history");
        assert_eq!(recorded[0].1["channelId"], "C08AB123456");
        assert_eq!(recorded[0].1["limit"], 200);
        assert!(recorded[0].1["oldest"].is_string());
    }

    #[tokio::test]
    async fn preflight_skips_channel_history_when_no_channel_named() {
        let calls: Arc<Mutex<Vec<(String, serde_json::Value)>>> = Arc::new(Mutex::new(Vec::new()));
        let facade = McpFacade::new(Arc::new(RecordingTransport { calls: calls.clone() }));
        facade
            .set_runtime_servers(vec![McpServerConfig::new("slack-mcp", "Slack MCP", "stdio:slack")])
            .await;

        let task = task_with("summarize recent team activity", None, vec!["slack".to_string()]);

        let insights = preflight_insights(&facade, &task, &["slack".to_string()]).await;
        assert_eq!(insights.len(), 1);
        assert!(insights[0].error.is_none());
        // Neither the channel-history pre-flight (no channel id to derive
        // args from) nor the generic describe pre-flight (no
        // describe/summary/list_channels-named tool offered) has anything
        // to call, so no tool call is made and no sample is captured.
        assert!(insights[0].sample_output.is_none());
        assert!(calls.lock().await.is_empty());
    }
}
