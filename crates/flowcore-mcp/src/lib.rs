//! Uniform facade over whatever MCP servers are configured for a workflow.
//! The facade does not speak any particular wire protocol itself — it
//! delegates to an injected [`McpTransport`] external collaborator and adds
//! a policy layer on top: slug normalization, task-scoped config overrides,
//! and per-task serialization of concurrent tool calls.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use flowcore_types::{McpOverride, ToolDefinition};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone)]
pub struct McpServerConfig {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    pub env: serde_json::Map<String, Value>,
}

impl McpServerConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        McpServerConfig {
            id: id.into(),
            name: name.into(),
            endpoint: endpoint.into(),
            env: serde_json::Map::new(),
        }
    }
}

/// Strips a trailing `-mcp`/`-server` suffix and lowercases.
pub fn normalize_slug(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    lower
        .strip_suffix("-mcp")
        .or_else(|| lower.strip_suffix("-server"))
        .unwrap_or(&lower)
        .to_string()
}

#[derive(Debug, Clone)]
pub struct ToolInvocationOutcome {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum McpCallError {
    #[error("permission denied: {0}")]
    Permission(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy)]
pub struct ToolCallSource<'a> {
    pub task_id: i64,
    pub project_id: i64,
    pub source: &'a str,
}

/// The actual wire transport to MCP servers — supplied by the host
/// application; connection establishment, auth, and the underlying
/// protocol are all out of scope for this core.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn list_tools(&self, server: &McpServerConfig) -> anyhow::Result<Vec<ToolDefinition>>;
    async fn call_tool(
        &self,
        server: &McpServerConfig,
        tool_name: &str,
        args: Value,
        env_overrides: &serde_json::Map<String, Value>,
    ) -> Result<Value, McpCallError>;
}

/// Facade consumed by the AI Service Manager. Holds no tool-calling
/// logic of its own; its job is config layering, naming, and
/// per-task serialization.
pub struct McpFacade {
    transport: Arc<dyn McpTransport>,
    servers: Arc<RwLock<HashMap<String, McpServerConfig>>>,
    task_overrides: Arc<RwLock<HashMap<i64, HashMap<String, McpOverride>>>>,
    task_locks: Arc<Mutex<HashMap<i64, Arc<Mutex<()>>>>>,
}

impl McpFacade {
    pub fn new(transport: Arc<dyn McpTransport>) -> Self {
        McpFacade {
            transport,
            servers: Arc::new(RwLock::new(HashMap::new())),
            task_overrides: Arc::new(RwLock::new(HashMap::new())),
            task_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn set_runtime_servers(&self, servers: Vec<McpServerConfig>) {
        let mut guard = self.servers.write().await;
        guard.clear();
        for server in servers {
            guard.insert(normalize_slug(&server.id), server);
        }
    }

    pub async fn list_mcps(&self) -> Vec<McpServerConfig> {
        self.servers.read().await.values().cloned().collect()
    }

    pub async fn find_mcp_by_name(&self, slug_or_name: &str) -> Option<McpServerConfig> {
        let slug = normalize_slug(slug_or_name);
        let guard = self.servers.read().await;
        guard
            .get(&slug)
            .cloned()
            .or_else(|| guard.values().find(|s| normalize_slug(&s.name) == slug).cloned())
    }

    pub async fn set_task_overrides(&self, task_id: i64, overrides: HashMap<String, McpOverride>) {
        self.task_overrides.write().await.insert(task_id, overrides);
    }

    pub async fn clear_task_overrides(&self, task_id: i64) {
        self.task_overrides.write().await.remove(&task_id);
    }

    pub async fn list_tools(&self, mcp_id: &str, task_id: i64) -> anyhow::Result<Vec<ToolDefinition>> {
        let server = self.resolve_server(mcp_id).await?;
        let _ = task_id; // listing does not touch per-task state, kept for symmetry with executeMCPTool
        self.transport.list_tools(&server).await
    }

    /// Serializes concurrent calls for the same `taskId` at the MCP
    /// boundary: acquires a per-task lock before
    /// delegating to the transport, so two tool calls issued by the same
    /// AI loop never interleave against a stateful MCP session.
    ///
    /// Permission errors are re-raised (`Err`); every other transport
    /// error is captured into the returned outcome so the AI loop can see
    /// it as tool output.
    pub async fn execute_mcp_tool(
        &self,
        mcp_id: &str,
        tool_name: &str,
        args: Value,
        call: ToolCallSource<'_>,
    ) -> Result<ToolInvocationOutcome, McpCallError> {
        let server = self
            .resolve_server(mcp_id)
            .await
            .map_err(|e| McpCallError::Other(e.to_string()))?;

        let lock = self.task_lock(call.task_id).await;
        let _guard = lock.lock().await;

        let env_overrides = self.effective_env(call.task_id, &server.id).await;

        let started = Instant::now();
        let outcome = self
            .transport
            .call_tool(&server, tool_name, args, &env_overrides)
            .await;
        let execution_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => Ok(ToolInvocationOutcome {
                success: true,
                data: Some(data),
                error: None,
                execution_time_ms,
            }),
            Err(McpCallError::Permission(message)) => Err(McpCallError::Permission(message)),
            Err(McpCallError::Other(message)) => Ok(ToolInvocationOutcome {
                success: false,
                data: None,
                error: Some(message),
                execution_time_ms,
            }),
        }
    }

    async fn resolve_server(&self, mcp_id: &str) -> anyhow::Result<McpServerConfig> {
        self.find_mcp_by_name(mcp_id)
            .await
            .ok_or_else(|| anyhow::anyhow!("unknown MCP server: {mcp_id}"))
    }

    async fn task_lock(&self, task_id: i64) -> Arc<Mutex<()>> {
        let mut guard = self.task_locks.lock().await;
        guard.entry(task_id).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Task overrides layer over project-level config shallowly per
    /// server id (task wins entirely for a given server).
    async fn effective_env(
        &self,
        task_id: i64,
        server_id: &str,
    ) -> serde_json::Map<String, Value> {
        let overrides = self.task_overrides.read().await;
        if let Some(task_override) = overrides
            .get(&task_id)
            .and_then(|by_server| by_server.get(server_id))
        {
            task_override.env.clone()
        } else {
            serde_json::Map::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTransport {
        calls: Arc<AtomicUsize>,
        fail_as_permission: bool,
    }

    #[async_trait]
    impl McpTransport for RecordingTransport {
        async fn list_tools(&self, _server: &McpServerConfig) -> anyhow::Result<Vec<ToolDefinition>> {
            Ok(vec![ToolDefinition {
                name: "history".to_string(),
                description: Some("fetch history".to_string()),
                parameters_schema: serde_json::json!({"type": "object"}),
            }])
        }

        async fn call_tool(
            &self,
            _server: &McpServerConfig,
            _tool_name: &str,
            _args: Value,
            _env_overrides: &serde_json::Map<String, Value>,
        ) -> Result<Value, McpCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_as_permission {
                return Err(McpCallError::Permission("not allowed".to_string()));
            }
            Ok(serde_json::json!({"ok": true}))
        }
    }

    #[test]
    fn normalize_slug_strips_suffix_and_lowercases() {
        assert_eq!(normalize_slug("Slack-MCP"), "slack");
        assert_eq!(normalize_slug("github-server"), "github");
        assert_eq!(normalize_slug("filesystem"), "filesystem");
    }

    #[tokio::test]
    async fn execute_mcp_tool_captures_non_permission_errors() {
        struct FailingTransport;
        #[async_trait]
        impl McpTransport for FailingTransport {
            async fn list_tools(&self, _server: &McpServerConfig) -> anyhow::Result<Vec<ToolDefinition>> {
                Ok(vec![])
            }
            async fn call_tool(
                &self,
                _server: &McpServerConfig,
                _tool_name: &str,
                _args: Value,
                _env_overrides: &serde_json::Map<String, Value>,
            ) -> Result<Value, McpCallError> {
                Err(McpCallError::Other("upstream 500".to_string()))
            }
        }
        let facade = McpFacade::new(Arc::new(FailingTransport));
        facade
            .set_runtime_servers(vec![McpServerConfig::new("slack-mcp", "Slack", "stdio:slack")])
            .await;
        let outcome = facade
            .execute_mcp_tool(
                "slack",
                "history",
                serde_json::json!({}),
                ToolCallSource {
                    task_id: 1,
                    project_id: 1,
                    source: "ai-loop",
                },
            )
            .await
            .expect("captured, not raised");
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("upstream 500"));
    }

    #[tokio::test]
    async fn execute_mcp_tool_reraises_permission_errors() {
        let facade = McpFacade::new(Arc::new(RecordingTransport {
            calls: Arc::new(AtomicUsize::new(0)),
            fail_as_permission: true,
        }));
        facade
            .set_runtime_servers(vec![McpServerConfig::new("slack-mcp", "Slack", "stdio:slack")])
            .await;
        let result = facade
            .execute_mcp_tool(
                "slack",
                "history",
                serde_json::json!({}),
                ToolCallSource {
                    task_id: 1,
                    project_id: 1,
                    source: "ai-loop",
                },
            )
            .await;
        assert!(matches!(result, Err(McpCallError::Permission(_))));
    }

    #[tokio::test]
    async fn task_overrides_layer_shallowly_over_defaults() {
        let calls = Arc::new(AtomicUsize::new(0));
        let facade = McpFacade::new(Arc::new(RecordingTransport {
            calls: calls.clone(),
            fail_as_permission: false,
        }));
        facade
            .set_runtime_servers(vec![McpServerConfig::new("slack-mcp", "Slack", "stdio:slack")])
            .await;
        let mut overrides = HashMap::new();
        let mut env = serde_json::Map::new();
        env.insert("SLACK_CHANNEL_IDS".to_string(), serde_json::json!("C1"));
        overrides.insert(
            "slack".to_string(),
            McpOverride {
                env: env.clone(),
                context: Default::default(),
            },
        );
        facade.set_task_overrides(5, overrides).await;
        let effective = facade.effective_env(5, "slack").await;
        assert_eq!(effective, env);
        facade.clear_task_overrides(5).await;
        assert!(facade.effective_env(5, "slack").await.is_empty());
    }

    #[tokio::test]
    async fn concurrent_calls_for_same_task_are_serialized() {
        let calls = Arc::new(AtomicUsize::new(0));
        let facade = Arc::new(McpFacade::new(Arc::new(RecordingTransport {
            calls: calls.clone(),
            fail_as_permission: false,
        })));
        facade
            .set_runtime_servers(vec![McpServerConfig::new("slack-mcp", "Slack", "stdio:slack")])
            .await;

        let mut handles = Vec::new();
        for _ in 0..5 {
            let facade = facade.clone();
            handles.push(tokio::spawn(async move {
                facade
                    .execute_mcp_tool(
                        "slack",
                        "history",
                        serde_json::json!({}),
                        ToolCallSource {
                            task_id: 9,
                            project_id: 1,
                            source: "ai-loop",
                        },
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            let outcome = handle.await.unwrap();
            assert!(outcome.success);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
