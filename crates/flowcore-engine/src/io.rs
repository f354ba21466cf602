//! Default host-side collaborators for the CLI binary: a local shell
//! `ScriptExecutor`, a filesystem/network `InputProvider` and
//! `OutputProvider`, and a `McpTransport` stub used when no MCP server is
//! configured. A GUI or service host would swap all four out for its own;
//! MCP server discovery and installation are host-specific concerns the
//! core itself never touches.

use std::collections::HashMap;

use async_trait::async_trait;
use flowcore_mcp::{McpCallError, McpServerConfig, McpTransport};
use flowcore_types::{
    ExecutionError, InputMode, InputProvider, InputResponse, OutputProvider, ScriptErrorDetail,
    ScriptExecutor, ScriptLanguage, ScriptOutput, ToolDefinition,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

pub struct ShellScriptExecutor;

#[async_trait]
impl ScriptExecutor for ShellScriptExecutor {
    async fn run_script(
        &self,
        language: ScriptLanguage,
        source: &str,
        env: &HashMap<String, String>,
        signal: CancellationToken,
    ) -> Result<ScriptOutput, ExecutionError> {
        let mut command = match language {
            ScriptLanguage::Bash => {
                let mut c = Command::new("sh");
                c.args(["-c", source]);
                c
            }
            ScriptLanguage::Javascript => {
                let mut c = Command::new("node");
                c.args(["-e", source]);
                c
            }
            ScriptLanguage::Python => {
                let mut c = Command::new("python3");
                c.args(["-c", source]);
                c
            }
        };
        command.envs(env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut child = command
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| ExecutionError::Script(ScriptErrorDetail::SpawnFailed(err.to_string())))?;

        let status = tokio::select! {
            _ = signal.cancelled() => {
                let _ = child.kill().await;
                return Err(ExecutionError::Cancelled);
            }
            result = child.wait() => {
                result.map_err(|err| ExecutionError::Script(ScriptErrorDetail::SpawnFailed(err.to_string())))?
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let Some(mut out) = child.stdout.take() {
            let _ = out.read_to_string(&mut stdout).await;
        }
        if let Some(mut err) = child.stderr.take() {
            let _ = err.read_to_string(&mut stderr).await;
        }

        Ok(ScriptOutput {
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(-1),
        })
    }
}

/// Reads local files relative to the process's working directory and
/// fetches remote resources over plain HTTP GET. `request_user_input` reads
/// one line from stdin, which only makes sense for a foreground CLI run —
/// a service host would replace this with its own prompt/approval channel.
pub struct CliInputProvider;

#[async_trait]
impl InputProvider for CliInputProvider {
    async fn request_user_input(
        &self,
        prompt: &str,
        mode: InputMode,
    ) -> Result<InputResponse, ExecutionError> {
        eprintln!("{prompt}");
        let stdin = tokio::io::stdin();
        let mut lines = BufReader::new(stdin).lines();
        match lines.next_line().await {
            Ok(Some(line)) => Ok(InputResponse {
                text: Some(line),
                attachments: Vec::new(),
            }),
            Ok(None) | Err(_) if mode == InputMode::Optional => Ok(InputResponse::default()),
            _ => Err(ExecutionError::Input(flowcore_types::InputErrorDetail::Declined)),
        }
    }

    async fn read_local_file(
        &self,
        path: &str,
        accepted_extensions: &[String],
    ) -> Result<InputResponse, ExecutionError> {
        if !accepted_extensions.is_empty() {
            let matches = accepted_extensions
                .iter()
                .any(|ext| path.ends_with(ext.as_str()));
            if !matches {
                return Err(ExecutionError::Input(
                    flowcore_types::InputErrorDetail::FileNotFound(format!(
                        "{path} (extension not accepted)"
                    )),
                ));
            }
        }
        tokio::fs::read_to_string(path)
            .await
            .map(|text| InputResponse {
                text: Some(text),
                attachments: Vec::new(),
            })
            .map_err(|_| ExecutionError::Input(flowcore_types::InputErrorDetail::FileNotFound(path.to_string())))
    }

    async fn fetch_remote_resource(&self, url: &str) -> Result<InputResponse, ExecutionError> {
        let fetch = async {
            let resp = reqwest::get(url).await?.error_for_status()?;
            resp.text().await
        };
        let body = fetch.await.map_err(|err| {
            ExecutionError::Input(flowcore_types::InputErrorDetail::RemoteFetchFailed(err.to_string()))
        })?;
        Ok(InputResponse {
            text: Some(body),
            attachments: Vec::new(),
        })
    }
}

pub struct CliOutputProvider;

#[async_trait]
impl OutputProvider for CliOutputProvider {
    async fn write_file(&self, path: &str, content: &str) -> Result<(), ExecutionError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(path, content)
            .await
            .map_err(|err| ExecutionError::Output(flowcore_types::OutputErrorDetail::WriteFailed(err.to_string())))
    }

    async fn send_notification(&self, channel: &str, body: &str) -> Result<(), ExecutionError> {
        println!("[notify:{channel}] {body}");
        Ok(())
    }

    async fn post_http(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        body: &str,
    ) -> Result<(), ExecutionError> {
        let client = reqwest::Client::new();
        let mut request = client.post(url).body(body.to_string());
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().await.map_err(|err| {
            ExecutionError::Output(flowcore_types::OutputErrorDetail::Http {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                message: err.to_string(),
            })
        })?;
        if let Err(err) = response.error_for_status_ref() {
            return Err(ExecutionError::Output(flowcore_types::OutputErrorDetail::Http {
                status: err.status().map(|s| s.as_u16()).unwrap_or(0),
                message: err.to_string(),
            }));
        }
        Ok(())
    }
}

/// Used when a workflow declares no `required_mcps` and the config has no
/// servers configured, so the binary still runs without a real transport
/// wired up, since MCP server discovery/installation is host-specific.
pub struct NullMcpTransport;

#[async_trait]
impl McpTransport for NullMcpTransport {
    async fn list_tools(&self, _server: &McpServerConfig) -> anyhow::Result<Vec<ToolDefinition>> {
        Ok(Vec::new())
    }

    async fn call_tool(
        &self,
        server: &McpServerConfig,
        _tool_name: &str,
        _args: Value,
        _env_overrides: &serde_json::Map<String, Value>,
    ) -> Result<Value, McpCallError> {
        Err(McpCallError::Other(format!(
            "no MCP transport configured for server '{}'",
            server.id
        )))
    }
}
