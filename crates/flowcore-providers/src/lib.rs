//! Provider registry and clients: a uniform `Provider` trait wraps
//! each upstream chat API and normalizes its output onto
//! `flowcore_types::AiResult`. The registry resolves a provider by id,
//! falling back to a configured default and then to the first configured
//! provider, mirroring the resolution order the AI Service Manager
//! expects when a task names no explicit provider.

use std::collections::HashMap;
use std::sync::Arc;
use std::{pin::Pin, str};

use async_stream::try_stream;
use async_trait::async_trait;
use flowcore_types::{AiResult, AiResultMeta, Message, MessagePart, ModelInfo, Role, ToolCall, ToolDefinition};
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    pub default_provider: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCallStart { id: String, name: String },
    ToolCallDelta { id: String, args_delta: String },
    ToolCallEnd { id: String },
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Result of one non-streaming `Provider::execute` call: the normalized
/// result plus any tool calls the model asked to make. A response with
/// `pending_tool_calls` non-empty carries no meaningful `result.value` text
/// and is meant to be fed back into the tool loop, not shown to a
/// user.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub result: AiResult,
    pub pending_tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    async fn execute(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ProviderResponse>;

    async fn stream_execute(
        &self,
        messages: Vec<Message>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolDefinition>>,
        _cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        let response = self
            .execute(&messages, model_override, tools.as_deref())
            .await?;
        let usage = Some(TokenUsage {
            prompt_tokens: response.result.meta.prompt_tokens,
            completion_tokens: response.result.meta.completion_tokens,
            total_tokens: response.result.meta.prompt_tokens + response.result.meta.completion_tokens,
        });
        let mut chunks = Vec::new();
        if !response.result.value.is_empty() {
            chunks.push(Ok(StreamChunk::TextDelta(response.result.value)));
        }
        for call in response.pending_tool_calls {
            chunks.push(Ok(StreamChunk::ToolCallStart {
                id: call.id.clone(),
                name: call.name,
            }));
            chunks.push(Ok(StreamChunk::ToolCallDelta {
                id: call.id.clone(),
                args_delta: call.arguments.to_string(),
            }));
            chunks.push(Ok(StreamChunk::ToolCallEnd { id: call.id }));
        }
        chunks.push(Ok(StreamChunk::Done {
            finish_reason: response
                .result
                .meta
                .finish_reason
                .clone()
                .unwrap_or_else(|| "stop".to_string()),
            usage,
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn generate_image(&self, _prompt: &str, _model_override: Option<&str>) -> anyhow::Result<AiResult> {
        anyhow::bail!("{} does not support image generation", self.info().id)
    }

    /// Token estimate over the textual parts of `messages` only, plus a
    /// fixed per-image surcharge pulled from model
    /// metadata, so base64 image payloads never inflate the count.
    fn estimate_tokens(&self, messages: &[Message], model_override: Option<&str>) -> u64 {
        estimate_tokens_default(messages, self.model_info(model_override).as_ref())
    }

    fn calculate_cost(&self, model: &ModelInfo, prompt_tokens: u64, completion_tokens: u64) -> f64 {
        (prompt_tokens as f64 / 1000.0) * model.prompt_cost_per_1k
            + (completion_tokens as f64 / 1000.0) * model.completion_cost_per_1k
    }

    fn model_info(&self, model_override: Option<&str>) -> Option<ModelInfo> {
        let info = self.info();
        match model_override {
            Some(id) => info.models.into_iter().find(|m| m.name == id),
            None => info.models.into_iter().next(),
        }
    }
}

pub fn estimate_tokens_default(messages: &[Message], model: Option<&ModelInfo>) -> u64 {
    let char_count: usize = messages.iter().map(|m| m.text_content().chars().count()).sum();
    let text_tokens = ((char_count as f64) / 4.0).ceil() as u64;
    let image_count: u64 = messages.iter().map(|m| m.image_count() as u64).sum();
    let surcharge = model.and_then(|m| m.image_token_surcharge).unwrap_or(765);
    text_tokens + image_count * surcharge
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
    config: Arc<RwLock<AppConfig>>,
}

impl ProviderRegistry {
    pub fn new(config: AppConfig) -> Self {
        let providers = build_providers(&config);
        Self {
            providers: Arc::new(RwLock::new(providers)),
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn reload(&self, config: AppConfig) {
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
        *self.config.write().await = config;
    }

    pub async fn set_api_key(&self, provider_id: &str, api_key: impl Into<String>) {
        let mut config = self.config.write().await;
        config
            .providers
            .entry(provider_id.to_string())
            .or_default()
            .api_key = Some(api_key.into());
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
    }

    pub async fn configure(&self, provider_id: &str, entry: ProviderConfig) {
        let mut config = self.config.write().await;
        config.providers.insert(provider_id.to_string(), entry);
        let rebuilt = build_providers(&config);
        *self.providers.write().await = rebuilt;
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers.read().await.iter().map(|p| p.info()).collect()
    }

    pub async fn fetch_models(&self, provider_id: Option<&str>) -> anyhow::Result<Vec<ModelInfo>> {
        Ok(self.select_provider(provider_id).await?.info().models)
    }

    pub async fn execute(
        &self,
        provider_id: Option<&str>,
        messages: &[Message],
        model_id: Option<&str>,
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ProviderResponse> {
        self.select_provider(provider_id)
            .await?
            .execute(messages, model_id, tools)
            .await
    }

    pub async fn stream_execute(
        &self,
        provider_id: Option<&str>,
        messages: Vec<Message>,
        model_id: Option<&str>,
        tools: Option<Vec<ToolDefinition>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        self.select_provider(provider_id)
            .await?
            .stream_execute(messages, model_id, tools, cancel)
            .await
    }

    pub async fn generate_image(
        &self,
        provider_id: Option<&str>,
        prompt: &str,
        model_id: Option<&str>,
    ) -> anyhow::Result<AiResult> {
        self.select_provider(provider_id)
            .await?
            .generate_image(prompt, model_id)
            .await
    }

    pub async fn estimate_tokens(
        &self,
        provider_id: Option<&str>,
        messages: &[Message],
        model_id: Option<&str>,
    ) -> anyhow::Result<u64> {
        Ok(self
            .select_provider(provider_id)
            .await?
            .estimate_tokens(messages, model_id))
    }

    pub async fn calculate_cost(
        &self,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> anyhow::Result<f64> {
        let provider = self.select_provider(provider_id).await?;
        let model = provider
            .model_info(model_id)
            .ok_or_else(|| anyhow::anyhow!("no model metadata available for cost calculation"))?;
        Ok(provider.calculate_cost(&model, prompt_tokens, completion_tokens))
    }

    async fn select_provider(&self, provider_id: Option<&str>) -> anyhow::Result<Arc<dyn Provider>> {
        let providers = self.providers.read().await;
        let available = providers.iter().map(|p| p.info().id).collect::<Vec<_>>();

        if let Some(id) = provider_id {
            if let Some(provider) = providers.iter().find(|p| p.info().id == id) {
                return Ok(provider.clone());
            }
            anyhow::bail!(
                "provider `{}` is not configured. configured providers: {}",
                id,
                available.join(", ")
            );
        };

        let configured_default = self.config.read().await.default_provider.clone();
        if let Some(default_id) = configured_default {
            if let Some(provider) = providers.iter().find(|p| p.info().id == default_id) {
                return Ok(provider.clone());
            }
        };

        let Some(provider) = providers.first() else {
            anyhow::bail!("No provider configured.");
        };
        Ok(provider.clone())
    }
}

fn build_providers(config: &AppConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    add_openai_provider(
        config,
        &mut providers,
        "ollama",
        "Ollama",
        "http://127.0.0.1:11434/v1",
        "llama3.1:8b",
        false,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openai",
        "OpenAI",
        "https://api.openai.com/v1",
        "gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "openrouter",
        "OpenRouter",
        "https://openrouter.ai/api/v1",
        "openai/gpt-4o-mini",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "groq",
        "Groq",
        "https://api.groq.com/openai/v1",
        "llama-3.1-8b-instant",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "mistral",
        "Mistral",
        "https://api.mistral.ai/v1",
        "mistral-small-latest",
        true,
    );
    add_openai_provider(
        config,
        &mut providers,
        "together",
        "Together",
        "https://api.together.xyz/v1",
        "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        true,
    );

    if let Some(anthropic) = config.providers.get("anthropic") {
        providers.push(Arc::new(AnthropicProvider {
            api_key: anthropic
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(str::to_string)
                .or_else(|| env_var_nonempty("ANTHROPIC_API_KEY")),
            default_model: anthropic
                .default_model
                .clone()
                .unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string()),
            client: Client::new(),
        }));
    }
    if let Some(cohere) = config.providers.get("cohere") {
        providers.push(Arc::new(CohereProvider {
            api_key: cohere
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(str::to_string)
                .or_else(|| env_var_nonempty("COHERE_API_KEY")),
            base_url: normalize_plain_base(cohere.url.as_deref().unwrap_or("https://api.cohere.com/v2")),
            default_model: cohere
                .default_model
                .clone()
                .unwrap_or_else(|| "command-r-plus".to_string()),
            client: Client::new(),
        }));
    }

    if providers.is_empty() {
        providers.push(Arc::new(LocalEchoProvider));
    }

    providers
}

fn add_openai_provider(
    config: &AppConfig,
    providers: &mut Vec<Arc<dyn Provider>>,
    id: &str,
    name: &str,
    default_url: &str,
    default_model: &str,
    use_api_key: bool,
) {
    let Some(entry) = config.providers.get(id) else {
        return;
    };
    providers.push(Arc::new(OpenAICompatibleProvider {
        id: id.to_string(),
        name: name.to_string(),
        base_url: normalize_base(entry.url.as_deref().unwrap_or(default_url)),
        api_key: if use_api_key {
            entry
                .api_key
                .as_deref()
                .filter(|key| !is_placeholder_api_key(key))
                .map(str::to_string)
                .or_else(|| env_api_key_for_provider(id))
        } else {
            None
        },
        default_model: entry.default_model.clone().unwrap_or_else(|| default_model.to_string()),
        client: Client::new(),
    }));
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("x") || trimmed.eq_ignore_ascii_case("placeholder")
}

fn env_var_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_api_key_for_provider(id: &str) -> Option<String> {
    let env_name = match id {
        "openai" => "OPENAI_API_KEY",
        "openrouter" => "OPENROUTER_API_KEY",
        "groq" => "GROQ_API_KEY",
        "mistral" => "MISTRAL_API_KEY",
        "together" => "TOGETHER_API_KEY",
        _ => return None,
    };
    env_var_nonempty(env_name)
}

/// Renders a message onto the OpenAI chat-completion wire shape. Messages
/// carrying only text collapse to a plain string `content`; messages with
/// image parts use the multi-part content array so vision-capable models
/// still receive the image.
fn message_to_openai_json(message: &Message) -> serde_json::Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };

    let mut value = if message.parts.iter().all(|p| matches!(p, MessagePart::Text { .. })) {
        json!({ "role": role, "content": message.text_content() })
    } else {
        let parts: Vec<serde_json::Value> = message
            .parts
            .iter()
            .map(|part| match part {
                MessagePart::Text { text } => json!({ "type": "text", "text": text }),
                MessagePart::Image { url_or_base64, mime } => {
                    let url = if url_or_base64.starts_with("data:") || url_or_base64.starts_with("http") {
                        url_or_base64.clone()
                    } else {
                        format!("data:{mime};base64,{url_or_base64}")
                    };
                    json!({ "type": "image_url", "image_url": { "url": url } })
                }
            })
            .collect();
        json!({ "role": role, "content": parts })
    };

    if let Some(tool_call_id) = &message.tool_call_id {
        value["tool_call_id"] = json!(tool_call_id);
    }
    if !message.tool_calls.is_empty() {
        value["tool_calls"] = json!(message
            .tool_calls
            .iter()
            .map(|call| json!({
                "id": call.id,
                "type": "function",
                "function": { "name": call.name, "arguments": call.arguments.to_string() },
            }))
            .collect::<Vec<_>>());
    }
    value
}

fn tool_definition_to_openai(tool: &ToolDefinition) -> serde_json::Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters_schema,
        }
    })
}

fn extract_tool_calls(value: &serde_json::Value) -> Vec<ToolCall> {
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("tool_calls"))
        .and_then(|v| v.as_array())
        .map(|calls| {
            calls
                .iter()
                .filter_map(|call| {
                    let id = call.get("id")?.as_str()?.to_string();
                    let function = call.get("function")?;
                    let name = function.get("name")?.as_str()?.to_string();
                    let arguments = function
                        .get("arguments")
                        .and_then(|v| v.as_str())
                        .and_then(|s| serde_json::from_str(s).ok())
                        .unwrap_or(serde_json::Value::Null);
                    Some(ToolCall { id, name, arguments })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_finish_reason(value: &serde_json::Value) -> Option<String> {
    value
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("finish_reason"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

struct LocalEchoProvider;

#[async_trait]
impl Provider for LocalEchoProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "local".to_string(),
            name: "Local Echo".to_string(),
            models: vec![ModelInfo {
                name: "echo-1".to_string(),
                supports_tools: false,
                supports_streaming: true,
                supports_vision: false,
                is_image_model: false,
                context_window: Some(8192),
                prompt_cost_per_1k: 0.0,
                completion_cost_per_1k: 0.0,
                image_token_surcharge: None,
            }],
        }
    }

    async fn execute(
        &self,
        messages: &[Message],
        _model_override: Option<&str>,
        _tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ProviderResponse> {
        let prompt = messages
            .iter()
            .map(|m| m.text_content())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ProviderResponse {
            result: AiResult::text(format!("Echo: {prompt}"), AiResultMeta::default()),
            pending_tool_calls: Vec::new(),
        })
    }
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

impl OpenAICompatibleProvider {
    fn resolve_model<'a>(&'a self, model_override: Option<&'a str>) -> &'a str {
        model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
    }
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: vec![ModelInfo {
                name: self.default_model.clone(),
                supports_tools: true,
                supports_streaming: true,
                supports_vision: true,
                is_image_model: false,
                context_window: Some(128_000),
                prompt_cost_per_1k: 0.0,
                completion_cost_per_1k: 0.0,
                image_token_surcharge: Some(765),
            }],
        }
    }

    async fn execute(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ProviderResponse> {
        let model = self.resolve_model(model_override);
        let url = format!("{}/chat/completions", self.base_url);
        let wire_messages: Vec<serde_json::Value> = messages.iter().map(message_to_openai_json).collect();
        let mut body = json!({ "model": model, "messages": wire_messages, "stream": false });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::Value::Array(tools.iter().map(tool_definition_to_openai).collect());
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let response = req.send().await?;
        let status = response.status();
        let value: serde_json::Value = response.json().await?;

        if !status.is_success() {
            let detail = extract_openai_error(&value)
                .unwrap_or_else(|| format!("provider request failed with status {status}"));
            anyhow::bail!(detail);
        }
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }

        let pending_tool_calls = extract_tool_calls(&value);
        let text = if pending_tool_calls.is_empty() {
            extract_openai_text(&value).unwrap_or_default()
        } else {
            String::new()
        };
        let usage = extract_usage(&value);
        let meta = AiResultMeta {
            provider: Some(self.id.clone()),
            model: Some(model.to_string()),
            prompt_tokens: usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            tool_calls: Vec::new(),
            finish_reason: extract_finish_reason(&value),
        };

        Ok(ProviderResponse {
            result: AiResult::text(text, meta),
            pending_tool_calls,
        })
    }

    async fn stream_execute(
        &self,
        messages: Vec<Message>,
        model_override: Option<&str>,
        tools: Option<Vec<ToolDefinition>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        let model = self.resolve_model(model_override).to_string();
        let url = format!("{}/chat/completions", self.base_url);
        let wire_messages: Vec<serde_json::Value> = messages.iter().map(message_to_openai_json).collect();
        let mut body = json!({ "model": model, "messages": wire_messages, "stream": true });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = serde_json::Value::Array(tools.iter().map(tool_definition_to_openai).collect());
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(url).json(&body);
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "provider stream request failed with status {}: {}",
                status,
                truncate_for_error(&text, 500)
            );
        }

        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done { finish_reason: "cancelled".to_string(), usage: None };
                    break;
                }

                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done { finish_reason: "stop".to_string(), usage: None };
                            continue;
                        }

                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        if let Some(detail) = extract_openai_error(&value) {
                            Err(anyhow::anyhow!(detail))?;
                        }

                        let choices = value.get("choices").and_then(|v| v.as_array()).cloned().unwrap_or_default();
                        for choice in choices {
                            let delta = choice.get("delta").cloned().unwrap_or_default();

                            if let Some(text) = delta.get("content").and_then(|v| v.as_str()) {
                                if !text.is_empty() {
                                    yield StreamChunk::TextDelta(text.to_string());
                                }
                            }

                            if let Some(tool_calls) = delta.get("tool_calls").and_then(|v| v.as_array()) {
                                for call in tool_calls {
                                    let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                                    let function = call.get("function").cloned().unwrap_or_default();
                                    let name = function.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                                    let args_delta = function.get("arguments").and_then(|v| v.as_str()).unwrap_or_default().to_string();

                                    if !id.is_empty() && !name.is_empty() {
                                        yield StreamChunk::ToolCallStart { id: id.clone(), name };
                                    }
                                    if !id.is_empty() && !args_delta.is_empty() {
                                        yield StreamChunk::ToolCallDelta { id: id.clone(), args_delta };
                                    }
                                    if !id.is_empty() {
                                        yield StreamChunk::ToolCallEnd { id };
                                    }
                                }
                            }

                            if let Some(reason) = choice.get("finish_reason").and_then(|v| v.as_str()) {
                                if !reason.is_empty() {
                                    let usage = extract_usage(&value);
                                    yield StreamChunk::Done { finish_reason: reason.to_string(), usage };
                                }
                            }
                        }
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn generate_image(&self, prompt: &str, model_override: Option<&str>) -> anyhow::Result<AiResult> {
        if self.id != "openai" {
            anyhow::bail!("{} does not support image generation", self.id);
        }
        let model = model_override.unwrap_or("gpt-image-1");
        let url = format!("{}/images/generations", self.base_url);
        let mut req = self
            .client
            .post(url)
            .json(&json!({ "model": model, "prompt": prompt, "n": 1 }));
        if let Some(api_key) = &self.api_key {
            req = req.bearer_auth(api_key);
        }
        let value: serde_json::Value = req.send().await?.json().await?;
        if let Some(detail) = extract_openai_error(&value) {
            anyhow::bail!(detail);
        }
        let url_or_b64 = value["data"][0]["url"]
            .as_str()
            .or_else(|| value["data"][0]["b64_json"].as_str())
            .ok_or_else(|| anyhow::anyhow!("image provider returned no image data"))?
            .to_string();
        let format = if value["data"][0]["url"].is_string() {
            flowcore_types::AiResultFormat::Url
        } else {
            flowcore_types::AiResultFormat::Base64
        };
        Ok(AiResult {
            kind: flowcore_types::AiResultKind::Image,
            sub_type: None,
            format,
            value: url_or_b64,
            mime: Some("image/png".to_string()),
            meta: AiResultMeta {
                provider: Some(self.id.clone()),
                model: Some(model.to_string()),
                ..Default::default()
            },
        })
    }
}

struct AnthropicProvider {
    api_key: Option<String>,
    default_model: String,
    client: Client,
}

struct CohereProvider {
    api_key: Option<String>,
    base_url: String,
    default_model: String,
    client: Client,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: vec![ModelInfo {
                name: self.default_model.clone(),
                supports_tools: true,
                supports_streaming: true,
                supports_vision: true,
                is_image_model: false,
                context_window: Some(200_000),
                prompt_cost_per_1k: 0.0,
                completion_cost_per_1k: 0.0,
                image_token_surcharge: Some(1_500),
            }],
        }
    }

    async fn execute(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
        tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ProviderResponse> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());

        let (system, rest): (Vec<&Message>, Vec<&Message>) =
            messages.iter().partition(|m| m.role == Role::System);
        let system_text = system.iter().map(|m| m.text_content()).collect::<Vec<_>>().join("\n\n");

        let mut body = json!({
            "model": model,
            "max_tokens": 1024,
            "messages": rest.iter().map(|m| json!({
                "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                "content": m.text_content(),
            })).collect::<Vec<_>>(),
        });
        if !system_text.is_empty() {
            body["system"] = json!(system_text);
        }
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["tools"] = json!(tools
                .iter()
                .map(|t| json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters_schema,
                }))
                .collect::<Vec<_>>());
        }

        let mut req = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("anthropic-version", "2023-06-01")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }
        let value: serde_json::Value = req.send().await?.json().await?;

        let content = value["content"].as_array().cloned().unwrap_or_default();
        let mut text = String::new();
        let mut pending_tool_calls = Vec::new();
        for block in &content {
            match block.get("type").and_then(|v| v.as_str()) {
                Some("text") => {
                    if let Some(t) = block.get("text").and_then(|v| v.as_str()) {
                        text.push_str(t);
                    }
                }
                Some("tool_use") => {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let name = block.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                    let arguments = block.get("input").cloned().unwrap_or(serde_json::Value::Null);
                    pending_tool_calls.push(ToolCall { id, name, arguments });
                }
                _ => {}
            }
        }

        let usage = value.get("usage").map(|u| TokenUsage {
            prompt_tokens: u.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            completion_tokens: u.get("output_tokens").and_then(|v| v.as_u64()).unwrap_or(0),
            total_tokens: 0,
        });
        let meta = AiResultMeta {
            provider: Some("anthropic".to_string()),
            model: Some(model.to_string()),
            prompt_tokens: usage.as_ref().map(|u| u.prompt_tokens).unwrap_or(0),
            completion_tokens: usage.as_ref().map(|u| u.completion_tokens).unwrap_or(0),
            tool_calls: Vec::new(),
            finish_reason: value.get("stop_reason").and_then(|v| v.as_str()).map(str::to_string),
        };

        Ok(ProviderResponse {
            result: AiResult::text(text, meta),
            pending_tool_calls,
        })
    }

    async fn stream_execute(
        &self,
        messages: Vec<Message>,
        model_override: Option<&str>,
        _tools: Option<Vec<ToolDefinition>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str())
            .to_string();
        let mut req = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": model,
                "max_tokens": 1024,
                "stream": true,
                "messages": messages.iter().map(|m| json!({
                    "role": if m.role == Role::Assistant { "assistant" } else { "user" },
                    "content": m.text_content(),
                })).collect::<Vec<_>>(),
            }));
        if let Some(key) = &self.api_key {
            req = req.header("x-api-key", key);
        }

        let resp = req.send().await?;
        let mut bytes = resp.bytes_stream();
        let stream = try_stream! {
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                if cancel.is_cancelled() {
                    yield StreamChunk::Done { finish_reason: "cancelled".to_string(), usage: None };
                    break;
                }
                let chunk = chunk?;
                buffer.push_str(str::from_utf8(&chunk).unwrap_or_default());

                while let Some(pos) = buffer.find("\n\n") {
                    let frame = buffer[..pos].to_string();
                    buffer = buffer[pos + 2..].to_string();
                    for line in frame.lines() {
                        if !line.starts_with("data: ") {
                            continue;
                        }
                        let payload = line.trim_start_matches("data: ").trim();
                        if payload == "[DONE]" {
                            yield StreamChunk::Done { finish_reason: "stop".to_string(), usage: None };
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<serde_json::Value>(payload) else {
                            continue;
                        };
                        match value.get("type").and_then(|v| v.as_str()).unwrap_or_default() {
                            "content_block_delta" => {
                                if let Some(delta) = value.get("delta").and_then(|v| v.get("text")).and_then(|v| v.as_str()) {
                                    yield StreamChunk::TextDelta(delta.to_string());
                                }
                                if let Some(reasoning) = value.get("delta").and_then(|v| v.get("thinking")).and_then(|v| v.as_str()) {
                                    yield StreamChunk::ReasoningDelta(reasoning.to_string());
                                }
                            }
                            "message_stop" => {
                                yield StreamChunk::Done { finish_reason: "stop".to_string(), usage: None };
                            }
                            _ => {}
                        }
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl Provider for CohereProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "cohere".to_string(),
            name: "Cohere".to_string(),
            models: vec![ModelInfo {
                name: self.default_model.clone(),
                supports_tools: false,
                supports_streaming: false,
                supports_vision: false,
                is_image_model: false,
                context_window: Some(128_000),
                prompt_cost_per_1k: 0.0,
                completion_cost_per_1k: 0.0,
                image_token_surcharge: None,
            }],
        }
    }

    async fn execute(
        &self,
        messages: &[Message],
        model_override: Option<&str>,
        _tools: Option<&[ToolDefinition]>,
    ) -> anyhow::Result<ProviderResponse> {
        let model = model_override
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(self.default_model.as_str());
        let prompt = messages.iter().map(|m| m.text_content()).collect::<Vec<_>>().join("\n");
        let mut req = self.client.post(format!("{}/chat", self.base_url)).json(&json!({
            "model": model,
            "messages": [{ "role": "user", "content": prompt }],
        }));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let value: serde_json::Value = req.send().await?.json().await?;
        let text = value["message"]["content"][0]["text"]
            .as_str()
            .or_else(|| value["text"].as_str())
            .unwrap_or("No completion content.")
            .to_string();
        Ok(ProviderResponse {
            result: AiResult::text(
                text,
                AiResultMeta {
                    provider: Some("cohere".to_string()),
                    model: Some(model.to_string()),
                    ..Default::default()
                },
            ),
            pending_tool_calls: Vec::new(),
        })
    }
}

fn normalize_base(input: &str) -> String {
    if input.ends_with("/v1") {
        input.trim_end_matches('/').to_string()
    } else {
        format!("{}/v1", input.trim_end_matches('/'))
    }
}

fn normalize_plain_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        format!("{}...", &input[..max_len])
    }
}

fn extract_usage(value: &serde_json::Value) -> Option<TokenUsage> {
    let usage = value.get("usage")?;
    let prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
    let total_tokens = usage
        .get("total_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(prompt_tokens.saturating_add(completion_tokens));
    Some(TokenUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    })
}

fn collect_text_fragments(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::String(s) => out.push_str(s),
        serde_json::Value::Array(arr) => {
            for item in arr {
                collect_text_fragments(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(text) = map.get("text").and_then(|v| v.as_str()) {
                out.push_str(text);
            }
            if let Some(content) = map.get("content") {
                collect_text_fragments(content, out);
            }
        }
        _ => {}
    }
}

fn extract_openai_text(value: &serde_json::Value) -> Option<String> {
    let mut out = String::new();
    if let Some(choice) = value.get("choices").and_then(|v| v.get(0)) {
        collect_text_fragments(choice.get("message").unwrap_or(choice), &mut out);
        if !out.trim().is_empty() {
            return Some(out);
        }
    }
    None
}

fn extract_openai_error(value: &serde_json::Value) -> Option<String> {
    value
        .get("error")
        .and_then(|v| v.get("message"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowcore_types::MessagePart;

    fn cfg(provider_ids: &[&str], default_provider: Option<&str>, include_openai_key: bool) -> AppConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            let api_key = if *id == "openai" && include_openai_key {
                Some("sk-test".to_string())
            } else {
                None
            };
            providers.insert(
                (*id).to_string(),
                ProviderConfig {
                    api_key,
                    url: None,
                    default_model: Some(format!("{id}-model")),
                },
            );
        }
        AppConfig {
            providers,
            default_provider: default_provider.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn explicit_provider_wins_over_default_provider() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openai"), true));
        let provider = registry.select_provider(Some("openrouter")).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn uses_default_provider_when_explicit_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai", "openrouter"], Some("openrouter"), true));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openrouter");
    }

    #[tokio::test]
    async fn falls_back_to_first_provider_when_default_provider_missing() {
        let registry = ProviderRegistry::new(cfg(&["openai"], Some("anthropic"), true));
        let provider = registry.select_provider(None).await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn explicit_unknown_provider_errors() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None, true));
        let err = registry
            .select_provider(Some("openruter"))
            .await
            .err()
            .expect("expected error");
        assert!(err.to_string().contains("provider `openruter` is not configured"));
    }

    #[tokio::test]
    async fn set_api_key_patches_config_and_rebuilds() {
        let registry = ProviderRegistry::new(cfg(&["openai"], None, false));
        registry.set_api_key("openai", "sk-live").await;
        let config = registry.config.read().await;
        assert_eq!(config.providers["openai"].api_key.as_deref(), Some("sk-live"));
    }

    #[test]
    fn token_estimate_excludes_image_payload_and_adds_surcharge() {
        let messages = vec![Message {
            role: Role::User,
            parts: vec![
                MessagePart::Text {
                    text: "a".repeat(400),
                },
                MessagePart::Image {
                    url_or_base64: "x".repeat(10_000),
                    mime: "image/png".to_string(),
                },
            ],
            tool_call_id: None,
            tool_calls: Vec::new(),
        }];
        let model = ModelInfo {
            image_token_surcharge: Some(100),
            ..Default::default()
        };
        let estimate = estimate_tokens_default(&messages, Some(&model));
        assert_eq!(estimate, 100 + 100);
    }

    #[test]
    fn calculate_cost_uses_per_1k_rates() {
        let provider = LocalEchoProvider;
        let model = ModelInfo {
            prompt_cost_per_1k: 1.0,
            completion_cost_per_1k: 2.0,
            ..Default::default()
        };
        let cost = provider.calculate_cost(&model, 1000, 500);
        assert!((cost - 2.0).abs() < 1e-9);
    }
}
