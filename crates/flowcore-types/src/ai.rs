use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiResultKind {
    Text,
    Image,
    Audio,
    Video,
    Document,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiResultFormat {
    Plain,
    Base64,
    Url,
    Binary,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiResultMeta {
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRecord>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool: String,
    pub arguments: Value,
    pub success: bool,
}

/// Normalized provider output. Invariant enforced by construction: a
/// non-text `kind` always carries a non-empty `value` that is itself the
/// URL/base64/binary-marker payload named by `format`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResult {
    pub kind: AiResultKind,
    #[serde(default)]
    pub sub_type: Option<String>,
    pub format: AiResultFormat,
    pub value: String,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub meta: AiResultMeta,
}

impl AiResult {
    pub fn text(value: impl Into<String>, meta: AiResultMeta) -> Self {
        AiResult {
            kind: AiResultKind::Text,
            sub_type: None,
            format: AiResultFormat::Plain,
            value: value.into(),
            mime: None,
            meta,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MCPContextInsight {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub recommended_tools: Vec<String>,
    #[serde(default)]
    pub sample_output: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub user_context: Option<String>,
    #[serde(default)]
    pub env_vars: serde_json::Map<String, Value>,
}

impl MCPContextInsight {
    pub fn is_error(&self) -> bool {
        if self.error.is_some() {
            return true;
        }
        matches!(&self.sample_output, Some(Value::Object(map))
            if map.get("ok").and_then(Value::as_bool) == Some(false)
                || map.contains_key("error"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Lexically `<mcp-slug>_<remote-tool>` once offered to a provider;
    /// the bare remote name before prefixing.
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub parameters_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text { text: String },
    Image { url_or_base64: String, mime: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub parts: Vec<MessagePart>,
    /// Set on `role=tool` messages; echoes the `ToolCall::id` this message
    /// answers.
    #[serde(default)]
    pub tool_call_id: Option<String>,
    /// Set on `role=assistant` messages that requested tool calls natively.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Message {
            role,
            parts: vec![MessagePart::Text { text: text.into() }],
            tool_call_id: None,
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Message {
            role: Role::Tool,
            parts: vec![MessagePart::Text { text: text.into() }],
            tool_call_id: Some(tool_call_id.into()),
            tool_calls: Vec::new(),
        }
    }

    /// Concatenation of this message's text parts, ignoring image parts —
    /// used by token estimation, which must not count
    /// base64 image payloads as text.
    pub fn text_content(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                MessagePart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, MessagePart::Image { .. }))
            .count()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    #[serde(default)]
    pub supports_tools: bool,
    #[serde(default)]
    pub supports_streaming: bool,
    #[serde(default)]
    pub supports_vision: bool,
    #[serde(default)]
    pub is_image_model: bool,
    #[serde(default)]
    pub context_window: Option<u32>,
    #[serde(default)]
    pub prompt_cost_per_1k: f64,
    #[serde(default)]
    pub completion_cost_per_1k: f64,
    /// Per-image token surcharge used by token estimation when this model
    /// doesn't otherwise expose one.
    #[serde(default)]
    pub image_token_surcharge: Option<u64>,
}
