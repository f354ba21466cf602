use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Priority band a task was filed under. Purely advisory to the core — the
/// planner and executor never branch on it directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Todo,
    InProgress,
    InReview,
    Done,
    Blocked,
    Skipped,
    Failed,
}

/// Tagged-variant task kind. Each variant is handled by its own adapter in
/// the executor rather than by branching on a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Ai,
    Script,
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptLanguage {
    Javascript,
    Python,
    Bash,
}

/// Closed, normative output-format table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    Text,
    Markdown,
    Html,
    Pdf,
    Json,
    Yaml,
    Csv,
    Sql,
    Shell,
    Mermaid,
    Svg,
    Png,
    Mp4,
    Mp3,
    Diff,
    Log,
    Code,
}

impl OutputFormat {
    /// Image-kind output formats branch the AI Service Manager into the
    /// image path instead of the tool loop / streaming path.
    pub fn is_image(self) -> bool {
        matches!(self, OutputFormat::Png | OutputFormat::Svg)
    }

    pub fn instruction_clause(self, code_language: Option<&str>) -> String {
        match self {
            OutputFormat::Code => match code_language {
                Some(lang) => format!(
                    "Respond with a single {lang} code block and nothing else."
                ),
                None => "Respond with a single code block and nothing else.".to_string(),
            },
            OutputFormat::Json => {
                "Respond with a single JSON value and nothing else (no surrounding prose)."
                    .to_string()
            }
            OutputFormat::Markdown => "Respond using Markdown formatting.".to_string(),
            OutputFormat::Html => "Respond with a complete HTML fragment.".to_string(),
            OutputFormat::Yaml => "Respond with a single YAML document.".to_string(),
            OutputFormat::Csv => "Respond with CSV rows only, no prose.".to_string(),
            OutputFormat::Sql => "Respond with a SQL statement or script only.".to_string(),
            OutputFormat::Shell => "Respond with a shell script only.".to_string(),
            OutputFormat::Mermaid => "Respond with a single Mermaid diagram block.".to_string(),
            OutputFormat::Svg => "Respond with a single SVG document.".to_string(),
            OutputFormat::Png => "Generate an image.".to_string(),
            OutputFormat::Mp4 | OutputFormat::Mp3 => {
                "Generate the requested media asset.".to_string()
            }
            OutputFormat::Diff => "Respond with a unified diff only.".to_string(),
            OutputFormat::Log => "Respond with raw log lines only.".to_string(),
            OutputFormat::Text | OutputFormat::Pdf => "Respond in plain text.".to_string(),
        }
    }
}

/// Dependency/scheduling operator. `Serial` forces a stage containing this
/// task to run its members sequentially.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default)]
    pub execution_type: Option<ExecutionType>,
    #[serde(default)]
    pub depends_on: Option<DependsOn>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Parallel,
    Serial,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOn {
    #[serde(default)]
    pub task_ids: Vec<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpOverride {
    #[serde(default)]
    pub env: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub project_id: i64,
    pub project_sequence: i64,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub priority: Priority,
    pub status: TaskStatus,
    pub task_type: TaskKind,
    /// Dependency set expressed in `projectSequence` values (the canonical
    /// identifier — see DESIGN.md for the legacy-global-id fallback).
    #[serde(default)]
    pub dependencies: BTreeSet<i64>,
    #[serde(default)]
    pub trigger_config: TriggerConfig,

    #[serde(default)]
    pub ai_provider: Option<String>,
    #[serde(default)]
    pub ai_model: Option<String>,
    #[serde(default)]
    pub ai_temperature: Option<f32>,
    #[serde(default)]
    pub ai_max_tokens: Option<u32>,
    #[serde(default)]
    pub ai_prompt: Option<String>,
    #[serde(default)]
    pub generated_prompt: Option<String>,
    #[serde(default)]
    pub expected_output_format: Option<OutputFormat>,
    #[serde(default)]
    pub code_language: Option<String>,
    #[serde(default)]
    pub required_mcps: Vec<String>,
    #[serde(default)]
    pub mcp_config: std::collections::HashMap<String, McpOverride>,
    #[serde(default)]
    pub image_config: Option<ImageConfig>,
    #[serde(default)]
    pub script_language: Option<ScriptLanguage>,

    #[serde(default)]
    pub is_subdivided: bool,
    #[serde(default)]
    pub is_paused: bool,
    #[serde(default)]
    pub auto_review: bool,
    #[serde(default)]
    pub review_ai_provider: Option<String>,
    #[serde(default)]
    pub review_ai_model: Option<String>,
}

impl Task {
    /// The effective prompt text for this task: an explicit `aiPrompt` wins
    /// over an auto-`generatedPrompt`, which wins over the description.
    pub fn effective_prompt(&self) -> String {
        self.ai_prompt
            .clone()
            .or_else(|| self.generated_prompt.clone())
            .or_else(|| self.description.clone())
            .unwrap_or_default()
    }

    pub fn is_serial(&self) -> bool {
        matches!(
            self.trigger_config.execution_type,
            Some(ExecutionType::Serial)
        ) || matches!(self.task_type, TaskKind::Input)
    }

    /// Union of `dependencies` and any `triggerConfig.dependsOn.taskIds`:
    /// both are honored when selecting dependency context.
    pub fn all_dependency_ids(&self) -> BTreeSet<i64> {
        let mut ids = self.dependencies.clone();
        if let Some(depends_on) = &self.trigger_config.depends_on {
            ids.extend(depends_on.task_ids.iter().copied());
        }
        ids
    }
}
