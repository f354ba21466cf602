use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ConfigErrorDetail {
    #[error("dependency cycle among tasks {tasks:?}")]
    Cycle { tasks: Vec<i64> },
    #[error("unknown task type: {0}")]
    UnknownTaskType(String),
    #[error("unknown macro field: {0}")]
    UnknownMacroField(String),
    #[error("no checkpoint found for workflow {0}")]
    MissingCheckpoint(String),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Error)]
pub enum ProviderErrorDetail {
    #[error("provider {provider} returned HTTP {status}: {message}")]
    Http {
        provider: String,
        status: u16,
        message: String,
    },
    #[error("provider {provider} returned a schema-invalid response: {message}")]
    InvalidResponse { provider: String, message: String },
    #[error("no enabled provider available")]
    NoProviderAvailable,
}

#[derive(Debug, Clone, Error)]
pub enum ToolErrorDetail {
    #[error("tool {tool} reported failure: {message}")]
    ToolFailure { tool: String, message: String },
    #[error("tool loop exceeded the iteration cap of {max_iterations}")]
    MaxIterations { max_iterations: u32 },
    #[error("permission denied for tool {tool}")]
    PermissionDenied { tool: String },
}

#[derive(Debug, Clone, Error)]
pub struct BudgetErrorDetail {
    pub max_cost: f64,
    pub current_cost: f64,
    pub max_tokens: u64,
    pub current_tokens: u64,
}

impl std::fmt::Display for BudgetErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "budget exhausted: cost {:.4}/{:.4}, tokens {}/{}",
            self.current_cost, self.max_cost, self.current_tokens, self.max_tokens
        )
    }
}

#[derive(Debug, Clone, Error)]
pub enum ScriptErrorDetail {
    #[error("script exited with status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
    #[error("failed to spawn script process: {0}")]
    SpawnFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum InputErrorDetail {
    #[error("user declined input request")]
    Declined,
    #[error("file not found: {0}")]
    FileNotFound(String),
    #[error("remote resource fetch failed: {0}")]
    RemoteFetchFailed(String),
}

#[derive(Debug, Clone, Error)]
pub enum OutputErrorDetail {
    #[error("failed to write output: {0}")]
    WriteFailed(String),
    #[error("remote endpoint returned HTTP {status}: {message}")]
    Http { status: u16, message: String },
}

/// Error taxonomy: kinds, not types. Every execution-path failure in
/// this workspace is one of these variants so callers can match on
/// `.kind_name()`/`.is_retryable()` instead of string-sniffing messages.
#[derive(Debug, Clone, Error)]
pub enum ExecutionError {
    #[error("config error: {0}")]
    Config(#[from] ConfigErrorDetail),
    #[error("provider error: {0}")]
    Provider(ProviderErrorDetail),
    #[error("tool error: {0}")]
    Tool(ToolErrorDetail),
    #[error("timeout exceeded")]
    Timeout,
    #[error("execution cancelled")]
    Cancelled,
    #[error("budget exhausted: {0}")]
    Budget(BudgetErrorDetail),
    #[error("script error: {0}")]
    Script(ScriptErrorDetail),
    #[error("input error: {0}")]
    Input(InputErrorDetail),
    #[error("output error: {0}")]
    Output(OutputErrorDetail),
}

/// Retryable pattern match against a raw error message, used when a
/// collaborator (provider client, script sandbox) surfaces a plain string
/// rather than a typed error.
const RETRYABLE_PATTERNS: &[&str] = &[
    "ECONNREFUSED",
    "ETIMEDOUT",
    "ENOTFOUND",
    "network",
    "timeout",
    "429",
    "500",
    "502",
    "503",
];

pub fn message_looks_retryable(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_PATTERNS
        .iter()
        .any(|pat| lower.contains(&pat.to_ascii_lowercase()))
}

impl ExecutionError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExecutionError::Config(_) => "Config",
            ExecutionError::Provider(_) => "Provider",
            ExecutionError::Tool(_) => "Tool",
            ExecutionError::Timeout => "Timeout",
            ExecutionError::Cancelled => "Cancelled",
            ExecutionError::Budget(_) => "Budget",
            ExecutionError::Script(_) => "Script",
            ExecutionError::Input(_) => "Input",
            ExecutionError::Output(_) => "Output",
        }
    }

    /// Centralizes retry locality so the Executor's
    /// retry loop does not re-derive retryability ad hoc.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecutionError::Config(_) => false,
            ExecutionError::Provider(detail) => match detail {
                ProviderErrorDetail::Http { status, .. } => {
                    *status == 429 || (500..600).contains(status)
                }
                ProviderErrorDetail::InvalidResponse { .. } => false,
                ProviderErrorDetail::NoProviderAvailable => false,
            },
            ExecutionError::Tool(detail) => {
                matches!(detail, ToolErrorDetail::ToolFailure { .. })
            }
            ExecutionError::Timeout => true,
            ExecutionError::Cancelled => false,
            ExecutionError::Budget(_) => false,
            ExecutionError::Script(detail) => match detail {
                ScriptErrorDetail::SpawnFailed(message) => message_looks_retryable(message),
                ScriptErrorDetail::NonZeroExit { .. } => false,
            },
            ExecutionError::Input(_) => false,
            ExecutionError::Output(_) => false,
        }
    }
}
