//! Layered workflow configuration: global < project < managed < env <
//! runtime < per-call override, merged as plain `serde_json::Value`s and
//! deserialized into typed structs on read, so a host application can set
//! enabled providers, API keys, MCP servers, and budget policy without this
//! workspace depending on any particular config file format.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use flowcore_mcp::McpServerConfig;
use flowcore_providers::{AppConfig as ProviderAppConfig, ProviderConfig as ProviderEntryConfig};
use flowcore_types::Budget;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEntry {
    pub api_key: Option<String>,
    pub url: Option<String>,
    pub default_model: Option<String>,
}

impl From<ProviderEntry> for ProviderEntryConfig {
    fn from(value: ProviderEntry) -> Self {
        ProviderEntryConfig {
            api_key: value.api_key,
            url: value.url,
            default_model: value.default_model,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct McpServerEntry {
    pub id: String,
    pub name: String,
    pub endpoint: String,
    #[serde(default)]
    pub env: Map<String, Value>,
}

impl From<McpServerEntry> for McpServerConfig {
    fn from(value: McpServerEntry) -> Self {
        McpServerConfig {
            id: value.id,
            name: value.name,
            endpoint: value.endpoint,
            env: value.env,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BudgetPolicy {
    pub max_cost: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl BudgetPolicy {
    /// Seeds a fresh per-workflow [`Budget`] from this policy. Returns
    /// `None` when neither cap is configured, since an unbounded budget is
    /// represented as the absence of one on `ExecutionContext`, not as
    /// `f64::MAX`/`u64::MAX` sentinels.
    pub fn to_runtime_budget(&self) -> Option<Budget> {
        if self.max_cost.is_none() && self.max_tokens.is_none() {
            return None;
        }
        Some(Budget {
            max_cost: self.max_cost.unwrap_or(f64::MAX),
            max_tokens: self.max_tokens.unwrap_or(u64::MAX),
            current_cost: 0.0,
            current_tokens: 0,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderEntry>,
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerEntry>,
    #[serde(default = "default_true")]
    pub auto_detect_mcps: bool,
    #[serde(default)]
    pub budget: Option<BudgetPolicy>,
}

fn default_true() -> bool {
    true
}

impl From<WorkflowConfig> for ProviderAppConfig {
    fn from(value: WorkflowConfig) -> Self {
        ProviderAppConfig {
            providers: value
                .providers
                .into_iter()
                .map(|(id, entry)| (id, entry.into()))
                .collect(),
            default_provider: value.default_provider,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    managed: Value,
    env: Value,
    runtime: Value,
    call: Value,
}

/// Holds the six config layers and merges them deeply on every read.
/// Mutating a layer never touches the others; `get()` always re-derives the
/// merged view rather than caching it, so a `patch_runtime` call is visible
/// to the very next `get()`.
#[derive(Clone)]
pub struct ConfigStore {
    project_path: PathBuf,
    global_path: PathBuf,
    managed_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(project_path: impl AsRef<Path>, call_overrides: Option<Value>) -> anyhow::Result<Self> {
        let project_path = project_path.as_ref().to_path_buf();
        if let Some(parent) = project_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let managed_path = project_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("managed_config.json");
        let global_path = resolve_global_config_path().await?;

        let global = read_json_file(&global_path).await.unwrap_or_else(|_| empty_object());
        let project = read_json_file(&project_path).await.unwrap_or_else(|_| empty_object());
        let managed = read_json_file(&managed_path).await.unwrap_or_else(|_| empty_object());

        let layers = ConfigLayers {
            global,
            project,
            managed,
            env: env_layer(),
            runtime: empty_object(),
            call: call_overrides.unwrap_or_else(empty_object),
        };

        Ok(ConfigStore {
            project_path,
            global_path,
            managed_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub async fn get(&self) -> WorkflowConfig {
        let merged = self.get_effective_value().await;
        serde_json::from_value(merged).unwrap_or_default()
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        deep_merge(&mut merged, &layers.global);
        deep_merge(&mut merged, &layers.project);
        deep_merge(&mut merged, &layers.managed);
        deep_merge(&mut merged, &layers.env);
        deep_merge(&mut merged, &layers.runtime);
        deep_merge(&mut merged, &layers.call);
        merged
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<()> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
        }
        self.save_project().await
    }

    pub async fn patch_global(&self, patch: Value) -> anyhow::Result<()> {
        {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.global, &patch);
        }
        self.save_global().await
    }

    /// Runtime overrides are process-lifetime only (`setApiKey`/
    /// `configure`-style calls) and are never persisted to disk.
    pub async fn patch_runtime(&self, patch: Value) {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.runtime, &patch);
    }

    /// Per-call overrides (e.g. a single task pinning a provider) replace
    /// the whole layer rather than merging into it, since a call's own
    /// config should never be contaminated by the previous call's.
    pub async fn set_call_overrides(&self, overrides: Value) {
        self.layers.write().await.call = overrides;
    }

    async fn save_project(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.project.clone();
        write_json_file(&self.project_path, &snapshot).await
    }

    async fn save_global(&self) -> anyhow::Result<()> {
        let snapshot = self.layers.read().await.global.clone();
        write_json_file(&self.global_path, &snapshot).await
    }

    #[cfg(test)]
    async fn managed_path_for_test(&self) -> &Path {
        &self.managed_path
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

async fn resolve_global_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("FLOWCORE_GLOBAL_CONFIG") {
        let path = PathBuf::from(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let path = config_dir.join("flowcore").join("config.json");
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        return Ok(path);
    }
    Ok(PathBuf::from(".flowcore/global_config.json"))
}

/// Reads provider API keys and a handful of policy knobs from the process
/// environment. Mirrors the provider id/env var table
/// `flowcore-providers::build_providers` actually consults, so a bare
/// `OPENAI_API_KEY` is enough to enable that provider without a config
/// file.
fn env_layer() -> Value {
    let mut root = empty_object();

    for (provider, env_key, default_url, default_model) in [
        ("openai", "OPENAI_API_KEY", "https://api.openai.com/v1", "gpt-4o-mini"),
        (
            "openrouter",
            "OPENROUTER_API_KEY",
            "https://openrouter.ai/api/v1",
            "openai/gpt-4o-mini",
        ),
        ("groq", "GROQ_API_KEY", "https://api.groq.com/openai/v1", "llama-3.1-8b-instant"),
        (
            "mistral",
            "MISTRAL_API_KEY",
            "https://api.mistral.ai/v1",
            "mistral-small-latest",
        ),
        (
            "together",
            "TOGETHER_API_KEY",
            "https://api.together.xyz/v1",
            "meta-llama/Llama-3.1-8B-Instruct-Turbo",
        ),
        (
            "anthropic",
            "ANTHROPIC_API_KEY",
            "https://api.anthropic.com/v1",
            "claude-3-5-sonnet-latest",
        ),
        ("cohere", "COHERE_API_KEY", "https://api.cohere.com/v2", "command-r-plus"),
    ] {
        if let Ok(api_key) = std::env::var(env_key) {
            if !api_key.trim().is_empty() {
                deep_merge(
                    &mut root,
                    &json!({
                        "providers": {
                            provider: {
                                "api_key": api_key,
                                "url": default_url,
                                "default_model": default_model
                            }
                        }
                    }),
                );
            }
        }
    }

    if let Ok(ollama_url) = std::env::var("OLLAMA_URL") {
        deep_merge(
            &mut root,
            &json!({ "providers": { "ollama": { "url": ollama_url, "default_model": "llama3.1:8b" } } }),
        );
    } else if std::net::TcpStream::connect("127.0.0.1:11434").is_ok() {
        deep_merge(
            &mut root,
            &json!({ "providers": { "ollama": { "url": "http://127.0.0.1:11434/v1", "default_model": "llama3.1:8b" } } }),
        );
    }

    if let Ok(provider) = std::env::var("FLOWCORE_DEFAULT_PROVIDER") {
        if !provider.trim().is_empty() {
            deep_merge(&mut root, &json!({ "default_provider": provider }));
        }
    }

    if let Ok(max_cost) = std::env::var("FLOWCORE_BUDGET_MAX_COST") {
        if let Ok(parsed) = max_cost.parse::<f64>() {
            deep_merge(&mut root, &json!({ "budget": { "max_cost": parsed } }));
        }
    }
    if let Ok(max_tokens) = std::env::var("FLOWCORE_BUDGET_MAX_TOKENS") {
        if let Ok(parsed) = max_tokens.parse::<u64>() {
            deep_merge(&mut root, &json!({ "budget": { "max_tokens": parsed } }));
        }
    }

    if let Ok(flag) = std::env::var("FLOWCORE_AUTO_DETECT_MCPS") {
        if let Some(parsed) = parse_bool_like(&flag) {
            deep_merge(&mut root, &json!({ "auto_detect_mcps": parsed }));
        }
    }

    root
}

fn parse_bool_like(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_nanos()).unwrap_or(0);
        path.push(format!("flowcore-config-{name}-{ts}.json"));
        path
    }

    #[test]
    fn deep_merge_overlays_win_on_scalars_but_preserve_sibling_keys() {
        let mut base = json!({ "providers": { "openai": { "api_key": "a", "url": "u" } } });
        let overlay = json!({ "providers": { "openai": { "api_key": "b" } } });
        deep_merge(&mut base, &overlay);
        assert_eq!(base["providers"]["openai"]["api_key"], "b");
        assert_eq!(base["providers"]["openai"]["url"], "u");
    }

    #[test]
    fn budget_policy_with_no_caps_yields_no_runtime_budget() {
        let policy = BudgetPolicy::default();
        assert!(policy.to_runtime_budget().is_none());
    }

    #[test]
    fn budget_policy_seeds_zeroed_usage_counters() {
        let policy = BudgetPolicy {
            max_cost: Some(5.0),
            max_tokens: Some(10_000),
        };
        let budget = policy.to_runtime_budget().expect("budget");
        assert_eq!(budget.max_cost, 5.0);
        assert_eq!(budget.max_tokens, 10_000);
        assert_eq!(budget.current_cost, 0.0);
        assert_eq!(budget.current_tokens, 0);
    }

    #[tokio::test]
    async fn patch_project_persists_to_disk_and_is_visible_in_effective_value() {
        std::env::remove_var("FLOWCORE_GLOBAL_CONFIG");
        let project_path = unique_temp_path("project");
        let store = ConfigStore::new(&project_path, None).await.expect("store");

        store
            .patch_project(json!({ "default_provider": "anthropic" }))
            .await
            .expect("patch");

        let effective = store.get_effective_value().await;
        assert_eq!(effective["default_provider"], "anthropic");

        let persisted = read_json_file(&project_path).await.expect("read back");
        assert_eq!(persisted["default_provider"], "anthropic");

        let _ = fs::remove_file(&project_path).await;
    }

    #[tokio::test]
    async fn runtime_layer_outranks_project_layer_but_is_never_persisted() {
        let project_path = unique_temp_path("runtime-precedence");
        let store = ConfigStore::new(&project_path, None).await.expect("store");
        store
            .patch_project(json!({ "default_provider": "anthropic" }))
            .await
            .expect("patch project");
        store.patch_runtime(json!({ "default_provider": "openai" })).await;

        let effective = store.get_effective_value().await;
        assert_eq!(effective["default_provider"], "openai");

        let persisted = read_json_file(&project_path).await.expect("read back");
        assert_eq!(persisted["default_provider"], "anthropic");

        let _ = fs::remove_file(&project_path).await;
    }

    #[tokio::test]
    async fn call_overrides_replace_rather_than_merge() {
        let project_path = unique_temp_path("call-overrides");
        let store = ConfigStore::new(&project_path, Some(json!({ "auto_detect_mcps": false })))
            .await
            .expect("store");
        assert!(!store.get().await.auto_detect_mcps);

        store.set_call_overrides(json!({})).await;
        assert!(store.get().await.auto_detect_mcps);

        let _ = fs::remove_file(&project_path).await;
    }

    #[tokio::test]
    async fn managed_layer_path_sits_beside_project_file() {
        let project_path = unique_temp_path("managed-path");
        let store = ConfigStore::new(&project_path, None).await.expect("store");
        assert_eq!(
            store.managed_path_for_test().await.file_name().unwrap(),
            "managed_config.json"
        );
        let _ = fs::remove_file(&project_path).await;
    }
}
