//! Provider/model resolution.

use flowcore_providers::ProviderRegistry;
use flowcore_types::Task;

/// Per-provider lexical prefixes used to decide whether a requested model
/// name plausibly belongs to that provider. A model outside its provider's
/// table is dropped rather than sent upstream to fail loudly.
fn model_looks_compatible(provider_id: &str, model: &str) -> bool {
    let lower = model.to_ascii_lowercase();
    match provider_id {
        "anthropic" => lower.starts_with("claude"),
        "openai" => lower.starts_with("gpt") || lower.starts_with("o1") || lower.starts_with("o3"),
        "cohere" => lower.starts_with("command"),
        "groq" => lower.contains("llama") || lower.contains("mixtral") || lower.contains("gemma"),
        "mistral" => lower.starts_with("mistral") || lower.starts_with("open-mixtral"),
        "ollama" => true,
        "openrouter" => true,
        "together" => true,
        "local" => true,
        _ => true,
    }
}

pub struct ResolvedProvider {
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
}

/// Resolves which provider/model the AI Service Manager should call for
/// `task`: the task's requested provider if it is actually configured, else
/// `None` so [`ProviderRegistry::execute`] falls through to its own
/// configured-default-then-first-configured order. A requested model that
/// is lexically incompatible with the chosen provider is dropped so the
/// provider resolves to its own default model instead of failing upstream.
pub async fn resolve_provider(providers: &ProviderRegistry, task: &Task) -> ResolvedProvider {
    let configured = providers.list().await;
    let configured_ids: Vec<&str> = configured.iter().map(|p| p.id.as_str()).collect();

    let provider_id = task
        .ai_provider
        .as_deref()
        .filter(|requested| configured_ids.contains(requested))
        .map(|id| id.to_string())
        .or_else(|| configured_ids.first().map(|id| id.to_string()));

    let model_id = match (&provider_id, &task.ai_model) {
        (Some(provider_id), Some(model)) if model_looks_compatible(provider_id, model) => {
            Some(model.clone())
        }
        _ => None,
    };

    ResolvedProvider {
        provider_id,
        model_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_incompatible_model_for_provider() {
        assert!(!model_looks_compatible("anthropic", "gpt-4o"));
        assert!(model_looks_compatible("anthropic", "claude-3-5-sonnet"));
        assert!(!model_looks_compatible("openai", "claude-3-opus"));
    }
}
