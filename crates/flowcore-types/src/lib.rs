//! Shared data model, error taxonomy, and external-collaborator traits for
//! the workflow execution core. Every other crate in this workspace
//! depends on this one; it depends on nothing execution-specific itself.

pub mod ai;
pub mod context;
pub mod error;
pub mod interfaces;
pub mod plan;
pub mod result;
pub mod state;
pub mod task;

pub use ai::*;
pub use context::*;
pub use error::*;
pub use interfaces::*;
pub use plan::*;
pub use result::*;
pub use state::*;
pub use task::*;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_task(id: i64, seq: i64, deps: &[i64]) -> Task {
        Task {
            id,
            project_id: 1,
            project_sequence: seq,
            title: format!("task-{seq}"),
            description: None,
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            task_type: TaskKind::Ai,
            dependencies: deps.iter().copied().collect(),
            trigger_config: TriggerConfig::default(),
            ai_provider: None,
            ai_model: None,
            ai_temperature: None,
            ai_max_tokens: None,
            ai_prompt: None,
            generated_prompt: None,
            expected_output_format: None,
            code_language: None,
            required_mcps: Vec::new(),
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
    fn effective_prompt_prefers_ai_prompt_over_description() {
        let mut task = sample_task(1, 1, &[]);
        task.description = Some("description".to_string());
        task.generated_prompt = Some("generated".to_string());
        task.ai_prompt = Some("explicit".to_string());
        assert_eq!(task.effective_prompt(), "explicit");
    }

    #[test]
    fn all_dependency_ids_unions_trigger_config() {
        let mut task = sample_task(4, 4, &[1, 2]);
        task.trigger_config.depends_on = Some(DependsOn {
            task_ids: vec![2, 3],
        });
        let ids = task.all_dependency_ids();
        assert_eq!(ids, [1, 2, 3].into_iter().collect());
    }

    #[test]
    fn budget_has_room_is_strict_inequality() {
        let budget = Budget {
            max_cost: 0.01,
            max_tokens: 1000,
            current_cost: 0.0099,
            current_tokens: 10,
        };
        assert!(budget.has_room());
        let exhausted = Budget {
            current_cost: 0.01,
            ..budget
        };
        assert!(!exhausted.has_room());
    }

    #[test]
    fn task_result_content_probes_known_object_fields() {
        let now = Utc::now();
        let mut result = TaskResult::skipped(1, 1, now);
        result.output = serde_json::json!({ "result": "the answer" });
        assert_eq!(result.content(), "the answer");
    }

    #[test]
    fn message_text_content_excludes_image_parts() {
        let message = Message {
            role: Role::User,
            parts: vec![
                MessagePart::Text {
                    text: "describe this".to_string(),
                },
                MessagePart::Image {
                    url_or_base64: "base64data".to_string(),
                    mime: "image/png".to_string(),
                },
            ],
            tool_call_id: None,
            tool_calls: Vec::new(),
        };
        assert_eq!(message.text_content(), "describe this");
        assert_eq!(message.image_count(), 1);
    }

    #[test]
    fn execution_error_retryability_matches_taxonomy() {
        assert!(ExecutionError::Timeout.is_retryable());
        assert!(!ExecutionError::Cancelled.is_retryable());
        assert!(ExecutionError::Provider(ProviderErrorDetail::Http {
            provider: "anthropic".to_string(),
            status: 503,
            message: "unavailable".to_string(),
        })
        .is_retryable());
        assert!(!ExecutionError::Provider(ProviderErrorDetail::Http {
            provider: "anthropic".to_string(),
            status: 401,
            message: "unauthorized".to_string(),
        })
        .is_retryable());
    }
}
