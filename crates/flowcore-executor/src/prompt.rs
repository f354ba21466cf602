//! Macro substitution and dependency-context/output-format augmentation for
//! a task's own description. The same `MacroResolver` the rest of the
//! workspace uses is invoked once here; Context Propagation's own
//! templating is a second, independent call site over the selected prior
//! results rather than the task description itself.

use std::collections::HashMap;

use flowcore_context::{ContextPropagator, PropagationOptions};
use flowcore_macros::{MacroContext, MacroResolver};
use flowcore_types::{Attachment, AttachmentEncoding, ExecutionContext, Task};

pub struct AssembledPrompt {
    /// The task's description/prompt with `{{...}}` macros resolved, with
    /// no dependency-context or output-format text appended. What a script
    /// task's source is run with.
    pub macro_resolved: String,
    /// `macro_resolved` plus the "Context from Dependencies" section and
    /// the output-format instruction. What an ai/input/output task sees.
    pub augmented: String,
    /// Non-text attachments from the dependency results pulled into scope,
    /// carried forward so a success `TaskResult` can surface them even
    /// though they're not rendered inline in `augmented`.
    pub dependency_attachments: Vec<Attachment>,
}

pub fn assemble(task: &Task, ctx: &ExecutionContext) -> AssembledPrompt {
    let resolver = MacroResolver::new();
    let macro_ctx = MacroContext::new(&ctx.previous_results, &ctx.variables);
    let macro_resolved = resolver.resolve(&task.effective_prompt(), &macro_ctx);

    let propagation = PropagationOptions::default();
    let propagated = ContextPropagator::propagate(task, &ctx.previous_results, &propagation, &[]);

    let mut augmented = macro_resolved.clone();
    if !propagated.context_string.is_empty() {
        augmented.push_str("\n\n## Context from Dependencies\n\n");
        augmented.push_str(&propagated.context_string);
    }
    if let Some(format) = task.expected_output_format {
        augmented.push_str("\n\n");
        augmented.push_str(&format.instruction_clause(task.code_language.as_deref()));
    }

    let dependency_attachments = propagated
        .previous_results
        .iter()
        .flat_map(|r| {
            r.attachments
                .iter()
                .filter(|a| a.encoding != AttachmentEncoding::Text)
                .cloned()
        })
        .collect();

    AssembledPrompt {
        macro_resolved,
        augmented,
        dependency_attachments,
    }
}

/// Flattens `ExecutionContext.variables` into a string-valued map so a
/// sandboxed script process can see them through its environment.
pub fn variables_as_env(ctx: &ExecutionContext) -> HashMap<String, String> {
    ctx.variables
        .iter()
        .map(|(key, value)| {
            let rendered = match value {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (key.clone(), rendered)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowcore_types::{
        ErrorInfo, Priority, ResultStatus, TaskKind, TaskResult, TaskStatus, TriggerConfig,
    };
    use std::collections::BTreeSet;

    fn task(deps: &[i64], format: Option<flowcore_types::OutputFormat>) -> Task {
        Task {
            id: 5,
            project_id: 1,
            project_sequence: 5,
            title: "t".to_string(),
            description: Some("do {{task:1}} please".to_string()),
            priority: Priority::Medium,
            status: TaskStatus::Todo,
            task_type: TaskKind::Ai,
            dependencies: deps.iter().copied().collect::<BTreeSet<_>>(),
            trigger_config: TriggerConfig::default(),
            ai_provider: None,
            ai_model: None,
            ai_temperature: None,
            ai_max_tokens: None,
            ai_prompt: None,
            generated_prompt: None,
            expected_output_format: format,
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

    fn result(seq: i64, content: &str) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            task_id: seq,
            project_sequence: seq,
            status: ResultStatus::Success,
            output: serde_json::Value::String(content.to_string()),
            attachments: Vec::new(),
            start_time: now,
            end_time: now,
            duration_ms: 1,
            cost: 0.0,
            tokens: 0,
            retries: 0,
            metadata: Default::default(),
            error: None::<ErrorInfo>,
        }
    }

    #[test]
    fn macro_resolved_never_carries_the_appended_sections() {
        let t = task(&[1], None);
        let mut ctx = ExecutionContext::new("wf", 1);
        ctx.previous_results.push(result(1, "hello"));
        let assembled = assemble(&t, &ctx);
        assert_eq!(assembled.macro_resolved, "do hello please");
        assert!(!assembled.macro_resolved.contains("Context from Dependencies"));
    }

    #[test]
    fn augmented_appends_dependency_context_and_format_instruction() {
        let t = task(&[1], Some(flowcore_types::OutputFormat::Json));
        let mut ctx = ExecutionContext::new("wf", 1);
        ctx.previous_results.push(result(1, "hello"));
        let assembled = assemble(&t, &ctx);
        assert!(assembled.augmented.contains("Context from Dependencies"));
        assert!(assembled.augmented.contains("Respond with a single JSON value"));
    }

    #[test]
    fn no_dependencies_yields_augmented_equal_to_macro_resolved_plus_format_only() {
        let t = task(&[], None);
        let ctx = ExecutionContext::new("wf", 1);
        let assembled = assemble(&t, &ctx);
        assert_eq!(assembled.augmented, assembled.macro_resolved);
    }
}
