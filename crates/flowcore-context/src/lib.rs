//! Selects relevant prior task results for one task and formats them as
//! prompt-injected context. Shares the single-pass, non-recursive
//! discipline of the macro engine: this crate never re-invokes itself on
//! its own rendered output.

use std::collections::HashMap;

use flowcore_types::{Attachment, AttachmentEncoding, Task, TaskResult};
use serde_json::Value;

pub const DEFAULT_MAX_CONTEXT_SIZE: usize = 8000;
const TRUNCATION_MARKER: &str = "\n\n...[context truncated]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextMode {
    Full,
    Summary,
    Selective,
    None,
}

#[derive(Debug, Clone)]
pub struct PropagationOptions {
    pub mode: ContextMode,
    pub max_context_size: usize,
    /// When `dependencies` is empty, fall back to every prior result in
    /// ascending `projectSequence` order.
    pub include_parent_results: bool,
    /// Extra result sequences to include regardless of `dependencies`
    /// (sibling tasks under the same parent); opt-in.
    pub include_sibling_results: bool,
    /// Field whitelist used by `ContextMode::Selective`.
    pub selective_fields: Vec<String>,
    /// `{{results}}` / `{{count}}` / `{{#each}}...{{/each}}` template;
    /// `None` uses the default Markdown-per-result rendering.
    pub template: Option<String>,
}

impl Default for PropagationOptions {
    fn default() -> Self {
        PropagationOptions {
            mode: ContextMode::Full,
            max_context_size: DEFAULT_MAX_CONTEXT_SIZE,
            include_parent_results: false,
            include_sibling_results: false,
            selective_fields: Vec::new(),
            template: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PropagatedContext {
    pub previous_results: Vec<TaskResult>,
    pub context_string: String,
    pub extracted_variables: HashMap<String, Value>,
    pub total_size: usize,
    pub was_truncated: bool,
}

pub struct ContextPropagator;

impl ContextPropagator {
    /// Selects and renders context for `task` out of `all_results`
    /// (ordered ascending by `projectSequence`). `sibling_sequences` is
    /// consulted only when
    /// `options.include_sibling_results` is set.
    pub fn propagate(
        task: &Task,
        all_results: &[TaskResult],
        options: &PropagationOptions,
        sibling_sequences: &[i64],
    ) -> PropagatedContext {
        let selected = Self::select(task, all_results, options, sibling_sequences);

        if options.mode == ContextMode::None || selected.is_empty() {
            return PropagatedContext {
                previous_results: selected,
                context_string: String::new(),
                extracted_variables: HashMap::new(),
                total_size: 0,
                was_truncated: false,
            };
        }

        let rendered: Vec<String> = selected
            .iter()
            .map(|r| Self::render_one(r, options))
            .collect();

        let assembled = match &options.template {
            Some(template) => Self::render_template(template, &selected, &rendered),
            None => rendered.join("\n\n"),
        };

        let (context_string, was_truncated) =
            Self::enforce_size(assembled, options.max_context_size);

        PropagatedContext {
            extracted_variables: Self::extract_variables(&selected),
            total_size: context_string.len(),
            context_string,
            was_truncated,
            previous_results: selected,
        }
    }

    fn select(
        task: &Task,
        all_results: &[TaskResult],
        options: &PropagationOptions,
        sibling_sequences: &[i64],
    ) -> Vec<TaskResult> {
        let dependency_ids = task.all_dependency_ids();

        let mut picked: Vec<TaskResult> = if !dependency_ids.is_empty() {
            all_results
                .iter()
                .filter(|r| dependency_ids.contains(&r.project_sequence))
                .cloned()
                .collect()
        } else if options.include_parent_results {
            let mut all = all_results.to_vec();
            all.sort_by_key(|r| r.project_sequence);
            all
        } else {
            Vec::new()
        };

        if options.include_sibling_results {
            for seq in sibling_sequences {
                if !picked.iter().any(|r| r.project_sequence == *seq) {
                    if let Some(result) = all_results.iter().find(|r| r.project_sequence == *seq) {
                        picked.push(result.clone());
                    }
                }
            }
        }

        picked.sort_by_key(|r| r.project_sequence);
        picked
    }

    fn render_one(result: &TaskResult, options: &PropagationOptions) -> String {
        let body = match options.mode {
            ContextMode::Full => result.content(),
            ContextMode::Summary => {
                truncate_at_boundary(&result.content(), options.max_context_size / 3)
            }
            ContextMode::Selective => Self::render_selective(result, &options.selective_fields),
            ContextMode::None => String::new(),
        };

        let mut section = format!(
            "### Task Result (Task #{})\nstatus: {:?}\ntimestamp: {}\n\n{}",
            result.project_sequence,
            result.status,
            result.end_time.to_rfc3339(),
            body
        );

        let text_attachments: Vec<&Attachment> = result
            .attachments
            .iter()
            .filter(|a| a.encoding == AttachmentEncoding::Text)
            .collect();
        if !text_attachments.is_empty() {
            section.push_str("\n\n### Attached Files Content\n");
            for attachment in text_attachments {
                section.push_str(&format!(
                    "\n--- {} ---\n{}\n",
                    attachment.name, attachment.content
                ));
            }
        }

        section
    }

    fn render_selective(result: &TaskResult, fields: &[String]) -> String {
        if fields.is_empty() {
            return result.content();
        }
        fields
            .iter()
            .map(|field| match field.as_str() {
                "status" => format!("status: {:?}", result.status),
                "cost" => format!("cost: {}", result.cost),
                "tokens" => format!("tokens: {}", result.tokens),
                "duration" => format!("duration: {}ms", result.duration_ms),
                "content" => result.content(),
                other => format!("{other}: (unavailable)"),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Applies `{{results}}`, `{{count}}`, and a simple `{{#each}}...{{/each}}`
    /// block referencing `{{title}}`/`{{status}}`/`{{body}}` per item.
    fn render_template(template: &str, results: &[TaskResult], rendered: &[String]) -> String {
        let mut out = template
            .replace("{{results}}", &rendered.join("\n\n"))
            .replace("{{count}}", &results.len().to_string());

        if let (Some(start), Some(end)) = (out.find("{{#each}}"), out.find("{{/each}}")) {
            if end > start {
                let item_template = out[start + "{{#each}}".len()..end].to_string();
                let expanded: String = results
                    .iter()
                    .zip(rendered.iter())
                    .map(|(result, body)| {
                        item_template
                            .replace("{{title}}", &format!("Task #{}", result.project_sequence))
                            .replace("{{status}}", &format!("{:?}", result.status))
                            .replace("{{body}}", body)
                    })
                    .collect();
                out.replace_range(start..end + "{{/each}}".len(), &expanded);
            }
        }

        out
    }

    fn extract_variables(results: &[TaskResult]) -> HashMap<String, Value> {
        let mut vars = HashMap::new();
        for result in results {
            vars.insert(
                format!("task_{}_output", result.project_sequence),
                result.output.clone(),
            );
        }
        vars
    }

    fn enforce_size(assembled: String, max: usize) -> (String, bool) {
        if assembled.len() <= max {
            (assembled, false)
        } else {
            let cutoff = max.saturating_sub(TRUNCATION_MARKER.len());
            let mut truncated = truncate_at_boundary(&assembled, cutoff);
            truncated.push_str(TRUNCATION_MARKER);
            (truncated, true)
        }
    }
}

fn truncate_at_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    let boundary = truncated
        .rfind(['\n', '.'])
        .map(|idx| idx + 1)
        .unwrap_or(truncated.len());
    truncated[..boundary].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowcore_types::{ErrorInfo, Priority, ResultStatus, TaskKind, TaskStatus, TriggerConfig};
    use std::collections::BTreeSet;

    fn task_with_deps(deps: &[i64]) -> Task {
        Task {
            id: 10,
            project_id: 1,
            project_sequence: 10,
            title: "downstream".to_string(),
            description: None,
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

    fn result(seq: i64, content: &str) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            task_id: seq,
            project_sequence: seq,
            status: ResultStatus::Success,
            output: Value::String(content.to_string()),
            attachments: Vec::new(),
            start_time: now,
            end_time: now,
            duration_ms: 5,
            cost: 0.0,
            tokens: 0,
            retries: 0,
            metadata: Default::default(),
            error: None::<ErrorInfo>,
        }
    }

    #[test]
    fn selects_only_explicit_dependencies_when_present() {
        let results = vec![result(1, "a"), result(2, "b"), result(3, "c")];
        let task = task_with_deps(&[2]);
        let propagated =
            ContextPropagator::propagate(&task, &results, &PropagationOptions::default(), &[]);
        assert_eq!(propagated.previous_results.len(), 1);
        assert_eq!(propagated.previous_results[0].project_sequence, 2);
    }

    #[test]
    fn falls_back_to_all_results_when_include_parent_results() {
        let results = vec![result(2, "b"), result(1, "a")];
        let task = task_with_deps(&[]);
        let options = PropagationOptions {
            include_parent_results: true,
            ..Default::default()
        };
        let propagated = ContextPropagator::propagate(&task, &results, &options, &[]);
        assert_eq!(
            propagated
                .previous_results
                .iter()
                .map(|r| r.project_sequence)
                .collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[test]
    fn truncates_and_marks_when_over_max_size() {
        let long = "x".repeat(100);
        let results = vec![result(1, &long)];
        let task = task_with_deps(&[1]);
        let options = PropagationOptions {
            max_context_size: 50,
            ..Default::default()
        };
        let propagated = ContextPropagator::propagate(&task, &results, &options, &[]);
        assert!(propagated.was_truncated);
        assert!(propagated.context_string.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn none_mode_produces_empty_context() {
        let results = vec![result(1, "a")];
        let task = task_with_deps(&[1]);
        let options = PropagationOptions {
            mode: ContextMode::None,
            ..Default::default()
        };
        let propagated = ContextPropagator::propagate(&task, &results, &options, &[]);
        assert!(propagated.context_string.is_empty());
    }

    #[test]
    fn text_attachments_are_inlined_binary_ones_are_not() {
        let mut r = result(1, "body");
        r.attachments.push(Attachment {
            name: "notes.txt".to_string(),
            mime: "text/plain".to_string(),
            encoding: AttachmentEncoding::Text,
            content: "inline me".to_string(),
        });
        r.attachments.push(Attachment {
            name: "photo.png".to_string(),
            mime: "image/png".to_string(),
            encoding: AttachmentEncoding::Base64,
            content: "iVBORw0KG...".to_string(),
        });
        let results = vec![r];
        let task = task_with_deps(&[1]);
        let propagated =
            ContextPropagator::propagate(&task, &results, &PropagationOptions::default(), &[]);
        assert!(propagated.context_string.contains("Attached Files Content"));
        assert!(propagated.context_string.contains("inline me"));
        assert!(!propagated.context_string.contains("iVBORw0KG"));
    }
}
