//! Single macro engine resolving the closed `{{...}}` form set against a
//! [`MacroContext`]. Unifies what the source kept as two separate
//! implementations (one in context propagation, one in the executor) —
//! see this workspace's DESIGN.md for the union-of-forms rationale.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use chrono::Utc;
use flowcore_types::TaskResult;
use regex::Regex;
use serde_json::Value;

const MISSING_PLACEHOLDER: &str = "[no result available]";
const SUMMARY_CHARS: usize = 500;
const ALL_RESULTS_SUMMARY_CHARS: usize = 200;
/// Result content at or above this many base64 characters is treated as an
/// inline image payload.
const BASE64_IMAGE_THRESHOLD: usize = 50 * 1024;

fn macro_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{\s*([^}]+?)\s*\}\}").expect("static regex"))
}

/// Everything the engine needs to resolve a template, gathered once per
/// task rather than threaded argument-by-argument.
pub struct MacroContext<'a> {
    pub previous_results: &'a [TaskResult],
    pub variables: &'a HashMap<String, Value>,
    pub project_name: Option<&'a str>,
    pub project_description: Option<&'a str>,
    /// Directory images detected inside resolved macro text are written
    /// to. Defaults to `<tmp>/workflow-manager-images` when unset.
    pub image_temp_dir: Option<PathBuf>,
}

impl<'a> MacroContext<'a> {
    pub fn new(previous_results: &'a [TaskResult], variables: &'a HashMap<String, Value>) -> Self {
        MacroContext {
            previous_results,
            variables,
            project_name: None,
            project_description: None,
            image_temp_dir: None,
        }
    }

    fn result_by_sequence(&self, n: i64) -> Option<&TaskResult> {
        self.previous_results
            .iter()
            .find(|r| r.project_sequence == n)
    }

    /// `{{prev}}`/`{{prev.N}}`/`{{prev-N}}`: position
    /// `len(previousResults)-1-N` (default N=0).
    fn result_from_end(&self, n: usize) -> Option<&TaskResult> {
        let len = self.previous_results.len();
        if n >= len {
            return None;
        }
        self.previous_results.get(len - 1 - n)
    }

    fn image_dir(&self) -> PathBuf {
        self.image_temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("workflow-manager-images"))
    }
}

#[derive(Debug, Clone)]
pub struct MacroValidationError {
    pub macro_text: String,
    pub reason: String,
}

/// The macro engine. Stateless aside from the compiled regex (process-wide,
/// via `OnceLock`), so a fresh `MacroResolver` is cheap to construct per
/// call site.
#[derive(Default)]
pub struct MacroResolver;

impl MacroResolver {
    pub fn new() -> Self {
        MacroResolver
    }

    /// Replaces every recognized `{{...}}` placeholder with its resolved
    /// value. Never fails: unresolvable references become a
    /// placeholder string. Single-pass — resolved values are not
    /// themselves re-scanned.
    pub fn resolve(&self, template: &str, ctx: &MacroContext<'_>) -> String {
        macro_regex()
            .replace_all(template, |caps: &regex::Captures| {
                let inner = caps[1].trim();
                self.resolve_one(inner, ctx)
            })
            .into_owned()
    }

    /// Diagnostic-only pass: flags references to task ids outside
    /// `known_dependency_sequences` and to undefined variables. Does not
    /// mutate the template.
    pub fn validate(
        &self,
        template: &str,
        ctx: &MacroContext<'_>,
        known_dependency_sequences: &[i64],
    ) -> Vec<MacroValidationError> {
        let mut errors = Vec::new();
        for caps in macro_regex().captures_iter(template) {
            let inner = caps[1].trim();
            if let Some(n) = parse_task_field_ref(inner).map(|(n, _)| n) {
                if !known_dependency_sequences.contains(&n) {
                    errors.push(MacroValidationError {
                        macro_text: caps[0].to_string(),
                        reason: format!(
                            "task #{n} is not a declared dependency of this task"
                        ),
                    });
                }
            } else if let Some(name) = inner.strip_prefix("var:") {
                if !ctx.variables.contains_key(name.trim()) {
                    errors.push(MacroValidationError {
                        macro_text: caps[0].to_string(),
                        reason: format!("variable `{}` is not defined", name.trim()),
                    });
                }
            }
        }
        errors
    }

    fn resolve_one(&self, inner: &str, ctx: &MacroContext<'_>) -> String {
        if inner == "previous_result" {
            // legacy alias for {{prev.output}}
            return self.resolve_one("prev.output", ctx);
        }
        if inner == "date" {
            return Utc::now().format("%Y-%m-%d").to_string();
        }
        if inner == "datetime" {
            return Utc::now().to_rfc3339();
        }
        if inner == "project.name" {
            return ctx.project_name.unwrap_or_default().to_string();
        }
        if inner == "project.description" {
            return ctx.project_description.unwrap_or_default().to_string();
        }
        if inner == "all_results" {
            return serde_json::to_string(ctx.previous_results).unwrap_or_default();
        }
        if inner == "all_results.summary" {
            return ctx
                .previous_results
                .iter()
                .map(|r| truncate_chars(&r.content(), ALL_RESULTS_SUMMARY_CHARS))
                .collect::<Vec<_>>()
                .join("\n---\n");
        }
        if let Some(name) = inner.strip_prefix("var:") {
            return ctx
                .variables
                .get(name.trim())
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| MISSING_PLACEHOLDER.to_string());
        }
        if let Some((n, field)) = parse_prev_ref(inner) {
            return match ctx.result_from_end(n) {
                Some(result) => self.format_field(result, field.as_deref(), ctx),
                None => MISSING_PLACEHOLDER.to_string(),
            };
        }
        if let Some((n, field)) = parse_task_field_ref(inner) {
            return match ctx.result_by_sequence(n) {
                Some(result) => self.format_field(result, field.as_deref(), ctx),
                None => MISSING_PLACEHOLDER.to_string(),
            };
        }
        MISSING_PLACEHOLDER.to_string()
    }

    fn format_field(
        &self,
        result: &TaskResult,
        field: Option<&str>,
        ctx: &MacroContext<'_>,
    ) -> String {
        match field.unwrap_or("content") {
            "content" => self.resolve_content_detecting_image(result, ctx),
            "output" => serde_json::to_string(&result.output).unwrap_or_default(),
            "summary" => truncate_chars(&result.content(), SUMMARY_CHARS),
            "status" => format!("{:?}", result.status).to_lowercase(),
            "duration" => result.duration_ms.to_string(),
            "cost" => result.cost.to_string(),
            "tokens" => result.tokens.to_string(),
            "metadata" => serde_json::to_string(&result.metadata).unwrap_or_default(),
            dotted => lookup_dotted(&result.output, dotted)
                .unwrap_or_else(|| MISSING_PLACEHOLDER.to_string()),
        }
    }

    /// If the extracted content looks like a base64 image,
    /// materialize it to a temp file and return the path instead of the
    /// raw payload.
    fn resolve_content_detecting_image(
        &self,
        result: &TaskResult,
        ctx: &MacroContext<'_>,
    ) -> String {
        let content = result.content();
        if let Some((mime, data)) = parse_data_url(&content) {
            return write_temp_image(ctx, result.task_id, &mime, data.as_bytes())
                .unwrap_or(content);
        }
        if looks_like_base64_image(&content) {
            return write_temp_image(ctx, result.task_id, "image/png", content.as_bytes())
                .unwrap_or(content);
        }
        content
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

fn parse_data_url(content: &str) -> Option<(String, String)> {
    let rest = content.strip_prefix("data:")?;
    let (mime_and_enc, data) = rest.split_once(',')?;
    let mime = mime_and_enc.split(';').next().unwrap_or("image/png");
    Some((mime.to_string(), data.to_string()))
}

fn looks_like_base64_image(content: &str) -> bool {
    if content.len() < BASE64_IMAGE_THRESHOLD {
        return false;
    }
    content
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='))
}

fn write_temp_image(
    ctx: &MacroContext<'_>,
    task_id: i64,
    mime: &str,
    data: &[u8],
) -> Option<String> {
    let ext = match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "png",
    };
    let dir = ctx.image_dir();
    std::fs::create_dir_all(&dir).ok()?;
    let ts = Utc::now().timestamp_millis();
    let path = dir.join(format!("task-{task_id}-{ts}.{ext}"));
    std::fs::write(&path, data).ok()?;
    Some(path.display().to_string())
}

fn lookup_dotted(value: &Value, path: &str) -> Option<String> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(match current {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    })
}

/// `task.N` / `task:N` / `task.N.FIELD`.
fn parse_task_field_ref(inner: &str) -> Option<(i64, Option<String>)> {
    if let Some(rest) = inner.strip_prefix("task:") {
        return rest.parse().ok().map(|n| (n, None));
    }
    let rest = inner.strip_prefix("task.")?;
    match rest.split_once('.') {
        Some((n, field)) => rest_to_pair(n, field),
        None => rest.parse().ok().map(|n| (n, None)),
    }
}

fn rest_to_pair(n: &str, field: &str) -> Option<(i64, Option<String>)> {
    n.parse().ok().map(|n| (n, Some(field.to_string())))
}

/// `prev` / `prev.N` / `prev-N`, each optionally `.FIELD`.
fn parse_prev_ref(inner: &str) -> Option<(usize, Option<String>)> {
    if inner == "prev" {
        return Some((0, None));
    }
    if let Some(rest) = inner.strip_prefix("prev.") {
        if let Some((n_part, field)) = rest.split_once('.') {
            if let Ok(n) = n_part.parse::<usize>() {
                return Some((n, Some(field.to_string())));
            }
            return None;
        }
        if let Ok(n) = rest.parse::<usize>() {
            return Some((n, None));
        }
        // {{prev.FIELD}} with implicit N=0
        return Some((0, Some(rest.to_string())));
    }
    if let Some(rest) = inner.strip_prefix("prev-") {
        if let Some((n_part, field)) = rest.split_once('.') {
            return n_part.parse().ok().map(|n| (n, Some(field.to_string())));
        }
        return rest.parse().ok().map(|n| (n, None));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flowcore_types::{Attachment, ErrorInfo, ResultStatus};

    fn result(seq: i64, content: &str) -> TaskResult {
        let now = Utc::now();
        TaskResult {
            task_id: seq,
            project_sequence: seq,
            status: ResultStatus::Success,
            output: Value::String(content.to_string()),
            attachments: Vec::<Attachment>::new(),
            start_time: now,
            end_time: now,
            duration_ms: 12,
            cost: 0.01,
            tokens: 42,
            retries: 0,
            metadata: Default::default(),
            error: None::<ErrorInfo>,
        }
    }

    #[test]
    fn resolves_task_dot_n_and_task_colon_n_identically() {
        let results = vec![result(1, "hello")];
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        assert_eq!(resolver.resolve("{{task.1}}", &ctx), "hello");
        assert_eq!(resolver.resolve("{{task:1}}", &ctx), "hello");
    }

    #[test]
    fn resolves_task_field_and_summary() {
        let results = vec![result(1, &"x".repeat(600))];
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        assert_eq!(resolver.resolve("{{task.1.summary}}", &ctx).len(), 500);
        assert_eq!(resolver.resolve("{{task.1.tokens}}", &ctx), "42");
    }

    #[test]
    fn missing_referent_never_throws() {
        let results: Vec<TaskResult> = Vec::new();
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        assert_eq!(
            resolver.resolve("result: {{task.99}}", &ctx),
            "result: [no result available]"
        );
    }

    #[test]
    fn prev_resolves_relative_to_end() {
        let results = vec![result(1, "first"), result(2, "second")];
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        assert_eq!(resolver.resolve("{{prev}}", &ctx), "second");
        assert_eq!(resolver.resolve("{{prev.1}}", &ctx), "first");
        assert_eq!(resolver.resolve("{{prev-1}}", &ctx), "first");
    }

    #[test]
    fn legacy_previous_result_aliases_prev_output() {
        let results = vec![result(1, "only")];
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        assert_eq!(
            resolver.resolve("{{previous_result}}", &ctx),
            resolver.resolve("{{prev.output}}", &ctx)
        );
    }

    #[test]
    fn var_macro_reads_context_variable() {
        let results: Vec<TaskResult> = Vec::new();
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), Value::String("Ada".to_string()));
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        assert_eq!(resolver.resolve("hi {{var:name}}", &ctx), "hi Ada");
    }

    #[test]
    fn resolution_does_not_rescan_macro_shaped_output() {
        let results = vec![result(1, "{{task.2}}")];
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        // single-pass: the literal text "{{task.2}}" is the final value,
        // never re-resolved against task #2 (which doesn't even exist here).
        assert_eq!(resolver.resolve("{{task.1}}", &ctx), "{{task.2}}");
    }

    #[test]
    fn validate_flags_undeclared_dependency_and_unknown_variable() {
        let results = vec![result(1, "hello")];
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        let errors = resolver.validate("{{task.1}} {{task.5}} {{var:missing}}", &ctx, &[1]);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn date_and_datetime_produce_expected_shapes() {
        let results: Vec<TaskResult> = Vec::new();
        let vars = HashMap::new();
        let ctx = MacroContext::new(&results, &vars);
        let resolver = MacroResolver::new();
        let date = resolver.resolve("{{date}}", &ctx);
        assert_eq!(date.len(), 10);
        let datetime = resolver.resolve("{{datetime}}", &ctx);
        assert!(datetime.contains('T'));
    }

    #[test]
    fn base64_image_content_is_materialized_to_temp_file() {
        let payload = "A".repeat(60 * 1024);
        let results = vec![result(1, &payload)];
        let vars = HashMap::new();
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = MacroContext::new(&results, &vars);
        ctx.image_temp_dir = Some(dir.path().to_path_buf());
        let resolver = MacroResolver::new();
        let resolved = resolver.resolve("{{task.1}}", &ctx);
        assert!(resolved.starts_with(dir.path().to_str().unwrap()));
        assert!(resolved.ends_with(".png"));
    }
}
