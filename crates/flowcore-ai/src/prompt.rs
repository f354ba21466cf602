//! System/user prompt assembly.

use flowcore_context::{ContextMode, ContextPropagator, PropagationOptions};
use flowcore_types::{
    Attachment, ExecutionContext, MCPContextInsight, Message, MessagePart, ProjectInfo, Task,
};

fn mcp_insights_block(insights: &[MCPContextInsight]) -> Option<String> {
    if insights.is_empty() {
        return None;
    }

    let mut block = String::from("## MCP Context\n\n");
    for insight in insights {
        block.push_str(&format!("### {}\n", insight.name));
        if let Some(description) = &insight.description {
            block.push_str(description);
            block.push('\n');
        }
        if !insight.recommended_tools.is_empty() {
            block.push_str(&format!(
                "Recommended tools: {}\n",
                insight.recommended_tools.join(", ")
            ));
        }
        if let Some(sample) = &insight.sample_output {
            block.push_str(&format!(
                "Sample output: {}\n",
                serde_json::to_string(sample).unwrap_or_default()
            ));
        }
        if !insight.env_vars.is_empty() {
            block.push_str(&format!(
                "Environment: {}\n",
                serde_json::Value::Object(insight.env_vars.clone())
            ));
        }
        if let Some(user_context) = &insight.user_context {
            block.push_str(&format!("User context: {}\n", user_context));
        }
        if let Some(error) = &insight.error {
            block.push_str(&format!("Error: {error}\n"));
        }
        block.push('\n');
    }
    Some(block)
}

/// System prompt: task header, project context, required MCP
/// list, a tool-usage directive, the MCP insights block, and a strict
/// output-format clause.
pub fn build_system_prompt(
    task: &Task,
    project: Option<&ProjectInfo>,
    required_mcps: &[String],
    insights: &[MCPContextInsight],
) -> String {
    let mut sections = Vec::new();

    sections.push(format!(
        "# Task #{}: {}\n\nPriority: {:?}",
        task.project_sequence, task.title, task.priority
    ));

    if let Some(project) = project {
        let mut project_section = format!("## Project: {}", project.title);
        if let Some(goal) = &project.goal {
            project_section.push_str(&format!("\nGoal: {goal}"));
        }
        if let Some(constraints) = &project.constraints {
            project_section.push_str(&format!("\nConstraints: {constraints}"));
        }
        if let Some(phase) = &project.phase {
            project_section.push_str(&format!("\nPhase: {phase}"));
        }
        if let Some(memory) = &project.memory {
            project_section.push_str(&format!("\nMemory summary: {memory}"));
        }
        sections.push(project_section);
    }

    if !required_mcps.is_empty() {
        sections.push(format!(
            "## Required MCP Servers\n\n{}",
            required_mcps.join(", ")
        ));
        sections.push(
            "## Tool Usage Requirements\n\nYou must call the listed tools to gather real data \
             rather than describing what you would do. Do not fabricate tool output."
                .to_string(),
        );
    }

    if let Some(block) = mcp_insights_block(insights) {
        sections.push(block);
    }

    if let Some(format) = task.expected_output_format {
        sections.push(format!(
            "## Output Format\n\n{}",
            format.instruction_clause(task.code_language.as_deref())
        ));
    }

    sections.join("\n\n")
}

pub struct AssembledUserPrompt {
    pub text: String,
    pub images: Vec<Attachment>,
}

/// User prompt: the task's own prompt/description, with
/// dependency context appended via Context Propagation when the Macro
/// Engine hasn't already merged it in, plus MCP insights and a tool-call
/// reminder. Attachments collected from both explicit context metadata and
/// upstream results are split off into `images` so the caller can build a
/// multi-modal message.
pub fn build_user_prompt(
    task: &Task,
    ctx: &ExecutionContext,
    resolved_description: &str,
    insights: &[MCPContextInsight],
) -> AssembledUserPrompt {
    let mut sections = vec![resolved_description.to_string()];

    let dependency_ids = task.all_dependency_ids();
    if !dependency_ids.is_empty() && !resolved_description.contains("Context from Dependencies") {
        let options = PropagationOptions {
            mode: ContextMode::Full,
            ..Default::default()
        };
        let propagated =
            ContextPropagator::propagate(task, &ctx.previous_results, &options, &[]);
        if !propagated.context_string.is_empty() {
            sections.push(format!(
                "## Context from Dependencies\n\n{}",
                propagated.context_string
            ));
        }
    }

    if let Some(block) = mcp_insights_block(insights) {
        sections.push(block);
    }

    if !insights.is_empty() {
        sections.push(
            "Remember to call the available tools for any data you need rather than guessing."
                .to_string(),
        );
    }

    let mut images = Vec::new();
    for result in &ctx.previous_results {
        for attachment in &result.attachments {
            if attachment.mime.starts_with("image/") {
                images.push(attachment.clone());
            }
        }
    }

    AssembledUserPrompt {
        text: sections.join("\n\n"),
        images,
    }
}

/// Builds the initial user message, inlining image attachments as
/// multi-modal parts when present.
pub fn user_message(prompt: &AssembledUserPrompt) -> Message {
    if prompt.images.is_empty() {
        return Message::text(flowcore_types::Role::User, prompt.text.clone());
    }

    let mut parts = vec![MessagePart::Text {
        text: prompt.text.clone(),
    }];
    for attachment in &prompt.images {
        parts.push(MessagePart::Image {
            url_or_base64: attachment.content.clone(),
            mime: attachment.mime.clone(),
        });
    }
    Message {
        role: flowcore_types::Role::User,
        parts,
        tool_call_id: None,
        tool_calls: Vec::new(),
    }
}
