//! Routing convention for `output` tasks. The Task shape this
//! workspace carries has no dedicated "write target" fields, so the target
//! is read off the first line of the assembled prompt as a `kind: value`
//! directive; everything after that line is the content to deliver. Tasks
//! that don't opt into the directive fall back to writing a file under a
//! per-project output directory.

pub enum OutputTarget {
    Path(String),
    Url(String),
    Channel(String),
}

impl OutputTarget {
    pub fn parse(prompt: &str, task_id: i64) -> (OutputTarget, String) {
        let mut lines = prompt.splitn(2, '\n');
        let first = lines.next().unwrap_or_default().trim();
        let rest = lines.next().unwrap_or_default().trim().to_string();

        if let Some(path) = first.strip_prefix("path:") {
            return (OutputTarget::Path(path.trim().to_string()), rest);
        }
        if let Some(url) = first.strip_prefix("url:") {
            return (OutputTarget::Url(url.trim().to_string()), rest);
        }
        if let Some(channel) = first.strip_prefix("channel:") {
            return (OutputTarget::Channel(channel.trim().to_string()), rest);
        }

        (
            OutputTarget::Path(format!("./output/task-{task_id}.txt")),
            prompt.to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_path_directive() {
        let (target, content) = OutputTarget::parse("path: ./report.md\nhello", 1);
        assert!(matches!(target, OutputTarget::Path(p) if p == "./report.md"));
        assert_eq!(content, "hello");
    }

    #[test]
    fn parses_explicit_url_directive() {
        let (target, content) = OutputTarget::parse("url: https://example.com/hook\nbody", 1);
        assert!(matches!(target, OutputTarget::Url(u) if u == "https://example.com/hook"));
        assert_eq!(content, "body");
    }

    #[test]
    fn falls_back_to_default_path_with_full_prompt_as_content() {
        let (target, content) = OutputTarget::parse("just write this down", 7);
        assert!(matches!(target, OutputTarget::Path(p) if p == "./output/task-7.txt"));
        assert_eq!(content, "just write this down");
    }
}
