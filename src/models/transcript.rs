use std::path::Path;

use serde_json::Value;
use tracing::debug;

/// Line budgets at or above this are treated as "everything".
const UNLIMITED_LINES: usize = 100;

/// Returns the last question Claude asked (with its options), falling back to
/// the last assistant text, trimmed to `max_lines`.
pub async fn last_context(path: &Path, max_lines: usize) -> Option<String> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(err) => {
            debug!(path = %path.display(), error = %err, "transcript unavailable");
            return None;
        }
    };
    extract_context(&text, max_lines)
}

pub fn extract_context(transcript: &str, max_lines: usize) -> Option<String> {
    let mut last_question = None;
    let mut last_text = None;

    for line in transcript.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(blocks) = entry.pointer("/message/content").and_then(Value::as_array) else {
            continue;
        };

        let mut text_parts = Vec::new();
        for block in blocks {
            match block {
                Value::String(text) => text_parts.push(text.as_str()),
                Value::Object(_) => match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        text_parts.push(block.get("text").and_then(Value::as_str).unwrap_or(""));
                    }
                    Some("tool_use")
                        if block.get("name").and_then(Value::as_str) == Some("AskUserQuestion") =>
                    {
                        if let Some(question) = block.get("input").and_then(format_question) {
                            last_question = Some(question);
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        if !text_parts.is_empty() {
            last_text = Some(text_parts.join("\n"));
        }
    }

    let context = last_question.or(last_text)?;
    Some(limit_lines(&context, max_lines))
}

fn format_question(input: &Value) -> Option<String> {
    let questions = input.get("questions").and_then(Value::as_array)?;
    let mut parts = Vec::new();

    for question in questions {
        if let Some(text) = question
            .get("question")
            .and_then(Value::as_str)
            .filter(|text| !text.is_empty())
        {
            parts.push(format!("❓ {text}"));
        }
        let options = question.get("options").and_then(Value::as_array);
        for (index, option) in options.into_iter().flatten().enumerate() {
            let label = option.get("label").and_then(Value::as_str).unwrap_or("");
            if label.is_empty() {
                continue;
            }
            match option.get("description").and_then(Value::as_str) {
                Some(description) if !description.is_empty() => {
                    parts.push(format!("  {}. {label} - {description}", index + 1));
                }
                _ => parts.push(format!("  {}. {label}", index + 1)),
            }
        }
    }

    (!parts.is_empty()).then(|| parts.join("\n"))
}

fn limit_lines(text: &str, max_lines: usize) -> String {
    if max_lines >= UNLIMITED_LINES {
        return text.to_string();
    }
    let lines: Vec<&str> = text.lines().collect();
    if lines.len() <= max_lines {
        return text.to_string();
    }
    format!("{}\n...", lines[..max_lines].join("\n"))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::{extract_context, last_context};

    const TRANSCRIPT: &str = r#"
{"type":"user","message":{"content":"hello"}}
{"type":"assistant","message":{"content":[{"type":"text","text":"Working on it"}]}}
not json at all
{"type":"assistant","message":{"content":[{"type":"tool_use","name":"AskUserQuestion","input":{"questions":[{"question":"Which database?","options":[{"label":"Postgres","description":"relational"},{"label":"Redis"}]}]}}]}}
{"type":"assistant","message":{"content":[{"type":"text","text":"line one\nline two\nline three"}]}}
"#;

    #[test]
    fn prefers_the_last_question() {
        let context = extract_context(TRANSCRIPT, 20).expect("context");
        assert_eq!(
            context,
            "❓ Which database?\n  1. Postgres - relational\n  2. Redis"
        );
    }

    #[test]
    fn falls_back_to_assistant_text_and_truncates() {
        let transcript = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"a\nb\nc\nd"}]}}"#;
        assert_eq!(extract_context(transcript, 2).as_deref(), Some("a\nb\n..."));
        assert_eq!(extract_context(transcript, 100).as_deref(), Some("a\nb\nc\nd"));
        assert_eq!(extract_context("", 5), None);
    }

    #[tokio::test]
    async fn reads_transcript_files() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(TRANSCRIPT.as_bytes()).expect("write");

        let context = last_context(file.path(), 1).await.expect("context");
        assert_eq!(context, "❓ Which database?\n...");

        let missing = file.path().with_extension("missing");
        assert!(last_context(&missing, 5).await.is_none());
    }
}
