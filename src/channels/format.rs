use regex::Regex;
use serde_json::Value;

use crate::{
    errors::{AppError, Result},
    models::event::{EventKind, NotificationEvent},
};

const MAX_CONTEXT_CHARS: usize = 1000;
const MAX_TOOL_VALUE_CHARS: usize = 200;

pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new() -> Result<Self> {
        let patterns = [
            r"(?i)bearer\s+[A-Za-z0-9\-._~+/]+=*",
            r"gh[pousr]_[A-Za-z0-9]{20,}",
            r"sk-[A-Za-z0-9\-_]{20,}",
            r"eyJ[A-Za-z0-9_-]+\.[A-Za-z0-9._-]+\.[A-Za-z0-9._-]+",
            r"\b\d{8,10}:[A-Za-z0-9_-]{35}\b",
        ]
        .into_iter()
        .map(|pattern| Regex::new(pattern).map_err(|err| AppError::Redaction(err.to_string())))
        .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn redact(&self, input: &str) -> String {
        let mut out = strip_ansi_escapes::strip_str(input);
        for pattern in &self.patterns {
            out = pattern.replace_all(&out, "[REDACTED]").into_owned();
        }
        out
    }
}

/// Legacy Telegram Markdown only cares about these four.
pub fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if matches!(ch, '*' | '_' | '`' | '[') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

pub fn tool_input_summary(event: &NotificationEvent) -> Option<String> {
    let raw = event.meta("tool_input")?;
    let lines = match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(fields)) => fields
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(text) => truncate_chars(&text, MAX_TOOL_VALUE_CHARS),
                    other => other.to_string(),
                };
                format!("{key}: {value}")
            })
            .collect::<Vec<_>>(),
        _ => vec![truncate_chars(raw, MAX_TOOL_VALUE_CHARS)],
    };
    (!lines.is_empty()).then(|| lines.join("\n"))
}

pub fn desktop_title(event: &NotificationEvent) -> String {
    format!("Claude Code - {}", event.project())
}

pub fn telegram_text(
    event: &NotificationEvent,
    context: Option<&str>,
    redactor: &Redactor,
) -> String {
    let project = escape_markdown(&redactor.redact(&event.project()));
    let title = match event.kind {
        EventKind::PermissionRequest => format!("🚨 *Permission Required - {project}*"),
        _ => format!("*Claude Code - {project}*"),
    };

    let mut parts = vec![title];
    if !event.message.is_empty() {
        parts.push(format!(
            "\n💬 {}",
            escape_markdown(&redactor.redact(&event.message))
        ));
    }
    if let Some(context) = context.filter(|context| !context.trim().is_empty()) {
        let context = truncate_chars(&redactor.redact(context), MAX_CONTEXT_CHARS);
        parts.push(format!("\n```\n{}\n```", context.replace("```", "'''")));
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{Redactor, escape_markdown, telegram_text, tool_input_summary, truncate_chars};
    use crate::models::event::NotificationEvent;

    fn event(body: serde_json::Value) -> NotificationEvent {
        NotificationEvent::from_value(body, None).expect("event")
    }

    #[test]
    fn redacts_tokens_and_ansi() {
        let redactor = Redactor::new().expect("redactor");
        let out = redactor.redact(
            "\u{1b}[31mAuthorization: Bearer abc.def-123\u{1b}[0m key=sk-abcdefghijklmnopqrstuvwx",
        );
        assert_eq!(out, "Authorization: [REDACTED] key=[REDACTED]");
    }

    #[test]
    fn escapes_markdown_and_truncates_on_char_boundaries() {
        assert_eq!(escape_markdown("a_b*c`d[e"), r"a\_b\*c\`d\[e");
        assert_eq!(truncate_chars("héllo", 2), "hé...");
        assert_eq!(truncate_chars("hi", 2), "hi");
    }

    #[test]
    fn summarises_tool_input() {
        let long = "x".repeat(250);
        let event = event(json!({
            "kind": "permission_request",
            "tool_input": {"command": "cargo publish", "body": long},
        }));
        let summary = tool_input_summary(&event).expect("summary");
        assert!(summary.contains("command: cargo publish"));
        assert!(summary.contains(&format!("body: {}...", "x".repeat(200))));
    }

    #[test]
    fn permission_message_layout() {
        let redactor = Redactor::new().expect("redactor");
        let event = event(json!({
            "kind": "permission_request",
            "message": "Claude wants to use: Bash",
            "cwd": "/work/my_app",
        }));
        let text = telegram_text(&event, Some("command: ls"), &redactor);
        assert_eq!(
            text,
            "🚨 *Permission Required - my\\_app*\n\n💬 Claude wants to use: Bash\n\n```\ncommand: ls\n```"
        );
    }

    #[test]
    fn idle_message_without_context() {
        let redactor = Redactor::new().expect("redactor");
        let event = event(json!({"kind": "idle_prompt", "message": "Waiting"}));
        assert_eq!(
            telegram_text(&event, None, &redactor),
            "*Claude Code - Claude Code*\n\n💬 Waiting"
        );
    }
}
