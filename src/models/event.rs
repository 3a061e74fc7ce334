use std::{collections::BTreeMap, fmt, path::Path, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    IdlePrompt,
    PermissionRequest,
    Generic,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdlePrompt => "idle_prompt",
            Self::PermissionRequest => "permission_request",
            Self::Generic => "generic",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle_prompt" => Some(Self::IdlePrompt),
            "permission_request" => Some(Self::PermissionRequest),
            "generic" => Some(Self::Generic),
            _ => None,
        }
    }

    fn from_hook(hook_event_name: &str, notification_type: Option<&str>) -> Self {
        match (hook_event_name, notification_type) {
            ("PermissionRequest", _) => Self::PermissionRequest,
            ("Notification", Some("idle_prompt")) => Self::IdlePrompt,
            _ => Self::Generic,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub kind: EventKind,
    pub session_id: String,
    pub message: String,
    pub metadata: BTreeMap<String, String>,
    pub received_at: SystemTime,
}

impl NotificationEvent {
    pub fn from_slice(bytes: &[u8], forced_kind: Option<EventKind>) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| AppError::InvalidEvent(format!("body is not valid JSON: {err}")))?;
        Self::from_value(value, forced_kind)
    }

    /// Build an event from a decoded body. `forced_kind` overrides whatever the
    /// body says, which is how the `/permission` route pins approvals.
    pub fn from_value(value: Value, forced_kind: Option<EventKind>) -> Result<Self> {
        let Value::Object(mut fields) = value else {
            return Err(AppError::InvalidEvent(
                "body must be a JSON object".to_string(),
            ));
        };

        let explicit_kind = match fields.remove("kind") {
            None | Some(Value::Null) => None,
            Some(Value::String(raw)) => Some(
                EventKind::parse(&raw)
                    .ok_or_else(|| AppError::InvalidEvent(format!("unknown kind `{raw}`")))?,
            ),
            Some(_) => {
                return Err(AppError::InvalidEvent("`kind` must be a string".to_string()));
            }
        };

        let notification_type = optional_str(&fields, "notification_type")?;
        let hook_kind = optional_str(&fields, "hook_event_name")?
            .map(|hook_event_name| EventKind::from_hook(hook_event_name, notification_type));

        let Some(kind) = forced_kind.or(explicit_kind).or(hook_kind) else {
            return Err(AppError::InvalidEvent(
                "missing `kind` (or `hook_event_name`)".to_string(),
            ));
        };

        let session_id = take_string(&mut fields, "session_id")?
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Ulid::new().to_string());
        let message = take_string(&mut fields, "message")?
            .filter(|message| !message.trim().is_empty())
            .unwrap_or_else(|| default_message(kind, &fields));

        let metadata = fields
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| {
                let text = match value {
                    Value::String(text) => text,
                    other => other.to_string(),
                };
                (key, text)
            })
            .collect();

        Ok(Self {
            kind,
            session_id,
            message,
            metadata,
            received_at: SystemTime::now(),
        })
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn cwd(&self) -> Option<&str> {
        self.meta("cwd")
    }

    pub fn project(&self) -> String {
        self.cwd()
            .and_then(|cwd| Path::new(cwd).file_name())
            .and_then(|name| name.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "Claude Code".to_string())
    }

    pub fn requires_decision(&self) -> bool {
        self.kind == EventKind::PermissionRequest
    }
}

fn optional_str<'a>(fields: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>> {
    match fields.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text.as_str())),
        Some(_) => Err(AppError::InvalidEvent(format!("`{key}` must be a string"))),
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Result<Option<String>> {
    match fields.remove(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(text)) => Ok(Some(text)),
        Some(_) => Err(AppError::InvalidEvent(format!("`{key}` must be a string"))),
    }
}

fn default_message(kind: EventKind, fields: &Map<String, Value>) -> String {
    match (kind, fields.get("tool_name").and_then(Value::as_str)) {
        (EventKind::PermissionRequest, Some(tool)) => format!("Claude wants to use: {tool}"),
        (EventKind::PermissionRequest, None) => "Claude is asking for permission".to_string(),
        _ => "Claude needs your input".to_string(),
    }
}
