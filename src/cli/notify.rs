use serde_json::{Value, json};
use tracing::{info, warn};

use super::NotifyArgs;
use crate::{
    config,
    errors::{AppError, Result},
};

pub async fn execute(args: NotifyArgs) -> Result<()> {
    let config = config::load()?;
    let stdin = if args.hook {
        Some(std::io::read_to_string(std::io::stdin())?)
    } else {
        None
    };
    let body = build_body(&args, stdin.as_deref())?;
    let url = super::daemon_url(&config, "/notification")?;

    // No request timeout: approvals hold the response until a decision.
    let response = match reqwest::Client::new().post(&url).json(&body).send().await {
        Ok(response) => response,
        Err(err) if args.hook => {
            // Claude Code falls back to its own prompt when the hook is silent.
            warn!(error = %err.without_url(), %url, "daemon unavailable, leaving decision to Claude Code");
            return Ok(());
        }
        Err(_) => return Err(AppError::DaemonUnavailable(url)),
    };

    let status = response.status();
    let reply: Value = response
        .json()
        .await
        .map_err(|err| AppError::Http(err.without_url()))?;
    if !status.is_success() {
        let message = reply["error"]["message"]
            .as_str()
            .unwrap_or("unexpected response")
            .to_string();
        return Err(AppError::DaemonResponse(message));
    }

    if args.hook {
        if let Some(output) = hook_output(&reply) {
            println!("{output}");
        }
    } else {
        println!("{}", serde_json::to_string_pretty(&reply)?);
    }
    info!(decision = %reply["decision"], "event delivered to daemon");
    Ok(())
}

fn build_body(args: &NotifyArgs, stdin: Option<&str>) -> Result<Value> {
    let mut body = match stdin.map(str::trim) {
        Some(text) if !text.is_empty() => serde_json::from_str::<Value>(text)?,
        _ => json!({}),
    };
    let Some(fields) = body.as_object_mut() else {
        return Err(AppError::InvalidEvent(
            "hook payload must be a JSON object".to_string(),
        ));
    };

    for (key, value) in [
        ("kind", &args.kind),
        ("message", &args.message),
        ("session_id", &args.session_id),
    ] {
        if let Some(value) = value {
            fields.insert(key.to_string(), Value::String(value.clone()));
        }
    }
    if !fields.contains_key("kind") && !fields.contains_key("hook_event_name") {
        fields.insert("kind".to_string(), json!("generic"));
    }
    Ok(body)
}

/// What a Claude Code hook prints: only firm decisions, nothing otherwise.
fn hook_output(reply: &Value) -> Option<Value> {
    reply
        .get("decision")
        .and_then(Value::as_str)
        .filter(|decision| matches!(*decision, "allow" | "deny"))
        .map(|decision| json!({"decision": decision}))
}
