use std::{num::NonZeroU32, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use backoff::backoff::Backoff;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{
    ChannelKind, Notifier,
    format::{self, Redactor},
};
use crate::{
    approvals::{ApprovalId, ApprovalRegistry, Decision},
    config::TelegramConfig,
    errors::{AppError, Result},
    models::{
        event::{EventKind, NotificationEvent},
        transcript,
    },
};

const ALLOW_PREFIX: &str = "perm_allow:";
const DENY_PREFIX: &str = "perm_deny:";
const RETRY_DELAY: Duration = Duration::from_millis(500);
const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct TelegramClient {
    http: Client,
    api_base: String,
    token: SecretString,
    chat_id: String,
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl TelegramClient {
    pub fn from_config(config: &TelegramConfig) -> Result<Self> {
        let quota = Quota::per_second(NonZeroU32::MIN).allow_burst(NonZeroU32::MIN.saturating_add(2));
        Ok(Self {
            http: Client::new(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            token: SecretString::from(config.token()?.to_string()),
            chat_id: config.chat_id()?.to_string(),
            limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    /// Callbacks carry the numeric chat id, so a `@channel` username is
    /// swapped for it once at startup. On failure the name is kept and taps
    /// from that chat are rejected.
    pub async fn resolve_chat_id(mut self) -> Self {
        if self.chat_id.parse::<i64>().is_ok() {
            return self;
        }
        let payload = json!({"chat_id": self.chat_id});
        match self.call::<TelegramChat>("getChat", &payload, REQUEST_TIMEOUT).await {
            Ok(chat) => {
                info!(chat = %self.chat_id, chat_id = chat.id, "resolved telegram chat");
                self.chat_id = chat.id.to_string();
            }
            Err(err) => {
                warn!(chat = %self.chat_id, error = %err, "could not resolve telegram chat, approval taps will be rejected");
            }
        }
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{method}", self.api_base, self.token.expose_secret())
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<T> {
        // reqwest errors embed the URL, and the URL embeds the token.
        let response = self
            .http
            .post(self.method_url(method))
            .timeout(timeout)
            .json(payload)
            .send()
            .await
            .map_err(|err| AppError::Http(err.without_url()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(AppError::TelegramAuthFailed);
        }
        let parsed = response
            .json::<TelegramResponse<T>>()
            .await
            .map_err(|_| AppError::TelegramApi(format!("{method} returned HTTP {status}")))?;

        match parsed {
            TelegramResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            TelegramResponse { description, .. } => Err(AppError::TelegramApi(
                description.unwrap_or_else(|| format!("{method} failed with HTTP {status}")),
            )),
        }
    }

    pub async fn get_bot_username(&self) -> Result<String> {
        let me: BotUser = self.call("getMe", &json!({}), REQUEST_TIMEOUT).await?;
        Ok(me.username.unwrap_or_else(|| "unknown-bot".to_string()))
    }

    pub async fn send_message(&self, text: &str, reply_markup: Option<Value>) -> Result<()> {
        let mut payload = json!({
            "chat_id": self.chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(markup) = reply_markup {
            payload["reply_markup"] = markup;
        }

        let payload = &payload;
        backoff::future::retry_notify(
            RetryOnce::new(RETRY_DELAY),
            || async move {
                self.limiter.until_ready().await;
                self.call::<Value>("sendMessage", payload, REQUEST_TIMEOUT)
                    .await
                    .map(|_| ())
                    .map_err(backoff::Error::transient)
            },
            |err: AppError, after: Duration| {
                warn!(error = %err, retry_in_ms = after.as_millis() as u64, "telegram send failed, retrying");
            },
        )
        .await
    }

    pub async fn answer_callback(&self, callback_id: &str, text: &str) -> Result<()> {
        let payload = json!({
            "callback_query_id": callback_id,
            "text": text,
            "show_alert": true,
        });
        self.call::<Value>("answerCallbackQuery", &payload, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn clear_buttons(&self, chat_id: i64, message_id: i64) -> Result<()> {
        let payload = json!({
            "chat_id": chat_id,
            "message_id": message_id,
            "reply_markup": {"inline_keyboard": []},
        });
        self.call::<Value>("editMessageReplyMarkup", &payload, REQUEST_TIMEOUT)
            .await
            .map(|_| ())
    }

    pub async fn get_updates(&self, offset: i64, poll_secs: u64) -> Result<Vec<TelegramUpdate>> {
        let payload = json!({
            "offset": offset,
            "timeout": poll_secs,
            "allowed_updates": ["callback_query"],
        });
        self.call(
            "getUpdates",
            &payload,
            Duration::from_secs(poll_secs) + REQUEST_TIMEOUT,
        )
        .await
    }
}

/// One retry after a fixed delay, then give up.
struct RetryOnce {
    delay: Duration,
    remaining: Option<Duration>,
}

impl RetryOnce {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            remaining: Some(delay),
        }
    }
}

impl Backoff for RetryOnce {
    fn next_backoff(&mut self) -> Option<Duration> {
        self.remaining.take()
    }

    fn reset(&mut self) {
        self.remaining = Some(self.delay);
    }
}

pub fn approval_keyboard(id: ApprovalId) -> Value {
    json!({
        "inline_keyboard": [[
            {"text": "✅ Allow", "callback_data": format!("{ALLOW_PREFIX}{id}")},
            {"text": "❌ Deny", "callback_data": format!("{DENY_PREFIX}{id}")},
        ]]
    })
}

pub fn parse_callback_data(data: &str) -> Option<(ApprovalId, Decision)> {
    let (raw_id, decision) = if let Some(rest) = data.strip_prefix(ALLOW_PREFIX) {
        (rest, Decision::Allow)
    } else if let Some(rest) = data.strip_prefix(DENY_PREFIX) {
        (rest, Decision::Deny)
    } else {
        return None;
    };
    raw_id.parse().ok().map(|id| (id, decision))
}

pub struct TelegramChannel {
    client: TelegramClient,
    redactor: Arc<Redactor>,
    include_context: bool,
    context_lines: usize,
}

impl TelegramChannel {
    pub fn new(client: TelegramClient, config: &TelegramConfig, redactor: Arc<Redactor>) -> Self {
        Self {
            client,
            redactor,
            include_context: config.include_context,
            context_lines: config.context_lines,
        }
    }

    async fn context_for(&self, event: &NotificationEvent) -> Option<String> {
        match event.kind {
            EventKind::PermissionRequest => format::tool_input_summary(event),
            _ if !self.include_context => None,
            EventKind::IdlePrompt | EventKind::Generic => {
                let path = event.meta("transcript_path")?;
                transcript::last_context(Path::new(path), self.context_lines).await
            }
        }
    }
}

#[async_trait]
impl Notifier for TelegramChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Telegram
    }

    async fn send(&self, event: &NotificationEvent, approval: Option<ApprovalId>) -> Result<()> {
        let context = self.context_for(event).await;
        let text = format::telegram_text(event, context.as_deref(), &self.redactor);
        self.client
            .send_message(&text, approval.map(approval_keyboard))
            .await?;
        info!(kind = %event.kind, session_id = %event.session_id, "telegram notification sent");
        Ok(())
    }
}

pub async fn run_update_listener(client: TelegramClient, registry: Arc<ApprovalRegistry>) {
    let mut offset: i64 = 0;
    info!("telegram update listener started");

    loop {
        match client.get_updates(offset, POLL_TIMEOUT_SECS).await {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    if let Some(callback) = update.callback_query {
                        handle_callback(&client, &registry, callback).await;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "telegram long poll failed");
                tokio::time::sleep(POLL_ERROR_BACKOFF).await;
            }
        }
    }
}

pub async fn handle_callback(
    client: &TelegramClient,
    registry: &ApprovalRegistry,
    callback: CallbackQuery,
) {
    let from_our_chat = callback
        .message
        .as_ref()
        .is_some_and(|message| message.chat.id.to_string() == client.chat_id());
    if !from_our_chat {
        warn!(callback_id = %callback.id, "ignoring callback from unexpected chat");
        acknowledge(client, &callback.id, "Not authorized").await;
        return;
    }

    let Some((approval_id, decision)) = callback.data.as_deref().and_then(parse_callback_data)
    else {
        debug!(callback_id = %callback.id, "ignoring unrelated callback");
        acknowledge(client, &callback.id, "").await;
        return;
    };

    if !registry.resolve(approval_id, decision) {
        acknowledge(client, &callback.id, "Request expired or not found").await;
        return;
    }

    let toast = match decision {
        Decision::Allow => "✅ Allowed",
        Decision::Deny => "❌ Denied",
    };
    acknowledge(client, &callback.id, toast).await;
    if let Some(message) = callback.message
        && let Err(err) = client.clear_buttons(message.chat.id, message.message_id).await
    {
        warn!(error = %err, approval_id = %approval_id, "failed to remove approval buttons");
    }
}

async fn acknowledge(client: &TelegramClient, callback_id: &str, text: &str) {
    if let Err(err) = client.answer_callback(callback_id, text).await {
        warn!(error = %err, "failed to answer telegram callback");
    }
}

#[derive(Debug, Deserialize)]
struct TelegramResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BotUser {
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub data: Option<String>,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub chat: TelegramChat,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}
