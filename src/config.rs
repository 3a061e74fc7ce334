use std::{collections::BTreeSet, net::SocketAddr, path::PathBuf, time::Duration};

use directories::BaseDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    errors::{AppError, Result},
    models::event::EventKind,
};

pub const DEFAULT_TELEGRAM_API: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_true")]
    pub desktop_enabled: bool,
    #[serde(default = "default_enabled_kinds")]
    pub enabled_kinds: BTreeSet<EventKind>,
    #[serde(default = "default_approval_timeout_seconds")]
    pub approval_timeout_seconds: u64,
    #[serde(default = "default_approval_grace_seconds")]
    pub approval_grace_seconds: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_terminal_app")]
    pub terminal_app: String,
    #[serde(default)]
    pub sound: Option<String>,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default, deserialize_with = "chat_id_text")]
    pub chat_id: Option<String>,
    #[serde(default = "default_idle_threshold_seconds")]
    pub idle_threshold_seconds: u64,
    #[serde(default = "default_true")]
    pub include_context: bool,
    #[serde(default = "default_context_lines")]
    pub context_lines: usize,
    #[serde(default)]
    pub send_on_screen_lock: bool,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            desktop_enabled: true,
            enabled_kinds: default_enabled_kinds(),
            approval_timeout_seconds: default_approval_timeout_seconds(),
            approval_grace_seconds: default_approval_grace_seconds(),
            sweep_interval_ms: default_sweep_interval_ms(),
            terminal_app: default_terminal_app(),
            sound: None,
            telegram: TelegramConfig::default(),
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            idle_threshold_seconds: default_idle_threshold_seconds(),
            include_context: true,
            context_lines: default_context_lines(),
            send_on_screen_lock: false,
            api_base: default_api_base(),
        }
    }
}

impl Config {
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.bind
            .parse()
            .map_err(|_| AppError::InvalidBind(self.bind.clone()))
    }

    pub fn kind_enabled(&self, kind: EventKind) -> bool {
        self.enabled_kinds.contains(&kind)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval_timeout_seconds)
    }

    pub fn approval_grace(&self) -> Duration {
        Duration::from_secs(self.approval_grace_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.max(10))
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        self.token().is_ok() && self.chat_id().is_ok()
    }

    pub fn token(&self) -> Result<&str> {
        self.bot_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or(AppError::TelegramNotConfigured)
    }

    pub fn chat_id(&self) -> Result<&str> {
        self.chat_id
            .as_deref()
            .map(str::trim)
            .filter(|chat_id| !chat_id.is_empty() && *chat_id != "0")
            .ok_or(AppError::TelegramNotConfigured)
    }
}

pub fn load() -> Result<Config> {
    let path = config_path()?;
    let mut figment = Figment::from(Serialized::defaults(Config::default()));

    if path.exists() {
        figment = figment.merge(Toml::file(&path));
    }

    load_from(figment.merge(Env::prefixed("NUDGE_").split("__")))
}

pub fn load_from(figment: Figment) -> Result<Config> {
    figment
        .extract()
        .map_err(|err| AppError::ConfigLoad(err.to_string()))
}

pub fn config_path() -> Result<PathBuf> {
    let Some(base_dirs) = BaseDirs::new() else {
        return Err(AppError::HomeDirUnavailable);
    };
    Ok(base_dirs.config_dir().join("nudge").join("config.toml"))
}

/// Telegram chat ids are numeric, but config may spell them either way.
fn chat_id_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ChatId {
        Text(String),
        Number(i64),
    }

    Ok(
        Option::<ChatId>::deserialize(deserializer)?.map(|value| match value {
            ChatId::Text(text) => text,
            ChatId::Number(number) => number.to_string(),
        }),
    )
}

fn default_true() -> bool {
    true
}

fn default_bind() -> String {
    "127.0.0.1:8765".to_string()
}

fn default_enabled_kinds() -> BTreeSet<EventKind> {
    BTreeSet::from([
        EventKind::IdlePrompt,
        EventKind::PermissionRequest,
        EventKind::Generic,
    ])
}

fn default_approval_timeout_seconds() -> u64 {
    120
}

fn default_approval_grace_seconds() -> u64 {
    30
}

fn default_sweep_interval_ms() -> u64 {
    1000
}

fn default_terminal_app() -> String {
    "iTerm".to_string()
}

fn default_idle_threshold_seconds() -> u64 {
    120
}

fn default_context_lines() -> usize {
    20
}

fn default_api_base() -> String {
    DEFAULT_TELEGRAM_API.to_string()
}
