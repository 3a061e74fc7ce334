use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use miette::Diagnostic;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AppError {
    #[error("could not resolve user home/config directory")]
    #[diagnostic(
        code(nudge::config::paths),
        help("Set HOME, then retry `nudge doctor`.")
    )]
    HomeDirUnavailable,

    #[error("failed to load config: {0}")]
    #[diagnostic(
        code(nudge::config::load),
        help("Fix the syntax of config.toml or the NUDGE_* environment overrides.")
    )]
    ConfigLoad(String),

    #[error("invalid bind address `{0}`")]
    #[diagnostic(
        code(nudge::config::bind),
        help("Use a socket address such as 127.0.0.1:8765.")
    )]
    InvalidBind(String),

    #[error("telegram is not configured")]
    #[diagnostic(
        code(nudge::telegram::not_configured),
        help("Set telegram.bot_token and telegram.chat_id in config.toml.")
    )]
    TelegramNotConfigured,

    #[error("invalid event payload: {0}")]
    #[diagnostic(code(nudge::event::invalid))]
    InvalidEvent(String),

    #[error("no pending approval `{0}`")]
    #[diagnostic(code(nudge::approval::not_found))]
    ApprovalNotFound(String),

    #[error("daemon unreachable at {0}")]
    #[diagnostic(
        code(nudge::daemon::unreachable),
        help("Start it with `nudge serve`, or inspect logs with `RUST_LOG=nudge=debug nudge serve`.")
    )]
    DaemonUnavailable(String),

    #[error("daemon returned an error: {0}")]
    #[diagnostic(code(nudge::daemon::response))]
    DaemonResponse(String),

    #[error("Telegram token is invalid or unauthorized")]
    #[diagnostic(code(nudge::telegram::auth))]
    TelegramAuthFailed,

    #[error("telegram API error: {0}")]
    #[diagnostic(code(nudge::telegram::api))]
    TelegramApi(String),

    #[error("desktop notification failed: {0}")]
    #[diagnostic(code(nudge::desktop::notify))]
    DesktopNotification(String),

    #[error("invalid redaction pattern: {0}")]
    #[diagnostic(code(nudge::format::redaction))]
    Redaction(String),

    #[error("doctor check failed: {0}")]
    #[diagnostic(code(nudge::doctor::unhealthy))]
    DoctorUnhealthy(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidEvent(_) | Self::Json(_) => StatusCode::BAD_REQUEST,
            Self::ApprovalNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn wire_code(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) | Self::Json(_) => "invalid_event",
            Self::ApprovalNotFound(_) => "not_found",
            _ => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": {
                "code": self.wire_code(),
                "message": self.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}
