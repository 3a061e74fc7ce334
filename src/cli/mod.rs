mod doctor;
mod notify;
mod serve;
mod status;

use std::{net::Ipv4Addr, time::Duration};

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::debug;

use crate::{
    config::Config,
    errors::{AppError, Result},
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(
    name = "nudge",
    version,
    about = "Routes Claude Code attention events to the desktop and Telegram"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the notification daemon (default).
    Serve(ServeArgs),
    Status,
    Doctor,
    /// Send one event to a running daemon.
    Notify(NotifyArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    /// Override the configured listen address.
    #[arg(long)]
    pub bind: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct NotifyArgs {
    /// idle_prompt, permission_request or generic.
    #[arg(long)]
    pub kind: Option<String>,
    #[arg(long)]
    pub message: Option<String>,
    #[arg(long)]
    pub session_id: Option<String>,
    /// Read a Claude Code hook payload from stdin and answer in hook format.
    #[arg(long, default_value_t = false)]
    pub hook: bool,
}

pub async fn dispatch() -> Result<()> {
    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs::default())) {
        Command::Serve(args) => serve::execute(args).await?,
        Command::Status => status::execute().await?,
        Command::Doctor => doctor::execute().await?,
        Command::Notify(args) => notify::execute(args).await?,
    }
    debug!("command completed");
    Ok(())
}

fn daemon_url(config: &Config, path: &str) -> Result<String> {
    let mut addr = config.bind_addr()?;
    if addr.ip().is_unspecified() {
        addr.set_ip(Ipv4Addr::LOCALHOST.into());
    }
    Ok(format!("http://{addr}{path}"))
}

async fn fetch_health(config: &Config) -> Result<Value> {
    let url = daemon_url(config, "/health")?;
    let response = reqwest::Client::new()
        .get(&url)
        .timeout(HEALTH_TIMEOUT)
        .send()
        .await
        .map_err(|_| AppError::DaemonUnavailable(url.clone()))?;
    if !response.status().is_success() {
        return Err(AppError::DaemonResponse(format!(
            "health check returned HTTP {}",
            response.status()
        )));
    }
    Ok(response.json().await?)
}
