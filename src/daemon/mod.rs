pub mod http;
pub mod routing;

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    approvals::{self, ApprovalRegistry},
    channels::{
        Notifier,
        desktop::DesktopChannel,
        format::Redactor,
        telegram::{self, TelegramChannel, TelegramClient},
    },
    config::Config,
    errors::Result,
    idle::{IdleDetector, SystemIdleDetector},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub idle: Arc<dyn IdleDetector>,
    pub desktop: Option<Arc<dyn Notifier>>,
    pub telegram: Option<Arc<dyn Notifier>>,
    pub registry: Arc<ApprovalRegistry>,
}

pub async fn run(config: Config) -> Result<()> {
    let addr = config.bind_addr()?;
    if !addr.ip().is_loopback() {
        warn!(%addr, "binding to a non-loopback address; the endpoint has no authentication");
    }

    let registry = Arc::new(ApprovalRegistry::new(
        config.approval_timeout(),
        config.approval_grace(),
    ));

    let telegram_client = if config.telegram.is_configured() {
        Some(TelegramClient::from_config(&config.telegram)?.resolve_chat_id().await)
    } else {
        info!("telegram not configured; notifications stay local");
        None
    };

    let redactor = Arc::new(Redactor::new()?);
    let telegram: Option<Arc<dyn Notifier>> = match &telegram_client {
        Some(client) => Some(Arc::new(TelegramChannel::new(
            client.clone(),
            &config.telegram,
            redactor,
        ))),
        None => None,
    };
    let desktop: Option<Arc<dyn Notifier>> = if config.desktop_enabled {
        Some(Arc::new(DesktopChannel::from_config(&config)))
    } else {
        None
    };

    let sweeper = approvals::spawn_sweeper(registry.clone(), config.sweep_interval());
    let listener_task = telegram_client
        .map(|client| tokio::spawn(telegram::run_update_listener(client, registry.clone())));

    let state = AppState {
        config: Arc::new(config),
        idle: Arc::new(SystemIdleDetector::default()),
        desktop,
        telegram,
        registry: registry.clone(),
    };

    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "daemon listening");

    axum::serve(listener, http::router(state))
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    sweeper.abort();
    if let Some(task) = listener_task {
        task.abort();
    }
    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal(registry: Arc<ApprovalRegistry>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "could not install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("daemon received shutdown signal");

    // Approval requests would otherwise hold graceful shutdown until their
    // deadline, including ones that arrive while connections drain.
    let released = registry.close();
    if released > 0 {
        info!(released, "released pending approvals");
    }
}
