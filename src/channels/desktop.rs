use async_trait::async_trait;
use notify_rust::{Notification, Timeout};
#[cfg(not(all(unix, not(target_os = "macos"))))]
use tracing::debug;

use super::{ChannelKind, Notifier, format};
use crate::{
    approvals::ApprovalId,
    config::Config,
    errors::{AppError, Result},
    models::event::NotificationEvent,
};

#[derive(Debug, Clone)]
pub struct DesktopChannel {
    terminal_app: String,
    sound: Option<String>,
}

impl DesktopChannel {
    pub fn from_config(config: &Config) -> Self {
        Self {
            terminal_app: config.terminal_app.clone(),
            sound: config.sound.clone(),
        }
    }
}

#[async_trait]
impl Notifier for DesktopChannel {
    fn kind(&self) -> ChannelKind {
        ChannelKind::Desktop
    }

    async fn send(&self, event: &NotificationEvent, _approval: Option<ApprovalId>) -> Result<()> {
        let title = format::desktop_title(event);
        let body = event.message.clone();
        let channel = self.clone();

        tokio::task::spawn_blocking(move || channel.show(&title, &body))
            .await
            .map_err(|err| AppError::DesktopNotification(err.to_string()))?
    }
}

impl DesktopChannel {
    fn show(self, title: &str, body: &str) -> Result<()> {
        let mut notification = Notification::new();
        notification
            .summary(title)
            .body(body)
            .appname("nudge")
            .timeout(Timeout::Milliseconds(5000));
        if let Some(sound) = self.sound.as_deref() {
            notification.sound_name(sound);
        }

        #[cfg(all(unix, not(target_os = "macos")))]
        {
            let capabilities = notify_rust::get_capabilities().unwrap_or_default();
            if !click_to_focus(&capabilities) {
                notification
                    .show()
                    .map_err(|err| AppError::DesktopNotification(err.to_string()))?;
                tracing::debug!(?capabilities, "notification server cannot close clicks, skipping focus action");
                return Ok(());
            }
            notification.action("default", "Open terminal");
            let handle = notification
                .show()
                .map_err(|err| AppError::DesktopNotification(err.to_string()))?;
            // Blocks this pool thread until the notification is clicked or expires.
            handle.wait_for_action(|action| {
                if action == "default" {
                    activate_terminal(&self.terminal_app);
                }
            });
        }

        #[cfg(not(all(unix, not(target_os = "macos"))))]
        {
            notification
                .show()
                .map_err(|err| AppError::DesktopNotification(err.to_string()))?;
            debug!(terminal_app = %self.terminal_app, "click-to-focus unsupported on this platform");
        }

        Ok(())
    }
}

// Servers with persistence keep expired notifications in a tray, so the action
// wait would never return.
#[cfg(all(unix, not(target_os = "macos")))]
fn click_to_focus(capabilities: &[String]) -> bool {
    capabilities.iter().any(|cap| cap == "actions")
        && !capabilities.iter().any(|cap| cap == "persistence")
}

#[cfg(all(unix, not(target_os = "macos")))]
fn activate_terminal(terminal_app: &str) {
    let status = std::process::Command::new("wmctrl")
        .args(["-x", "-a", terminal_app])
        .status();
    match status {
        Ok(status) if status.success() => tracing::debug!(terminal_app, "terminal activated"),
        Ok(status) => tracing::warn!(terminal_app, %status, "terminal activation failed"),
        Err(err) => tracing::warn!(terminal_app, error = %err, "terminal activation unavailable"),
    }
}
