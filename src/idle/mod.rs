use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait IdleDetector: Send + Sync {
    async fn idle_seconds(&self) -> u64;

    async fn screen_locked(&self) -> bool {
        false
    }
}

#[derive(Debug, Clone)]
pub struct SystemIdleDetector {
    command_timeout: Duration,
}

impl Default for SystemIdleDetector {
    fn default() -> Self {
        Self {
            command_timeout: COMMAND_TIMEOUT,
        }
    }
}

#[async_trait]
impl IdleDetector for SystemIdleDetector {
    async fn idle_seconds(&self) -> u64 {
        let reading = if cfg!(target_os = "macos") {
            self.query("ioreg", &["-c", "IOHIDSystem", "-d", "4"])
                .await
                .and_then(|out| parse_hid_idle_time(&out))
        } else {
            self.query("xprintidle", &[])
                .await
                .and_then(|out| parse_xprintidle(&out))
        };
        reading.unwrap_or(0)
    }

    async fn screen_locked(&self) -> bool {
        if cfg!(target_os = "macos") {
            self.query("ioreg", &["-n", "Root", "-d1"])
                .await
                .is_some_and(|out| parse_cgsession_locked(&out))
        } else {
            let session = std::env::var("XDG_SESSION_ID").unwrap_or_else(|_| "auto".to_string());
            self.query("loginctl", &["show-session", session.as_str(), "-p", "LockedHint"])
                .await
                .is_some_and(|out| parse_locked_hint(&out))
        }
    }
}

impl SystemIdleDetector {
    async fn query(&self, program: &str, args: &[&str]) -> Option<String> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.command_timeout, child).await {
            Ok(Ok(output)) if output.status.success() => output,
            Ok(Ok(output)) => {
                debug!(program, status = %output.status, "idle query failed");
                return None;
            }
            Ok(Err(err)) => {
                debug!(program, error = %err, "idle query unavailable");
                return None;
            }
            Err(_) => {
                debug!(program, "idle query timed out");
                return None;
            }
        };
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// `"HIDIdleTime" = 1234567890` is reported in nanoseconds.
fn parse_hid_idle_time(output: &str) -> Option<u64> {
    output
        .lines()
        .find(|line| line.contains("\"HIDIdleTime\""))
        .and_then(|line| line.split('=').nth(1))
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(|nanos| nanos / 1_000_000_000)
}

/// `xprintidle` prints milliseconds.
fn parse_xprintidle(output: &str) -> Option<u64> {
    output.trim().parse::<u64>().ok().map(|millis| millis / 1000)
}

fn parse_cgsession_locked(output: &str) -> bool {
    output.contains("\"CGSSessionScreenIsLocked\"=Yes")
}

fn parse_locked_hint(output: &str) -> bool {
    output.trim().eq_ignore_ascii_case("LockedHint=yes")
}
