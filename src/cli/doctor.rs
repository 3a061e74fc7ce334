use crate::{
    channels::telegram::TelegramClient,
    config,
    errors::{AppError, Result},
    idle::{IdleDetector, SystemIdleDetector},
};

pub async fn execute() -> Result<()> {
    let config = config::load()?;

    println!("Doctor checks:");
    let mut failures = Vec::new();

    match config.bind_addr() {
        Ok(addr) if addr.ip().is_loopback() => println!("✅ bind address {addr}"),
        Ok(addr) => println!("⚠️ bind address {addr} is reachable beyond this machine"),
        Err(err) => {
            println!("❌ {err}");
            failures.push("invalid bind address".to_string());
        }
    }

    if config.telegram.is_configured() {
        let username = match TelegramClient::from_config(&config.telegram) {
            Ok(client) => client.get_bot_username().await,
            Err(err) => Err(err),
        };
        match username {
            Ok(username) => println!("✅ telegram auth ok (@{username})"),
            Err(err) => {
                println!("❌ telegram auth failed ({err})");
                failures.push("telegram auth failed".to_string());
            }
        }
    } else {
        println!("⚠️ telegram not configured");
    }

    let detector = SystemIdleDetector::default();
    println!(
        "✅ idle detection reads {}s (threshold {}s)",
        detector.idle_seconds().await,
        config.telegram.idle_threshold_seconds
    );
    if config.telegram.send_on_screen_lock {
        println!("✅ screen locked: {}", detector.screen_locked().await);
    }

    match super::fetch_health(&config).await {
        Ok(_) => println!("✅ daemon reachable"),
        Err(err) => {
            println!("❌ {err}");
            failures.push("daemon unreachable".to_string());
        }
    }

    if failures.is_empty() {
        println!("Healthy ✅");
        Ok(())
    } else {
        Err(AppError::DoctorUnhealthy(failures.join("; ")))
    }
}
