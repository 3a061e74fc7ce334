use crate::{config, errors::Result};

pub async fn execute() -> Result<()> {
    let config = config::load()?;
    println!("Config: {}", config::config_path()?.display());

    if config.telegram.is_configured() {
        println!("✅ Telegram credentials present");
    } else {
        println!("⚠️ Telegram not configured (notifications stay local)");
    }
    if config.desktop_enabled {
        println!("✅ Desktop notifications enabled");
    } else {
        println!("⚠️ Desktop notifications disabled");
    }

    match super::fetch_health(&config).await {
        Ok(health) => println!(
            "✅ Daemon reachable at {} ({} pending approvals)",
            config.bind, health["pending_approvals"]
        ),
        Err(err) => println!("⚠️ Daemon unreachable ({err})"),
    }

    Ok(())
}
