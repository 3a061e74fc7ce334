use std::collections::BTreeSet;

use crate::{channels::ChannelKind, config::Config, models::event::EventKind};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    pub idle_seconds: u64,
    pub screen_locked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingReason {
    Idle,
    PermissionFilter,
    Forced,
}

impl RoutingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PermissionFilter => "permission_filter",
            Self::Forced => "forced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingDecision {
    pub channels: BTreeSet<ChannelKind>,
    /// `None` when routing stays local.
    pub reason: Option<RoutingReason>,
}

impl RoutingDecision {
    pub fn includes(&self, channel: ChannelKind) -> bool {
        self.channels.contains(&channel)
    }
}

pub fn decide(
    config: &Config,
    kind: EventKind,
    presence: Presence,
    telegram_available: bool,
) -> RoutingDecision {
    let mut channels = BTreeSet::new();
    if config.desktop_enabled {
        channels.insert(ChannelKind::Desktop);
    }

    let threshold = config.telegram.idle_threshold_seconds;
    let forced =
        threshold == 0 || (presence.screen_locked && config.telegram.send_on_screen_lock);
    let reason = if !telegram_available {
        None
    } else if forced {
        Some(RoutingReason::Forced)
    } else if presence.idle_seconds >= threshold {
        Some(RoutingReason::Idle)
    } else if kind == EventKind::PermissionRequest {
        Some(RoutingReason::PermissionFilter)
    } else {
        None
    };

    if reason.is_some() {
        channels.insert(ChannelKind::Telegram);
    }
    RoutingDecision { channels, reason }
}
