pub mod desktop;
pub mod format;
pub mod telegram;

use async_trait::async_trait;
use serde::Serialize;

use crate::{approvals::ApprovalId, errors::Result, models::event::NotificationEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Desktop,
    Telegram,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn kind(&self) -> ChannelKind;

    async fn send(&self, event: &NotificationEvent, approval: Option<ApprovalId>) -> Result<()>;
}
