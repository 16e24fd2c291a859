use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::domain::{ChannelId, MessageId, UserId, WorkspaceId};

/// Raw events raised by one live session.
#[derive(Clone, Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Error(String),
    Message(InboundMessage),
    ButtonClicked(ButtonClick),
}

impl TransportEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Connected => "connected",
            TransportEvent::Disconnected => "disconnected",
            TransportEvent::Error(_) => "error",
            TransportEvent::Message(_) => "message",
            TransportEvent::ButtonClicked(_) => "button_clicked",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub channel_id: ChannelId,
    pub workspace_id: Option<WorkspaceId>,
    pub author_id: UserId,
    pub message_id: Option<MessageId>,
    pub text: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct ButtonClick {
    pub channel_id: ChannelId,
    pub user_id: UserId,
    pub message_id: Option<MessageId>,
    pub custom_id: String,
}

/// Who the session is logged in as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub username: Option<String>,
}

impl InboundMessage {
    pub fn text(channel_id: ChannelId, author_id: UserId, text: impl Into<String>) -> Self {
        Self {
            channel_id,
            workspace_id: None,
            author_id,
            message_id: None,
            text: text.into(),
            received_at: Utc::now(),
        }
    }

    /// First 30 characters, for log lines.
    pub fn preview(&self) -> String {
        self.text.chars().take(30).collect()
    }
}
