use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{
    AccountId, BufferedMessage, GlobalConfirmView, GlobalNotification, RentalNotificationView,
    RentalStatus, RoomId,
};

// -- Chat endpoint --

/// Payload a client sends over a chat connection. The sender is implied by
/// the session identity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChatInbound {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpponentState {
    Online,
    Offline,
}

impl OpponentState {
    pub fn from_online(online: bool) -> Self {
        if online { Self::Online } else { Self::Offline }
    }
}

/// Events sent to chat connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    ChatMessage {
        text: String,
        nickname: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
        unread: bool,
        created_at: DateTime<Utc>,
    },

    /// Presence change in the room. `nickname` is the participant whose
    /// connection triggered the alert.
    Alert {
        text: String,
        nickname: String,
        opponent_state: OpponentState,
        unread: bool,
    },
}

impl ChatEvent {
    pub fn message(msg: &BufferedMessage) -> Self {
        Self::ChatMessage {
            text: msg.text.clone(),
            nickname: msg.sender_nickname.clone(),
            image: msg.image.clone(),
            unread: msg.unread,
            created_at: msg.created_at,
        }
    }

    pub fn alert(nickname: &str, state: OpponentState) -> Self {
        let text = match state {
            OpponentState::Online => "The other participant is online.",
            OpponentState::Offline => "The other participant is offline.",
        };
        Self::Alert {
            text: text.to_string(),
            nickname: nickname.to_string(),
            opponent_state: state,
            unread: false,
        }
    }
}

// -- Notification endpoint --

/// Commands a client sends over the notification connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum NotificationCommand {
    #[serde(rename = "notification.global.confirm")]
    GlobalConfirm { notification_id: i64 },

    #[serde(rename = "notification.rental.confirm")]
    RentalConfirm { notification_id: i64 },
}

/// Events delivered to notification connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    GlobalNotification {
        id: i64,
        text: String,
        image: Option<String>,
        created_at: DateTime<Utc>,
    },

    RentalNotification {
        id: i64,
        recipient: AccountId,
        text: String,
        product_name: Option<String>,
        product_image: Option<String>,
        borrower: Option<String>,
        lender: Option<String>,
        rental_date: Option<DateTime<Utc>>,
        return_date: Option<DateTime<Utc>>,
        status: Option<RentalStatus>,
        created_at: DateTime<Utc>,
    },

    ChatNotification {
        chatroom_id: RoomId,
        text: String,
        nickname: String,
        image: Option<String>,
        created_at: DateTime<Utc>,
    },
}

impl From<&GlobalNotification> for NotificationEvent {
    fn from(n: &GlobalNotification) -> Self {
        Self::GlobalNotification {
            id: n.id,
            text: n.text.clone(),
            image: n.image.clone(),
            created_at: n.created_at,
        }
    }
}

impl From<&RentalNotificationView> for NotificationEvent {
    fn from(n: &RentalNotificationView) -> Self {
        Self::RentalNotification {
            id: n.id,
            recipient: n.recipient,
            text: n.text.clone(),
            product_name: n.product_name.clone(),
            product_image: n.product_image.clone(),
            borrower: n.borrower.clone(),
            lender: n.lender.clone(),
            rental_date: n.rental_date,
            return_date: n.return_date,
            status: n.status,
            created_at: n.created_at,
        }
    }
}

impl From<&BufferedMessage> for NotificationEvent {
    fn from(m: &BufferedMessage) -> Self {
        Self::ChatNotification {
            chatroom_id: m.chatroom_id,
            text: m.text.clone(),
            nickname: m.sender_nickname.clone(),
            image: m.image.clone(),
            created_at: m.created_at,
        }
    }
}

/// Everything a notification connection missed, sent once right after accept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationBacklog {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub global_notification: Vec<GlobalConfirmView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rental_notification: Vec<RentalNotificationView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chat_notification: Vec<NotificationEvent>,
}

impl NotificationBacklog {
    pub fn is_empty(&self) -> bool {
        self.global_notification.is_empty()
            && self.rental_notification.is_empty()
            && self.chat_notification.is_empty()
    }
}

// -- Close codes --

/// WebSocket close codes used by both endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    UnsupportedData = 1003,
    PolicyViolation = 1008,
    InternalError = 1011,
}

impl CloseCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_event_uses_snake_case_tags() {
        let alert = ChatEvent::alert("bora", OpponentState::Offline);
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["type"], "alert");
        assert_eq!(json["opponent_state"], "offline");
        assert_eq!(json["unread"], false);
    }

    #[test]
    fn commands_parse_dotted_names() {
        let cmd: NotificationCommand = serde_json::from_str(
            r#"{"command":"notification.rental.confirm","notification_id":7}"#,
        )
        .unwrap();
        assert_eq!(cmd, NotificationCommand::RentalConfirm { notification_id: 7 });

        let unknown = serde_json::from_str::<NotificationCommand>(
            r#"{"command":"notification.chat.confirm","notification_id":7}"#,
        );
        assert!(unknown.is_err());
    }

    #[test]
    fn chat_inbound_rejects_unknown_fields() {
        assert!(serde_json::from_str::<ChatInbound>(r#"{"text":"hi"}"#).is_ok());
        assert!(serde_json::from_str::<ChatInbound>(r#"{"text":"hi","sender":"x"}"#).is_err());
    }

    #[test]
    fn empty_backlog_sections_are_omitted() {
        let backlog = NotificationBacklog::default();
        assert!(backlog.is_empty());
        assert_eq!(serde_json::to_string(&backlog).unwrap(), "{}");
    }
}
