use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AccountId = i64;
pub type RoomId = i64;

/// Identity of a connected user. Authentication happens outside this crate;
/// the gateway only needs the id and the display nickname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub nickname: String,
}

/// Which side of a room a participant is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Borrower,
    Lender,
}

/// A two-party chat room. `borrower_present` / `lender_present` record whether
/// the participant is still a member (has not voluntarily left); they say
/// nothing about live connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chatroom {
    pub id: RoomId,
    pub borrower_id: AccountId,
    pub lender_id: AccountId,
    pub product_id: Option<i64>,
    pub borrower_present: bool,
    pub lender_present: bool,
}

impl Chatroom {
    pub fn role_of(&self, user_id: AccountId) -> Option<Role> {
        if user_id == self.borrower_id {
            Some(Role::Borrower)
        } else if user_id == self.lender_id {
            Some(Role::Lender)
        } else {
            None
        }
    }

    /// True when `user_id` is a participant and has not left the room.
    pub fn is_member(&self, user_id: AccountId) -> bool {
        match self.role_of(user_id) {
            Some(Role::Borrower) => self.borrower_present,
            Some(Role::Lender) => self.lender_present,
            None => false,
        }
    }

    pub fn opponent_of(&self, user_id: AccountId) -> Option<AccountId> {
        match self.role_of(user_id)? {
            Role::Borrower => Some(self.lender_id),
            Role::Lender => Some(self.borrower_id),
        }
    }
}

/// A message as stored durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub chatroom_id: RoomId,
    pub sender_id: AccountId,
    pub sender_nickname: String,
    pub text: String,
    pub image: Option<String>,
    pub unread: bool,
    pub created_at: DateTime<Utc>,
}

/// A message waiting in the ephemeral per-room buffer.
///
/// `sender_nickname` is a value copy kept only for rendering and read-state
/// matching; it is dropped when the entry is flushed. `image` holds the raw
/// `data:` URL until flush decodes it into a stored blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferedMessage {
    pub text: String,
    pub sender_nickname: String,
    pub sender_id: AccountId,
    pub chatroom_id: RoomId,
    pub unread: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Row shape handed to the durable store by the flush path.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub chatroom_id: RoomId,
    pub sender_id: AccountId,
    pub text: String,
    pub image: Option<String>,
    pub unread: bool,
    pub created_at: DateTime<Utc>,
}

/// One entry of a merged history page; the same shape regardless of which
/// store the message came from. `id` is `None` for still-buffered entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: Option<i64>,
    pub chatroom_id: RoomId,
    pub sender_id: AccountId,
    pub nickname: String,
    pub text: String,
    pub image: Option<String>,
    pub unread: bool,
    pub created_at: DateTime<Utc>,
}

impl From<Message> for HistoryEntry {
    fn from(m: Message) -> Self {
        Self {
            id: Some(m.id),
            chatroom_id: m.chatroom_id,
            sender_id: m.sender_id,
            nickname: m.sender_nickname,
            text: m.text,
            image: m.image,
            unread: m.unread,
            created_at: m.created_at,
        }
    }
}

impl From<BufferedMessage> for HistoryEntry {
    fn from(m: BufferedMessage) -> Self {
        Self {
            id: None,
            chatroom_id: m.chatroom_id,
            sender_id: m.sender_id,
            nickname: m.sender_nickname,
            text: m.text,
            image: m.image,
            unread: m.unread,
            created_at: m.created_at,
        }
    }
}

// -- Rentals --

/// Rental lifecycle. Variants are declared in lifecycle order so the derived
/// `Ord` is the transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RentalStatus {
    Request,
    Accept,
    Borrowing,
    Returned,
}

impl RentalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Request => "REQUEST",
            Self::Accept => "ACCEPT",
            Self::Borrowing => "BORROWING",
            Self::Returned => "RETURNED",
        }
    }

    /// Transitions only ever move forward.
    pub fn can_transition_to(self, next: RentalStatus) -> bool {
        next > self
    }
}

impl fmt::Display for RentalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRentalStatus(pub String);

impl fmt::Display for UnknownRentalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown rental status '{}'", self.0)
    }
}

impl std::error::Error for UnknownRentalStatus {}

impl FromStr for RentalStatus {
    type Err = UnknownRentalStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REQUEST" => Ok(Self::Request),
            "ACCEPT" => Ok(Self::Accept),
            "BORROWING" => Ok(Self::Borrowing),
            "RETURNED" => Ok(Self::Returned),
            other => Err(UnknownRentalStatus(other.to_string())),
        }
    }
}

/// A rental joined with the product and participant names needed to
/// render notifications.
#[derive(Debug, Clone, PartialEq)]
pub struct RentalDetail {
    pub id: i64,
    pub product_id: i64,
    pub product_name: String,
    pub product_image: Option<String>,
    pub borrower_id: AccountId,
    pub borrower_nickname: String,
    pub lender_id: AccountId,
    pub lender_nickname: String,
    pub status: RentalStatus,
    pub rental_date: DateTime<Utc>,
    pub return_date: DateTime<Utc>,
}

// -- Notifications --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalNotification {
    pub id: i64,
    pub text: String,
    pub image: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A per-user confirmation row joined with its notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfirmView {
    pub id: i64,
    pub notification_id: i64,
    pub text: String,
    pub image: Option<String>,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}

/// A rental notification joined with its rental, product and participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RentalNotificationView {
    pub id: i64,
    pub recipient: AccountId,
    pub text: String,
    pub product_name: Option<String>,
    pub product_image: Option<String>,
    pub borrower: Option<String>,
    pub lender: Option<String>,
    pub rental_date: Option<DateTime<Utc>>,
    pub return_date: Option<DateTime<Utc>>,
    pub status: Option<RentalStatus>,
    pub acknowledged: bool,
    pub created_at: DateTime<Utc>,
}
