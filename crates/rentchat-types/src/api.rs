use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Account, AccountId, HistoryEntry, RentalDetail, RentalStatus, RoomId};

// -- JWT Claims --

/// Session claims shared by the HTTP middleware and the WebSocket handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: AccountId,
    pub nickname: String,
    pub exp: usize,
}

impl Claims {
    pub fn account(&self) -> Account {
        Account {
            id: self.sub,
            nickname: self.nickname.clone(),
        }
    }
}

// -- Chat rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateChatroomRequest {
    pub product_id: i64,
}

#[derive(Debug, Serialize)]
pub struct ChatroomSummary {
    pub id: RoomId,
    pub opponent_id: AccountId,
    pub product_id: Option<i64>,
    pub last_message: Option<HistoryEntry>,
    pub unread_count: u64,
}

#[derive(Debug, Serialize)]
pub struct ChatroomHistory {
    pub chatroom_id: RoomId,
    pub messages: Vec<HistoryEntry>,
}

// -- Notifications --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateGlobalNotificationRequest {
    pub text: String,
    #[serde(default)]
    pub image: Option<String>,
}

// -- Rentals --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateRentalRequest {
    pub product_id: i64,
    pub rental_date: DateTime<Utc>,
    pub return_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateRentalStatusRequest {
    pub status: RentalStatus,
}

#[derive(Debug, Serialize)]
pub struct RentalResponse {
    pub id: i64,
    pub product_id: i64,
    pub borrower_id: AccountId,
    pub lender_id: AccountId,
    pub status: RentalStatus,
    pub rental_date: DateTime<Utc>,
    pub return_date: DateTime<Utc>,
}

impl From<&RentalDetail> for RentalResponse {
    fn from(r: &RentalDetail) -> Self {
        Self {
            id: r.id,
            product_id: r.product_id,
            borrower_id: r.borrower_id,
            lender_id: r.lender_id,
            status: r.status,
            rental_date: r.rental_date,
            return_date: r.return_date,
        }
    }
}
