//! Notification fan-out: global broadcasts, rental status changes and
//! unread-chat alerts, plus the connect-time backlog and acknowledgements.
//!
//! Rental and chat events are published to the room's notification group,
//! which both participants listen on. Each listener filters locally before
//! forwarding (see [`crate::notification`]).

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use rentchat_db::Database;
use rentchat_ephemeral::EphemeralStore;
use rentchat_types::events::{NotificationBacklog, NotificationCommand, NotificationEvent};
use rentchat_types::models::{
    AccountId, BufferedMessage, GlobalNotification, RentalDetail, RentalNotificationView,
    RentalStatus,
};

use crate::buffer::decode_lenient;
use crate::dispatcher::{Dispatcher, GroupEvent};
use crate::{GLOBAL_NOTIFICATION_GROUP, buffer_key, chat_notification_group, run_blocking};

#[derive(Debug, thiserror::Error)]
pub enum RentalError {
    #[error("rental {0} not found")]
    NotFound(i64),

    #[error("rental cannot move from {from} to {to}")]
    InvalidTransition { from: RentalStatus, to: RentalStatus },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct GlobalBroadcast {
    pub notification: GlobalNotification,
    /// Confirmation rows created for existing accounts.
    pub confirms: usize,
    /// Local connections the event was handed to.
    pub delivered: usize,
}

#[derive(Debug, Clone)]
pub struct RentalUpdate {
    pub rental: RentalDetail,
    pub notification: RentalNotificationView,
    pub delivered: usize,
}

/// Recipient and text of the notification a rental in `rental.status`
/// produces. The lender hears about requests; the borrower hears about
/// everything after.
pub fn rental_notice(rental: &RentalDetail) -> (AccountId, String) {
    match rental.status {
        RentalStatus::Request => (
            rental.lender_id,
            format!(
                "{} asked to rent {}. Review the request.",
                rental.borrower_nickname, rental.product_name
            ),
        ),
        RentalStatus::Accept => (
            rental.borrower_id,
            format!("Your request to rent {} was accepted.", rental.product_name),
        ),
        RentalStatus::Borrowing => (
            rental.borrower_id,
            format!(
                "Your rental of {} has started. Please return it by {}.",
                rental.product_name,
                rental.return_date.date_naive()
            ),
        ),
        RentalStatus::Returned => (
            rental.borrower_id,
            format!("{} was returned successfully.", rental.product_name),
        ),
    }
}

#[derive(Clone)]
pub struct NotificationEngine {
    db: Arc<Database>,
    store: Arc<dyn EphemeralStore>,
    dispatcher: Dispatcher,
}

impl NotificationEngine {
    pub fn new(db: Arc<Database>, store: Arc<dyn EphemeralStore>, dispatcher: Dispatcher) -> Self {
        Self {
            db,
            store,
            dispatcher,
        }
    }

    /// Create a broadcast, give every known account an unacknowledged
    /// confirmation row, then publish to the global group.
    pub async fn broadcast_global(&self, text: String, image: Option<String>) -> Result<GlobalBroadcast> {
        let db = self.db.clone();
        let (notification, confirms) = run_blocking(move || {
            let notification = db.create_global_notification(&text, image.as_deref())?;
            let confirms = db.create_confirms_for_all(notification.id)?;
            Ok((notification, confirms))
        })
        .await?;

        let delivered = self
            .dispatcher
            .group_send(GLOBAL_NOTIFICATION_GROUP, GroupEvent::Global(notification.clone()))
            .await;
        info!(
            "Global notification {} created ({} confirms, {} local listeners)",
            notification.id, confirms, delivered
        );

        Ok(GlobalBroadcast {
            notification,
            confirms,
            delivered,
        })
    }

    /// Open a rental in the REQUEST state and notify the lender.
    pub async fn request_rental(
        &self,
        product_id: i64,
        borrower_id: AccountId,
        rental_date: DateTime<Utc>,
        return_date: DateTime<Utc>,
    ) -> Result<RentalUpdate, RentalError> {
        let db = self.db.clone();
        let rental_id = run_blocking(move || {
            db.create_rental(product_id, borrower_id, rental_date, return_date)
        })
        .await?;
        self.publish_rental(rental_id).await
    }

    /// Move a rental forward and notify the borrower. Backward or repeated
    /// transitions are rejected without side effects.
    pub async fn transition_rental(
        &self,
        rental_id: i64,
        next: RentalStatus,
    ) -> Result<RentalUpdate, RentalError> {
        let db = self.db.clone();
        let current = run_blocking(move || db.get_rental(rental_id))
            .await?
            .ok_or(RentalError::NotFound(rental_id))?;
        if !current.status.can_transition_to(next) {
            return Err(RentalError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        let db = self.db.clone();
        run_blocking(move || db.update_rental_status(rental_id, next)).await?;
        self.publish_rental(rental_id).await
    }

    /// Persist the notification for the rental's current state and publish
    /// it to the notification group of the room about this rental.
    async fn publish_rental(&self, rental_id: i64) -> Result<RentalUpdate, RentalError> {
        let db = self.db.clone();
        let (rental, notification, room) = run_blocking(move || {
            let rental = db
                .get_rental(rental_id)?
                .ok_or_else(|| anyhow::anyhow!("rental {} vanished", rental_id))?;
            let (recipient, text) = rental_notice(&rental);
            let id = db.insert_rental_notification(recipient, Some(rental.id), &text)?;
            let notification = db
                .get_rental_notification(id)?
                .ok_or_else(|| anyhow::anyhow!("rental notification {} vanished", id))?;
            let room = db.find_chatroom(rental.product_id, rental.borrower_id, rental.lender_id)?;
            Ok((rental, notification, room))
        })
        .await?;

        let delivered = match room {
            Some(room_id) => {
                self.dispatcher
                    .group_send(
                        &chat_notification_group(room_id),
                        GroupEvent::Rental(notification.clone()),
                    )
                    .await
            }
            None => {
                debug!("Rental {} has no chat room; notification stored only", rental.id);
                0
            }
        };
        info!(
            "Rental {} is {}; notified account {}",
            rental.id, rental.status, notification.recipient
        );

        Ok(RentalUpdate {
            rental,
            notification,
            delivered,
        })
    }

    /// Tell the room's notification listeners about an unread message.
    pub async fn notify_unread_chat(&self, message: &BufferedMessage) -> usize {
        self.dispatcher
            .group_send(
                &chat_notification_group(message.chatroom_id),
                GroupEvent::ChatUnread(message.clone()),
            )
            .await
    }

    /// Everything `user_id` missed: unacknowledged global and rental
    /// notifications, and the newest unread incoming message of each room
    /// the user is still a member of, in room order.
    pub async fn backlog(&self, user_id: AccountId) -> Result<NotificationBacklog> {
        let db = self.db.clone();
        let store = self.store.clone();
        run_blocking(move || {
            let mut backlog = NotificationBacklog {
                global_notification: db.unacknowledged_global(user_id)?,
                rental_notification: db.unacknowledged_rental(user_id)?,
                chat_notification: Vec::new(),
            };

            for room in db.member_chatrooms(user_id)? {
                let raw = store.list_range(&buffer_key(room.id), 0, -1)?;
                let buffered = decode_lenient(room.id, &raw)
                    .into_iter()
                    .rev()
                    .find(|m| m.unread && m.sender_id != user_id);
                let event = match buffered {
                    Some(message) => Some(NotificationEvent::from(&message)),
                    None => db
                        .latest_unread_from_others(room.id, user_id)?
                        .map(|m| NotificationEvent::ChatNotification {
                            chatroom_id: m.chatroom_id,
                            text: m.text,
                            nickname: m.sender_nickname,
                            image: m.image,
                            created_at: m.created_at,
                        }),
                };
                backlog.chat_notification.extend(event);
            }
            Ok(backlog)
        })
        .await
    }

    /// Apply a client acknowledgement. Returns whether a row changed.
    pub async fn acknowledge(&self, user_id: AccountId, command: NotificationCommand) -> Result<bool> {
        let db = self.db.clone();
        let changed = run_blocking(move || match command {
            NotificationCommand::GlobalConfirm { notification_id } => {
                db.acknowledge_global(user_id, notification_id)
            }
            NotificationCommand::RentalConfirm { notification_id } => {
                db.acknowledge_rental(user_id, notification_id)
            }
        })
        .await?;
        Ok(changed > 0)
    }

    /// Make sure `user_id` has a confirmation row for a global notification
    /// it is about to receive.
    pub async fn confirm_delivery(&self, user_id: AccountId, notification_id: i64) -> Result<bool> {
        let db = self.db.clone();
        run_blocking(move || db.ensure_global_confirm(user_id, notification_id)).await
    }
}
