//! Notification endpoint: one connection per signed-in account.
//!
//! The connection joins the global group and the notification group of every
//! room the account is a member of at connect time. Rental and chat events on
//! a room group reach both participants; [`NotificationFilter`] keeps only
//! the ones meant for this account.

use std::panic::AssertUnwindSafe;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rentchat_types::events::{NotificationBacklog, NotificationCommand, NotificationEvent};
use rentchat_types::models::Account;

use crate::connection::{
    ConnectionState, Outbound, PongFlag, close_message, finish_writer, run_writer, send_json,
};
use crate::dispatcher::{ConnId, GroupEvent};
use crate::error::CloseFrame;
use crate::{GLOBAL_NOTIFICATION_GROUP, Gateway, chat_notification_group, run_blocking};

/// Per-connection delivery filter.
#[derive(Clone)]
pub struct NotificationFilter {
    gateway: Gateway,
    account: Account,
}

impl NotificationFilter {
    pub fn new(gateway: Gateway, account: Account) -> Self {
        Self { gateway, account }
    }

    /// Decide whether `event` goes to this client. Global notifications first
    /// make sure the account has a confirmation row for them.
    pub async fn deliver(&self, event: GroupEvent) -> Option<NotificationEvent> {
        match event {
            GroupEvent::Global(notification) => {
                if let Err(e) = self
                    .gateway
                    .notifications()
                    .confirm_delivery(self.account.id, notification.id)
                    .await
                {
                    error!(
                        "Could not record delivery of notification {} to {}: {}",
                        notification.id, self.account.id, e
                    );
                }
                Some(NotificationEvent::from(&notification))
            }
            GroupEvent::Rental(notification) if notification.recipient == self.account.id => {
                Some(NotificationEvent::from(&notification))
            }
            GroupEvent::ChatUnread(message) if message.sender_nickname != self.account.nickname => {
                Some(NotificationEvent::from(&message))
            }
            _ => None,
        }
    }
}

pub struct NotificationSession {
    gateway: Gateway,
    account: Account,
    conn_id: ConnId,
    groups: Vec<String>,
    state: ConnectionState,
}

impl NotificationSession {
    /// Join the global group and one group per member room.
    pub async fn open(
        gateway: &Gateway,
        account: Account,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GroupEvent>), CloseFrame> {
        let mut state = ConnectionState::Connecting;
        state.advance(ConnectionState::Validating);
        let db = gateway.db().clone();
        let user_id = account.id;
        let rooms = run_blocking(move || db.member_chatrooms(user_id))
            .await
            .map_err(|e| {
                error!("Room lookup for account {} failed: {}", user_id, e);
                CloseFrame::internal("room lookup failed")
            })?;

        let conn_id = Uuid::new_v4();
        let mut groups = vec![GLOBAL_NOTIFICATION_GROUP.to_string()];
        groups.extend(rooms.iter().map(|room| chat_notification_group(room.id)));

        let (tx, rx) = mpsc::unbounded_channel();
        for group in &groups {
            gateway.dispatcher().group_add(group, conn_id, tx.clone()).await;
        }
        state.advance(ConnectionState::Joined);
        info!(
            "{} ({}) listening for notifications on {} groups",
            account.nickname,
            account.id,
            groups.len()
        );

        Ok((
            Self {
                gateway: gateway.clone(),
                account,
                conn_id,
                groups,
                state,
            },
            rx,
        ))
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn filter(&self) -> NotificationFilter {
        NotificationFilter::new(self.gateway.clone(), self.account.clone())
    }

    /// The consolidated backlog sent once on accept. Marks the session active.
    pub async fn backlog(&mut self) -> Result<NotificationBacklog, CloseFrame> {
        let backlog = self
            .gateway
            .notifications()
            .backlog(self.account.id)
            .await
            .map_err(|e| {
                error!("Backlog for account {} failed: {}", self.account.id, e);
                CloseFrame::internal("backlog unavailable")
            })?;
        self.state.advance(ConnectionState::Active);
        Ok(backlog)
    }

    /// Handle one inbound command frame.
    pub async fn handle_text(&mut self, raw: &str) -> Result<(), CloseFrame> {
        let command: NotificationCommand = serde_json::from_str(raw)
            .map_err(|e| CloseFrame::unsupported(format!("unknown command: {e}")))?;
        let changed = self
            .gateway
            .notifications()
            .acknowledge(self.account.id, command.clone())
            .await
            .map_err(|e| {
                error!("Acknowledgement by {} failed: {}", self.account.id, e);
                CloseFrame::internal("could not record acknowledgement")
            })?;
        debug!("{:?} from {} changed={}", command, self.account.id, changed);
        Ok(())
    }

    pub async fn close(mut self) {
        self.state.advance(ConnectionState::Closing);
        for group in &self.groups {
            self.gateway.dispatcher().group_discard(group, self.conn_id).await;
        }
        self.state.advance(ConnectionState::Closed);
        info!(
            "{} ({}) stopped listening for notifications",
            self.account.nickname, self.account.id
        );
    }
}

/// Drive a notification socket until either side goes away.
pub async fn serve_notifications(socket: WebSocket, gateway: Gateway, account: Account) {
    let (mut sender, mut receiver) = socket.split();

    let (mut session, events) = match NotificationSession::open(&gateway, account).await {
        Ok(opened) => opened,
        Err(frame) => {
            let _ = sender.send(close_message(&frame)).await;
            return;
        }
    };

    match session.backlog().await {
        Ok(backlog) if backlog.is_empty() => {}
        Ok(backlog) => {
            if !send_json(&mut sender, &backlog).await {
                session.close().await;
                return;
            }
        }
        Err(frame) => {
            let _ = sender.send(close_message(&frame)).await;
            session.close().await;
            return;
        }
    }

    let filter = session.filter();
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let pong = PongFlag::new();
    let mut writer = tokio::spawn(run_writer(
        sender,
        events,
        control_rx,
        pong.clone(),
        move |event| {
            let filter = filter.clone();
            async move {
                let event = filter.deliver(event).await?;
                serde_json::to_string(&event).ok()
            }
        },
    ));

    let writer_done = tokio::select! {
        _ = &mut writer => true,
        _ = read_commands(&mut receiver, &mut session, &control_tx, &pong) => false,
    };

    session.close().await;
    drop(control_tx);
    if !writer_done {
        finish_writer(writer).await;
    }
}

async fn read_commands(
    receiver: &mut SplitStream<WebSocket>,
    session: &mut NotificationSession,
    control: &mpsc::UnboundedSender<Outbound>,
    pong: &PongFlag,
) {
    while let Some(Ok(msg)) = receiver.next().await {
        let close = match msg {
            Message::Text(text) => {
                match AssertUnwindSafe(session.handle_text(text.as_str()))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(())) => None,
                    Ok(Err(frame)) => Some(frame),
                    Err(_) => {
                        error!("Notification handler panicked for {}", session.account().id);
                        Some(CloseFrame::internal("internal error"))
                    }
                }
            }
            Message::Binary(_) => Some(CloseFrame::unsupported("binary frames are not supported")),
            Message::Pong(_) => {
                pong.received();
                None
            }
            Message::Close(_) => break,
            _ => None,
        };

        if let Some(frame) = close {
            warn!("Closing notification connection of {}: {}", session.account().id, frame);
            let _ = control.send(Outbound::Close(frame));
            break;
        }
    }
}
