//! Chat endpoint: one connection per participant per room.

use std::panic::AssertUnwindSafe;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use rentchat_db::DataUrl;
use rentchat_types::events::{ChatEvent, ChatInbound, OpponentState};
use rentchat_types::models::{Account, Chatroom, RoomId};

use crate::buffer::Appended;
use crate::connection::{
    ConnectionState, HEARTBEAT_INTERVAL, Outbound, PongFlag, close_message, finish_writer,
    run_writer,
};
use crate::dispatcher::{ConnId, GroupEvent};
use crate::error::{BufferError, CloseFrame};
use crate::flush::{FlushMode, FlushReport};
use crate::presence::pair_present;
use crate::{Gateway, chat_group, run_blocking};

/// A validated, joined chat connection.
pub struct ChatSession {
    gateway: Gateway,
    room: Chatroom,
    account: Account,
    conn_id: ConnId,
    group: String,
    state: ConnectionState,
}

/// What happened when a chat connection left its room.
#[derive(Debug)]
pub struct Disconnect {
    /// Members still in the room's group.
    pub remaining: usize,
    /// Drain flush started because the room emptied.
    pub drain: Option<JoinHandle<Result<FlushReport, BufferError>>>,
}

impl ChatSession {
    /// Validate the room and membership, join the room group and announce
    /// presence to everyone in it, this connection included.
    pub async fn open(
        gateway: &Gateway,
        room_id: RoomId,
        account: Account,
    ) -> Result<(Self, mpsc::UnboundedReceiver<GroupEvent>), CloseFrame> {
        let mut state = ConnectionState::Connecting;
        state.advance(ConnectionState::Validating);
        let db = gateway.db().clone();
        let room = run_blocking(move || db.get_chatroom(room_id))
            .await
            .map_err(|e| {
                error!("Room lookup for {} failed: {}", room_id, e);
                CloseFrame::internal("room lookup failed")
            })?
            .ok_or_else(CloseFrame::room_not_found)?;
        if !room.is_member(account.id) {
            return Err(CloseFrame::not_a_member());
        }

        let conn_id = Uuid::new_v4();
        let group = chat_group(room_id);
        let (tx, rx) = mpsc::unbounded_channel();
        state.advance(ConnectionState::Joined);
        gateway.dispatcher().group_add(&group, conn_id, tx).await;
        let size = match gateway.presence().join(&group, conn_id).await {
            Ok(size) => size,
            Err(e) => {
                gateway.dispatcher().group_discard(&group, conn_id).await;
                error!("Presence join for room {} failed: {}", room_id, e);
                return Err(CloseFrame::internal("presence unavailable"));
            }
        };

        info!(
            "{} ({}) joined room {} ({} connected)",
            account.nickname, account.id, room_id, size
        );
        let alert = ChatEvent::alert(&account.nickname, OpponentState::from_online(pair_present(size)));
        gateway
            .dispatcher()
            .group_send(&group, GroupEvent::Chat(alert))
            .await;
        state.advance(ConnectionState::Active);

        Ok((
            Self {
                gateway: gateway.clone(),
                room,
                account,
                conn_id,
                group,
                state,
            },
            rx,
        ))
    }

    pub fn room(&self) -> &Chatroom {
        &self.room
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Handle one inbound text frame: validate, buffer, broadcast and, when
    /// nobody is reading, notify the room's notification listeners.
    pub async fn handle_text(&mut self, raw: &str) -> Result<Appended, CloseFrame> {
        let inbound: ChatInbound = serde_json::from_str(raw)
            .map_err(|e| CloseFrame::unsupported(format!("malformed message: {e}")))?;
        let text = inbound.text.unwrap_or_default();
        let image = inbound.image.filter(|image| !image.is_empty());
        if text.is_empty() && image.is_none() {
            return Err(CloseFrame::unsupported("message needs text or an image"));
        }
        if let Some(image) = &image {
            DataUrl::parse(image).map_err(|e| CloseFrame::unsupported(e.to_string()))?;
        }

        let appended = self
            .gateway
            .buffer()
            .append(self.room.id, &self.account, text, image)
            .await
            .map_err(|e| {
                error!("Buffering message in room {} failed: {}", self.room.id, e);
                CloseFrame::internal("could not store message")
            })?;

        self.gateway
            .dispatcher()
            .group_send(&self.group, GroupEvent::Chat(ChatEvent::message(&appended.message)))
            .await;
        if appended.message.unread {
            let listeners = self
                .gateway
                .notifications()
                .notify_unread_chat(&appended.message)
                .await;
            debug!("Unread message in room {} sent to {} listeners", self.room.id, listeners);
        }
        Ok(appended)
    }

    /// Leave the room group. The last one out drains the buffer in the
    /// background; otherwise the remaining member hears that we left.
    /// Keep this connection counted as present.
    pub async fn refresh_presence(&self) {
        if let Err(e) = self.gateway.presence().refresh(&self.group, self.conn_id).await {
            warn!("Presence refresh for room {} failed: {}", self.room.id, e);
        }
    }

    pub async fn close(mut self) -> Disconnect {
        self.state.advance(ConnectionState::Closing);
        let gateway = &self.gateway;
        gateway.dispatcher().group_discard(&self.group, self.conn_id).await;
        let remaining = match gateway.presence().leave(&self.group, self.conn_id).await {
            Ok(remaining) => remaining,
            Err(e) => {
                error!("Presence leave for room {} failed: {}", self.room.id, e);
                0
            }
        };
        info!(
            "{} ({}) left room {} ({} remaining)",
            self.account.nickname, self.account.id, self.room.id, remaining
        );

        let drain = if remaining == 0 {
            let flusher = gateway.flusher().clone();
            let room_id = self.room.id;
            Some(tokio::spawn(async move {
                let result = flusher.flush(room_id, FlushMode::Drain).await;
                if let Err(e) = &result {
                    error!("Drain of room {} failed: {}", room_id, e);
                }
                result
            }))
        } else {
            let alert = ChatEvent::alert(&self.account.nickname, OpponentState::Offline);
            gateway
                .dispatcher()
                .group_send(&self.group, GroupEvent::Chat(alert))
                .await;
            None
        };

        self.state.advance(ConnectionState::Closed);
        Disconnect { remaining, drain }
    }
}

fn render_chat_event(event: GroupEvent) -> Option<String> {
    match event {
        GroupEvent::Chat(event) => serde_json::to_string(&event).ok(),
        _ => None,
    }
}

/// Drive a chat socket until either side goes away.
pub async fn serve_chat(socket: WebSocket, gateway: Gateway, room_id: RoomId, account: Account) {
    let (mut sender, mut receiver) = socket.split();

    let (mut session, events) = match ChatSession::open(&gateway, room_id, account).await {
        Ok(opened) => opened,
        Err(frame) => {
            warn!("Rejecting chat connection to room {}: {}", room_id, frame);
            let _ = sender.send(close_message(&frame)).await;
            return;
        }
    };

    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let pong = PongFlag::new();
    let mut writer = tokio::spawn(run_writer(
        sender,
        events,
        control_rx,
        pong.clone(),
        |event| std::future::ready(render_chat_event(event)),
    ));

    let writer_done = tokio::select! {
        _ = &mut writer => true,
        _ = read_chat(&mut receiver, &mut session, &control_tx, &pong) => false,
    };

    session.close().await;
    drop(control_tx);
    if !writer_done {
        finish_writer(writer).await;
    }
}

async fn read_chat(
    receiver: &mut SplitStream<WebSocket>,
    session: &mut ChatSession,
    control: &mpsc::UnboundedSender<Outbound>,
    pong: &PongFlag,
) {
    let mut refresh = tokio::time::interval(HEARTBEAT_INTERVAL);
    refresh.tick().await;
    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = refresh.tick() => {
                session.refresh_presence().await;
                continue;
            }
        };
        let Some(Ok(msg)) = msg else { break };
        let close = match msg {
            Message::Text(text) => {
                match AssertUnwindSafe(session.handle_text(text.as_str()))
                    .catch_unwind()
                    .await
                {
                    Ok(Ok(_)) => None,
                    Ok(Err(frame)) => Some(frame),
                    Err(_) => {
                        error!("Chat handler panicked in room {}", session.room().id);
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
            warn!(
                "Closing chat connection of {} in room {}: {}",
                session.account().nickname,
                session.room().id,
                frame
            );
            let _ = control.send(Outbound::Close(frame));
            break;
        }
    }
}
