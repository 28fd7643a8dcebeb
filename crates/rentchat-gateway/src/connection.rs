//! Socket plumbing shared by the chat and notification endpoints.
//!
//! Each socket is split: a spawned writer task forwards group events and
//! control frames to the client and runs the heartbeat, while the caller
//! reads client frames and drives its session.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{self, Message, WebSocket};
use futures_util::SinkExt;
use futures_util::stream::SplitSink;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::dispatcher::GroupEvent;
use crate::error::CloseFrame;

/// Heartbeat interval: the server pings every 15 seconds and drops the
/// connection after two consecutive missed pongs.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
pub const MAX_MISSED_PONGS: u8 = 2;

/// How long the writer gets to deliver a close frame after the reader ends.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Lifecycle of one endpoint connection, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting,
    Validating,
    Joined,
    Active,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Move forward to `next`. Backward moves are ignored.
    pub fn advance(&mut self, next: ConnectionState) {
        if next > *self {
            trace!("connection {:?} -> {:?}", self, next);
            *self = next;
        }
    }
}

/// Frames the reader side asks the writer to send.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Close(CloseFrame),
}

pub type SocketSink = SplitSink<WebSocket, Message>;

pub fn close_message(frame: &CloseFrame) -> Message {
    Message::Close(Some(ws::CloseFrame {
        code: frame.code.as_u16(),
        reason: frame.reason.clone().into(),
    }))
}

/// At most the first 200 characters of an outbound frame, for logs.
fn preview(text: &str) -> &str {
    text.char_indices().nth(200).map_or(text, |(end, _)| &text[..end])
}

/// Serialize and send one JSON text frame. False once the socket is gone.
pub async fn send_json<T: Serialize>(sender: &mut SocketSink, value: &T) -> bool {
    let text = match serde_json::to_string(value) {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to serialize outbound frame: {}", e);
            return true;
        }
    };
    sender.send(Message::Text(text.into())).await.is_ok()
}

/// Shared flag the reader sets when a pong arrives.
#[derive(Clone)]
pub struct PongFlag(Arc<AtomicBool>);

impl PongFlag {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn received(&self) {
        self.0.store(true, Ordering::Release);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::Acquire)
    }
}

impl Default for PongFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Writer loop. `render` turns a group event into the text frame for this
/// client, or `None` to drop it. Ends when either channel closes, a close
/// frame was sent, the client stops answering pings, or the socket fails.
pub async fn run_writer<F, Fut>(
    mut sender: SocketSink,
    mut events: mpsc::UnboundedReceiver<GroupEvent>,
    mut control: mpsc::UnboundedReceiver<Outbound>,
    pong: PongFlag,
    mut render: F,
) where
    F: FnMut(GroupEvent) -> Fut,
    Fut: Future<Output = Option<String>>,
{
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut missed_heartbeats: u8 = 0;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let Some(text) = render(event).await else { continue };
                trace!("-> {}", preview(&text));
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            out = control.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if sender.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close(frame)) => {
                        let _ = sender.send(close_message(&frame)).await;
                        break;
                    }
                    None => break,
                }
            }
            _ = heartbeat.tick() => {
                if pong.take() {
                    missed_heartbeats = 0;
                } else {
                    missed_heartbeats += 1;
                    if missed_heartbeats >= MAX_MISSED_PONGS {
                        warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                        break;
                    }
                }
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
}

/// Wait briefly for the writer to drain after the reader finished.
pub async fn finish_writer(mut writer: tokio::task::JoinHandle<()>) {
    if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentchat_types::events::CloseCode;

    #[test]
    fn close_message_carries_code_and_reason() {
        let Message::Close(Some(frame)) = close_message(&CloseFrame::not_a_member()) else {
            panic!("expected a close frame");
        };
        assert_eq!(frame.code, CloseCode::PolicyViolation.as_u16());
        assert_eq!(frame.reason.as_str(), "not a member");
    }

    #[test]
    fn pong_flag_is_consumed_once() {
        let flag = PongFlag::new();
        assert!(flag.take());
        assert!(!flag.take());
        flag.received();
        assert!(flag.take());
    }

    #[test]
    fn preview_cuts_on_character_boundaries() {
        let hangul = "가".repeat(70);
        let frame = format!(r#"{{"text":"{hangul}"}}"#);
        assert!(frame.len() > 200);
        assert_eq!(preview(&frame), frame);

        let long = "가".repeat(250);
        assert_eq!(preview(&long).chars().count(), 200);
        assert_eq!(preview("short"), "short");
    }

    #[test]
    fn state_only_moves_forward() {
        let mut state = ConnectionState::Connecting;
        state.advance(ConnectionState::Validating);
        state.advance(ConnectionState::Active);
        assert_eq!(state, ConnectionState::Active);
        state.advance(ConnectionState::Joined);
        assert_eq!(state, ConnectionState::Active);
        state.advance(ConnectionState::Closed);
        assert_eq!(state, ConnectionState::Closed);
    }
}
