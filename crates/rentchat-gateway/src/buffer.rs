use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, error, warn};

use rentchat_ephemeral::EphemeralStore;
use rentchat_types::models::{Account, BufferedMessage, RoomId};

use crate::flush::{FlushCoordinator, FlushMode};
use crate::presence::Presence;
use crate::{buffer_key, run_blocking};

/// Send path: writes new messages to the room's ephemeral list.
#[derive(Clone)]
pub struct MessageBuffer {
    store: Arc<dyn EphemeralStore>,
    presence: Presence,
    flusher: FlushCoordinator,
    threshold: usize,
}

#[derive(Debug, Clone)]
pub struct Appended {
    pub message: BufferedMessage,
    /// Buffer length right after the append.
    pub buffered: usize,
    /// Rows moved to durable storage when the append crossed the threshold.
    pub flushed: Option<usize>,
}

/// Decode raw list values, failing on the first malformed entry.
pub(crate) fn decode_entries(raw: &[String]) -> Result<Vec<BufferedMessage>> {
    raw.iter()
        .map(|value| serde_json::from_str(value).map_err(Into::into))
        .collect()
}

/// Decode raw list values, skipping (and logging) malformed entries.
pub(crate) fn decode_lenient(room_id: RoomId, raw: &[String]) -> Vec<BufferedMessage> {
    raw.iter()
        .filter_map(|value| match serde_json::from_str(value) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping undecodable buffer entry in room {}: {}", room_id, e);
                None
            }
        })
        .collect()
}

impl MessageBuffer {
    pub fn new(
        store: Arc<dyn EphemeralStore>,
        presence: Presence,
        flusher: FlushCoordinator,
        threshold: usize,
    ) -> Self {
        Self {
            store,
            presence,
            flusher,
            threshold,
        }
    }

    /// Append a message from `sender`. The message is unread unless the
    /// opponent is connected right now. Crossing the threshold flushes
    /// before returning; a failed flush is logged and the entries stay
    /// buffered.
    pub async fn append(
        &self,
        room_id: RoomId,
        sender: &Account,
        text: String,
        image: Option<String>,
    ) -> Result<Appended> {
        let unread = !self.presence.opponent_online(room_id).await?;
        let message = BufferedMessage {
            text,
            sender_nickname: sender.nickname.clone(),
            sender_id: sender.id,
            chatroom_id: room_id,
            unread,
            created_at: Utc::now(),
            image,
        };

        let encoded = serde_json::to_string(&message)?;
        let store = self.store.clone();
        let key = buffer_key(room_id);
        let buffered = run_blocking(move || store.list_push(&key, &encoded)).await?;
        debug!("Room {} buffer length {}", room_id, buffered);

        let flushed = if buffered > self.threshold {
            match self.flusher.flush(room_id, FlushMode::Threshold).await {
                Ok(report) => Some(report.flushed),
                Err(e) => {
                    error!("Threshold flush for room {} failed: {}", room_id, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Appended {
            message,
            buffered,
            flushed,
        })
    }

    pub async fn len(&self, room_id: RoomId) -> Result<usize> {
        let store = self.store.clone();
        let key = buffer_key(room_id);
        run_blocking(move || store.list_len(&key)).await
    }

    /// All buffered entries, oldest first.
    pub async fn entries(&self, room_id: RoomId) -> Result<Vec<BufferedMessage>> {
        let store = self.store.clone();
        let key = buffer_key(room_id);
        let raw = run_blocking(move || store.list_range(&key, 0, -1)).await?;
        decode_entries(&raw)
    }

    /// Newest buffered entry, if any.
    pub async fn latest(&self, room_id: RoomId) -> Result<Option<BufferedMessage>> {
        let store = self.store.clone();
        let key = buffer_key(room_id);
        let raw = run_blocking(move || store.list_range(&key, -1, -1)).await?;
        Ok(decode_entries(&raw)?.pop())
    }
}
