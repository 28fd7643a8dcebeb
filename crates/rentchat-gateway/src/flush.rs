//! Moves buffered messages into the durable store.
//!
//! One attempt watches the room's buffer key, reads the whole list, writes
//! every entry inside a single SQLite transaction and then deletes the key
//! through the watch. When the key changed in between, the delete is refused,
//! the transaction is rolled back and the attempt is retried after a backoff.
//! The whole attempt runs on one blocking worker.

use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use rentchat_db::{Database, MediaStore};
use rentchat_ephemeral::{CommitOutcome, EphemeralStore, ListWrite};
use rentchat_types::models::{NewMessage, RoomId};

use crate::buffer::decode_lenient;
use crate::config::GatewayConfig;
use crate::error::BufferError;
use crate::{BUFFER_KEY_PREFIX, buffer_key, run_blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Only flush while the buffer is over the configured threshold.
    Threshold,
    /// Flush whatever is buffered, however little.
    Drain,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub room: RoomId,
    /// Rows inserted by the committed attempt; 0 when nothing was due.
    pub flushed: usize,
    pub attempts: u32,
}

#[derive(Debug)]
enum Attempt {
    NotDue,
    Committed(usize),
    Conflict,
}

#[derive(Clone)]
pub struct FlushCoordinator {
    db: Arc<Database>,
    store: Arc<dyn EphemeralStore>,
    media: MediaStore,
    config: GatewayConfig,
}

impl FlushCoordinator {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn EphemeralStore>,
        media: MediaStore,
        config: GatewayConfig,
    ) -> Self {
        Self {
            db,
            store,
            media,
            config,
        }
    }

    /// Flush one room. Conflicts are retried with exponential backoff up to
    /// `flush_max_attempts`; any other failure stops immediately. In both
    /// failure cases the buffer is left untouched.
    pub async fn flush(&self, room_id: RoomId, mode: FlushMode) -> Result<FlushReport, BufferError> {
        let max_attempts = self.config.flush_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            let db = self.db.clone();
            let store = self.store.clone();
            let media = self.media.clone();
            let threshold = self.config.buffer_threshold;

            let outcome = run_blocking(move || {
                flush_once(&db, store.as_ref(), &media, room_id, mode, threshold)
            })
            .await?;

            match outcome {
                Attempt::NotDue => {
                    debug!("Room {} buffer not due for {:?} flush", room_id, mode);
                    return Ok(FlushReport {
                        room: room_id,
                        flushed: 0,
                        attempts: attempt,
                    });
                }
                Attempt::Committed(flushed) => {
                    info!(
                        "Flushed {} messages from room {} ({:?}, attempt {})",
                        flushed, room_id, mode, attempt
                    );
                    return Ok(FlushReport {
                        room: room_id,
                        flushed,
                        attempts: attempt,
                    });
                }
                Attempt::Conflict => {
                    warn!(
                        "Room {} buffer changed during flush (attempt {}/{})",
                        room_id, attempt, max_attempts
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(self.config.backoff_for(attempt)).await;
                    }
                }
            }
        }

        Err(BufferError::RetriesExhausted {
            room: room_id,
            attempts: max_attempts,
        })
    }

    /// Drain every room that has a buffer. Returns the number of rows moved.
    /// Rooms that fail are logged and left for the next sweep.
    pub async fn sweep(&self) -> Result<usize> {
        let store = self.store.clone();
        let keys = run_blocking(move || store.keys_with_prefix(BUFFER_KEY_PREFIX)).await?;

        let mut total = 0;
        for key in keys {
            let Some(room_id) = key
                .strip_prefix(BUFFER_KEY_PREFIX)
                .and_then(|id| id.parse::<RoomId>().ok())
            else {
                warn!("Skipping unrecognised buffer key '{}'", key);
                continue;
            };
            match self.flush(room_id, FlushMode::Drain).await {
                Ok(report) => total += report.flushed,
                Err(e) => error!("Sweep could not flush room {}: {}", room_id, e),
            }
        }
        Ok(total)
    }
}

fn flush_once(
    db: &Database,
    store: &dyn EphemeralStore,
    media: &MediaStore,
    room_id: RoomId,
    mode: FlushMode,
    threshold: usize,
) -> Result<Attempt> {
    let watch = store.watch_list(&buffer_key(room_id))?;
    let pending = watch.values().len();
    if pending == 0 || (mode == FlushMode::Threshold && pending <= threshold) {
        return Ok(Attempt::NotDue);
    }

    let mut saved = Vec::new();
    let mut rows = Vec::with_capacity(pending);
    for message in decode_lenient(room_id, watch.values()) {
        let image = match message.image.as_deref() {
            Some(data_url) => match media.save_chat_image(data_url) {
                Ok(reference) => {
                    saved.push(reference.clone());
                    Some(reference)
                }
                Err(e) => {
                    warn!("Dropping undecodable image in room {}: {}", room_id, e);
                    None
                }
            },
            None => None,
        };
        rows.push(NewMessage {
            chatroom_id: message.chatroom_id,
            sender_id: message.sender_id,
            text: message.text,
            image,
            unread: message.unread,
            created_at: message.created_at,
        });
    }

    let outcome = db.with_transaction(|tx| {
        let inserted = Database::insert_messages(tx, &rows)?;
        match watch.commit(ListWrite::Delete)? {
            CommitOutcome::Committed => Ok(Some(inserted)),
            CommitOutcome::Conflict => Ok(None),
        }
    });

    match outcome {
        Ok(Some(inserted)) => Ok(Attempt::Committed(inserted)),
        Ok(None) => {
            discard_media(media, &saved);
            Ok(Attempt::Conflict)
        }
        Err(e) => {
            discard_media(media, &saved);
            Err(e)
        }
    }
}

fn discard_media(media: &MediaStore, references: &[String]) {
    for reference in references {
        if let Err(e) = media.remove(reference) {
            warn!("Failed to remove orphaned image {}: {}", reference, e);
        }
    }
}
