use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};

use rentchat_db::Database;
use rentchat_ephemeral::{CommitOutcome, EphemeralStore, ListWrite};
use rentchat_types::models::{Account, BufferedMessage, RoomId};

use crate::buffer::decode_lenient;
use crate::config::GatewayConfig;
use crate::error::BufferError;
use crate::{buffer_key, run_blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadReport {
    /// Durable rows flipped to read.
    pub durable: usize,
    /// Buffered entries flipped to read.
    pub buffered: usize,
}

#[derive(Debug)]
enum Rewrite {
    Unchanged,
    Committed(usize),
    Conflict,
}

/// Marks a room as read for one participant, in both stores.
#[derive(Clone)]
pub struct ReadStateReconciler {
    db: Arc<Database>,
    store: Arc<dyn EphemeralStore>,
    config: GatewayConfig,
}

fn authored_by(message: &BufferedMessage, reader: &Account) -> bool {
    message.sender_nickname == reader.nickname
}

impl ReadStateReconciler {
    pub fn new(db: Arc<Database>, store: Arc<dyn EphemeralStore>, config: GatewayConfig) -> Self {
        Self { db, store, config }
    }

    /// Flip every message in the room that `reader` did not write to read.
    /// Safe to repeat; the second call changes nothing.
    pub async fn mark_read(&self, room_id: RoomId, reader: &Account) -> Result<ReadReport, BufferError> {
        let db = self.db.clone();
        let reader_id = reader.id;
        let durable = run_blocking(move || db.mark_room_read(room_id, reader_id)).await?;

        let max_attempts = self.config.flush_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let store = self.store.clone();
            let owned = reader.clone();
            let outcome = run_blocking(move || rewrite_once(store.as_ref(), room_id, &owned)).await?;

            match outcome {
                Rewrite::Unchanged => return Ok(ReadReport { durable, buffered: 0 }),
                Rewrite::Committed(buffered) => {
                    debug!(
                        "Room {}: {} durable and {} buffered messages read by {}",
                        room_id, durable, buffered, reader.nickname
                    );
                    return Ok(ReadReport { durable, buffered });
                }
                Rewrite::Conflict => {
                    warn!(
                        "Room {} buffer changed during read reconciliation (attempt {}/{})",
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

    /// Unread messages `viewer` has not written, across both stores.
    pub async fn unread_count(&self, room_id: RoomId, viewer: &Account) -> Result<u64> {
        let db = self.db.clone();
        let store = self.store.clone();
        let viewer = viewer.clone();
        run_blocking(move || {
            let durable = db.unread_count(room_id, viewer.id)?;
            let raw = store.list_range(&buffer_key(room_id), 0, -1)?;
            let buffered = decode_lenient(room_id, &raw)
                .iter()
                .filter(|m| m.unread && !authored_by(m, &viewer))
                .count() as u64;
            Ok(durable + buffered)
        })
        .await
    }
}

/// Rewrite the buffer with the reader's incoming messages marked read.
/// Entries that do not decode are carried over untouched.
fn rewrite_once(store: &dyn EphemeralStore, room_id: RoomId, reader: &Account) -> Result<Rewrite> {
    let watch = store.watch_list(&buffer_key(room_id))?;

    let mut flipped = 0;
    let mut values = Vec::with_capacity(watch.values().len());
    for raw in watch.values() {
        match serde_json::from_str::<BufferedMessage>(raw) {
            Ok(mut message) if message.unread && !authored_by(&message, reader) => {
                message.unread = false;
                flipped += 1;
                values.push(serde_json::to_string(&message)?);
            }
            _ => values.push(raw.clone()),
        }
    }

    if flipped == 0 {
        return Ok(Rewrite::Unchanged);
    }

    Ok(match watch.commit(ListWrite::Replace(values))? {
        CommitOutcome::Committed => Rewrite::Committed(flipped),
        CommitOutcome::Conflict => Rewrite::Conflict,
    })
}
