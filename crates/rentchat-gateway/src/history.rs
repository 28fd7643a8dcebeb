//! Merged history view over the buffer and the durable store.
//!
//! Pages are newest-first: buffered entries come first (they are always the
//! most recent), followed by durable rows strictly older than the oldest
//! buffered entry.

use std::sync::Arc;

use anyhow::Result;

use rentchat_db::Database;
use rentchat_ephemeral::EphemeralStore;
use rentchat_types::models::{HistoryEntry, RoomId};

use crate::buffer::decode_lenient;
use crate::{buffer_key, run_blocking};

#[derive(Clone)]
pub struct HistoryService {
    db: Arc<Database>,
    store: Arc<dyn EphemeralStore>,
    page: usize,
}

impl HistoryService {
    pub fn new(db: Arc<Database>, store: Arc<dyn EphemeralStore>, page: usize) -> Self {
        Self { db, store, page }
    }

    pub fn page_size(&self) -> usize {
        self.page
    }

    /// Up to one page of the most recent messages, newest first.
    pub async fn recent(&self, room_id: RoomId) -> Result<Vec<HistoryEntry>> {
        let db = self.db.clone();
        let store = self.store.clone();
        let page = self.page;
        run_blocking(move || merge_page(&db, store.as_ref(), room_id, page)).await
    }

    /// The newest message in the room, wherever it currently lives.
    pub async fn latest(&self, room_id: RoomId) -> Result<Option<HistoryEntry>> {
        let db = self.db.clone();
        let store = self.store.clone();
        run_blocking(move || {
            let raw = store.list_range(&buffer_key(room_id), -1, -1)?;
            if let Some(newest) = decode_lenient(room_id, &raw).pop() {
                return Ok(Some(newest.into()));
            }
            Ok(db
                .recent_messages(room_id, 1, None)?
                .into_iter()
                .next()
                .map(Into::into))
        })
        .await
    }
}

fn merge_page(
    db: &Database,
    store: &dyn EphemeralStore,
    room_id: RoomId,
    page: usize,
) -> Result<Vec<HistoryEntry>> {
    if page == 0 {
        return Ok(vec![]);
    }

    let key = buffer_key(room_id);
    let buffered = if store.exists(&key)? {
        let start = -isize::try_from(page)?;
        decode_lenient(room_id, &store.list_range(&key, start, -1)?)
    } else {
        vec![]
    };

    let oldest_buffered = buffered.first().map(|m| m.created_at);
    let mut entries: Vec<HistoryEntry> = buffered.into_iter().rev().map(Into::into).collect();
    if entries.len() >= page {
        entries.truncate(page);
        return Ok(entries);
    }

    let remaining = u32::try_from(page - entries.len())?;
    entries.extend(
        db.recent_messages(room_id, remaining, oldest_buffered)?
            .into_iter()
            .map(HistoryEntry::from),
    );
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use crate::config::GatewayConfig;
    use crate::flush::FlushMode;
    use crate::testing::Fixture;

    fn small_pages() -> Fixture {
        Fixture::with_config(GatewayConfig {
            history_page: 5,
            ..GatewayConfig::default()
        })
    }

    async fn send_many(fx: &Fixture, from: usize, to: usize) {
        for i in from..to {
            fx.send(&fx.borrower, &format!("m{i}")).await;
        }
    }

    fn texts(entries: &[rentchat_types::models::HistoryEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.text.as_str()).collect()
    }

    #[tokio::test]
    async fn full_buffer_serves_the_page_alone() {
        let fx = small_pages();
        send_many(&fx, 0, 3).await;
        fx.gateway
            .flusher()
            .flush(fx.room.id, FlushMode::Drain)
            .await
            .unwrap();
        send_many(&fx, 3, 10).await;

        let page = fx.gateway.history().recent(fx.room.id).await.unwrap();
        assert_eq!(texts(&page), ["m9", "m8", "m7", "m6", "m5"]);
        assert!(page.iter().all(|e| e.id.is_none()));
    }

    #[tokio::test]
    async fn short_buffer_is_topped_up_from_durable() {
        let fx = small_pages();
        send_many(&fx, 0, 6).await;
        fx.gateway
            .flusher()
            .flush(fx.room.id, FlushMode::Drain)
            .await
            .unwrap();
        send_many(&fx, 6, 8).await;

        let page = fx.gateway.history().recent(fx.room.id).await.unwrap();
        assert_eq!(texts(&page), ["m7", "m6", "m5", "m4", "m3"]);
        assert!(page[..2].iter().all(|e| e.id.is_none()));
        assert!(page[2..].iter().all(|e| e.id.is_some()));
        assert!(page.windows(2).all(|w| w[0].created_at >= w[1].created_at));
    }

    #[tokio::test]
    async fn missing_buffer_reads_durable_only() {
        let fx = small_pages();
        send_many(&fx, 0, 3).await;
        fx.gateway
            .flusher()
            .flush(fx.room.id, FlushMode::Drain)
            .await
            .unwrap();

        let page = fx.gateway.history().recent(fx.room.id).await.unwrap();
        assert_eq!(texts(&page), ["m2", "m1", "m0"]);
        assert_eq!(page[0].nickname, fx.borrower.nickname);
    }

    #[tokio::test]
    async fn empty_room_has_no_history() {
        let fx = small_pages();
        assert!(fx.gateway.history().recent(fx.room.id).await.unwrap().is_empty());
        assert!(fx.gateway.history().latest(fx.room.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_prefers_the_buffer() {
        let fx = small_pages();
        send_many(&fx, 0, 2).await;
        fx.gateway
            .flusher()
            .flush(fx.room.id, FlushMode::Drain)
            .await
            .unwrap();
        let durable = fx.gateway.history().latest(fx.room.id).await.unwrap().unwrap();
        assert_eq!(durable.text, "m1");
        assert!(durable.id.is_some());

        send_many(&fx, 2, 3).await;
        let buffered = fx.gateway.history().latest(fx.room.id).await.unwrap().unwrap();
        assert_eq!(buffered.text, "m2");
        assert!(buffered.id.is_none());
    }
}
