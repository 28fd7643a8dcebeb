//! Shared test fixture: a complete gateway over in-memory stores with a
//! borrower and a lender sharing one room about one product.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Result;
use tempfile::TempDir;
use tokio::sync::mpsc;

use rentchat_db::{Database, MediaStore};
use rentchat_ephemeral::{EphemeralStore, ListWatch, MemoryStore, Subscriber};
use rentchat_types::events::ChatEvent;
use rentchat_types::models::{Account, Chatroom};

use crate::Gateway;
use crate::buffer::Appended;
use crate::chat::ChatSession;
use crate::config::GatewayConfig;
use crate::dispatcher::GroupEvent;

/// A one-pixel-ish PNG header as a data URL.
pub const PIXEL: &str = "data:image/png;base64,iVBORw0KGgo=";

pub struct Fixture {
    pub gateway: Gateway,
    pub borrower: Account,
    pub lender: Account,
    pub room: Chatroom,
    pub product_id: i64,
    store: Arc<dyn EphemeralStore>,
    media_dir: TempDir,
}

type Connected = (ChatSession, mpsc::UnboundedReceiver<GroupEvent>);

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_threshold(buffer_threshold: usize) -> Self {
        Self::with_config(GatewayConfig {
            buffer_threshold,
            ..GatewayConfig::default()
        })
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn EphemeralStore>, config: GatewayConfig) -> Self {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let media_dir = tempfile::tempdir().unwrap();
        let media = MediaStore::new(media_dir.path()).unwrap();

        let borrower = db.create_account("bora").unwrap();
        let lender = db.create_account("lee").unwrap();
        let product_id = db.create_product("camping tent", lender.id, None).unwrap();
        let room = db
            .create_chatroom(borrower.id, lender.id, Some(product_id))
            .unwrap();

        Self {
            gateway: Gateway::new(db, store.clone(), media, config),
            borrower,
            lender,
            room,
            product_id,
            store,
            media_dir,
        }
    }

    /// Another instance over the same durable and ephemeral stores.
    pub fn sibling(&self) -> Gateway {
        Gateway::new(
            self.gateway.db().clone(),
            self.store.clone(),
            MediaStore::new(self.media_dir.path()).unwrap(),
            self.gateway.config().clone(),
        )
    }

    pub fn store(&self) -> &Arc<dyn EphemeralStore> {
        &self.store
    }

    pub fn account(&self, nickname: &str) -> Account {
        self.gateway.db().create_account(nickname).unwrap()
    }

    /// A second room between the same two accounts, without a product.
    pub fn extra_room(&self) -> Chatroom {
        self.gateway
            .db()
            .create_chatroom(self.borrower.id, self.lender.id, None)
            .unwrap()
    }

    pub fn media_root(&self) -> &Path {
        self.media_dir.path()
    }

    pub async fn send(&self, sender: &Account, text: &str) -> Appended {
        self.gateway
            .buffer()
            .append(self.room.id, sender, text.to_string(), None)
            .await
            .unwrap()
    }

    pub fn durable_count(&self) -> u64 {
        self.gateway.db().count_messages(self.room.id).unwrap()
    }

    pub async fn connect(&self, account: &Account) -> Connected {
        ChatSession::open(&self.gateway, self.room.id, account.clone())
            .await
            .unwrap()
    }

    pub async fn connect_both(&self) -> (Connected, Connected) {
        let a = self.connect(&self.borrower).await;
        let b = self.connect(&self.lender).await;
        (a, b)
    }
}

/// Next chat event already queued for a connection.
pub fn next_chat(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Option<ChatEvent> {
    while let Ok(event) = rx.try_recv() {
        if let GroupEvent::Chat(event) = event {
            return Some(event);
        }
    }
    None
}

pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) {
    while rx.try_recv().is_ok() {}
}

/// Store wrapper that simulates another instance writing to a list right
/// after it is watched: the newest entry is pushed again, so the pending
/// commit conflicts. Interferes at most `times` times.
pub struct ContendedStore {
    inner: MemoryStore,
    remaining: AtomicUsize,
}

impl ContendedStore {
    pub fn new(times: usize) -> Self {
        Self {
            inner: MemoryStore::new(),
            remaining: AtomicUsize::new(times),
        }
    }
}

impl EphemeralStore for ContendedStore {
    fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        self.inner.list_push(key, value)
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        self.inner.list_len(key)
    }

    fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        self.inner.list_range(key, start, stop)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn watch_list(&self, key: &str) -> Result<Box<dyn ListWatch>> {
        let watch = self.inner.watch_list(key)?;
        if let Some(newest) = watch.values().last() {
            let interfere = self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if interfere {
                self.inner.list_push(key, newest)?;
            }
        }
        Ok(watch)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.keys_with_prefix(prefix)
    }

    fn scored_add(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        self.inner.scored_add(key, member, score)
    }

    fn scored_remove(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.scored_remove(key, member)
    }

    fn scored_prune_card(&self, key: &str, min_score: i64) -> Result<usize> {
        self.inner.scored_prune_card(key, min_score)
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        self.inner.publish(channel, payload)
    }

    fn subscribe(&self, channel: &str, subscriber: Subscriber) -> Result<()> {
        self.inner.subscribe(channel, subscriber)
    }
}
