//! Real-time chat and notification core.
//!
//! [`Gateway`] wires the components together over injected store handles:
//! the durable [`Database`], a shared [`EphemeralStore`] and a [`MediaStore`]
//! for decoded images. Connection sessions in [`chat`] and [`notification`]
//! drive everything else. Instances sharing an ephemeral store see each
//! other's presence and group events.

pub mod buffer;
pub mod chat;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod flush;
pub mod history;
pub mod notification;
pub mod notifications;
pub mod presence;
pub mod read_state;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use rentchat_db::{Database, MediaStore};
use rentchat_ephemeral::EphemeralStore;
use rentchat_types::models::RoomId;

use crate::buffer::MessageBuffer;
use crate::config::GatewayConfig;
use crate::dispatcher::Dispatcher;
use crate::flush::FlushCoordinator;
use crate::history::HistoryService;
use crate::notifications::NotificationEngine;
use crate::presence::Presence;
use crate::read_state::ReadStateReconciler;

pub const GLOBAL_NOTIFICATION_GROUP: &str = "notification-global";
pub const BUFFER_KEY_PREFIX: &str = "chat:buffer:";

pub fn chat_group(room_id: RoomId) -> String {
    format!("chat_{room_id}")
}

pub fn chat_notification_group(room_id: RoomId) -> String {
    format!("notification-chat_{room_id}")
}

pub fn buffer_key(room_id: RoomId) -> String {
    format!("{BUFFER_KEY_PREFIX}{room_id}")
}

/// Run a blocking store call on the bounded blocking pool.
pub(crate) async fn run_blocking<F, T>(f: F) -> anyhow::Result<T>
where
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow::anyhow!("store task failed: {}", e))?
}

/// Handle to every core component. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    db: Arc<Database>,
    config: GatewayConfig,
    dispatcher: Dispatcher,
    presence: Presence,
    buffer: MessageBuffer,
    flusher: FlushCoordinator,
    read_state: ReadStateReconciler,
    history: HistoryService,
    notifications: NotificationEngine,
}

impl Gateway {
    pub fn new(
        db: Arc<Database>,
        store: Arc<dyn EphemeralStore>,
        media: MediaStore,
        config: GatewayConfig,
    ) -> Self {
        let dispatcher = Dispatcher::relayed(store.clone());
        let presence = Presence::new(store.clone());
        let flusher = FlushCoordinator::new(db.clone(), store.clone(), media, config.clone());
        let buffer = MessageBuffer::new(
            store.clone(),
            presence.clone(),
            flusher.clone(),
            config.buffer_threshold,
        );
        let read_state = ReadStateReconciler::new(db.clone(), store.clone(), config.clone());
        let history = HistoryService::new(db.clone(), store.clone(), config.history_page);
        let notifications = NotificationEngine::new(db.clone(), store, dispatcher.clone());

        Self {
            inner: Arc::new(GatewayInner {
                db,
                config,
                dispatcher,
                presence,
                buffer,
                flusher,
                read_state,
                history,
                notifications,
            }),
        }
    }

    /// Start receiving group events published by other instances. Until
    /// this runs, fan-out reaches this instance's connections only.
    pub async fn start_relay(&self) -> anyhow::Result<()> {
        self.inner.dispatcher.start_relay().await
    }

    pub fn db(&self) -> &Arc<Database> {
        &self.inner.db
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn presence(&self) -> &Presence {
        &self.inner.presence
    }

    pub fn buffer(&self) -> &MessageBuffer {
        &self.inner.buffer
    }

    pub fn flusher(&self) -> &FlushCoordinator {
        &self.inner.flusher
    }

    pub fn read_state(&self) -> &ReadStateReconciler {
        &self.inner.read_state
    }

    pub fn history(&self) -> &HistoryService {
        &self.inner.history
    }

    pub fn notifications(&self) -> &NotificationEngine {
        &self.inner.notifications
    }
}
