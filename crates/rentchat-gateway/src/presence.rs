//! Presence derived from connection-group cardinality.
//!
//! Group memberships live in the shared ephemeral store as scored sets, so
//! every instance sees the same count. Each member's score is the last time
//! its connection refreshed it; members older than the TTL are pruned before
//! counting, which bounds how long a crashed instance's connections linger.
//! The opponent of a room counts as online exactly when the room's chat
//! group holds two members. Within the TTL a count can still be stale.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rentchat_ephemeral::EphemeralStore;
use rentchat_types::models::RoomId;

use crate::connection::HEARTBEAT_INTERVAL;
use crate::dispatcher::ConnId;
use crate::{chat_group, run_blocking};

/// Live connections refresh every heartbeat; three missed refreshes expire.
pub const PRESENCE_TTL: Duration = Duration::from_secs(HEARTBEAT_INTERVAL.as_secs() * 3);

#[derive(Clone)]
pub struct Presence {
    store: Arc<dyn EphemeralStore>,
    ttl: Duration,
}

fn membership_key(group: &str) -> String {
    format!("group:{group}")
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Both participants of a two-party room are connected.
pub fn pair_present(group_size: usize) -> bool {
    group_size == 2
}

impl Presence {
    pub fn new(store: Arc<dyn EphemeralStore>) -> Self {
        Self::with_ttl(store, PRESENCE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn EphemeralStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn cutoff(&self, now: i64) -> i64 {
        now - i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX)
    }

    /// Record `conn_id` in `group`. Returns the group size after joining.
    pub async fn join(&self, group: &str, conn_id: ConnId) -> anyhow::Result<usize> {
        let store = self.store.clone();
        let key = membership_key(group);
        let now = now_ms();
        let cutoff = self.cutoff(now);
        run_blocking(move || {
            store.scored_add(&key, &conn_id.to_string(), now)?;
            store.scored_prune_card(&key, cutoff)
        })
        .await
    }

    /// Keep `conn_id` counted for another TTL.
    pub async fn refresh(&self, group: &str, conn_id: ConnId) -> anyhow::Result<()> {
        let store = self.store.clone();
        let key = membership_key(group);
        let now = now_ms();
        run_blocking(move || {
            store.scored_add(&key, &conn_id.to_string(), now)?;
            Ok(())
        })
        .await
    }

    /// Remove `conn_id` from `group`. Returns how many members remain.
    pub async fn leave(&self, group: &str, conn_id: ConnId) -> anyhow::Result<usize> {
        let store = self.store.clone();
        let key = membership_key(group);
        let cutoff = self.cutoff(now_ms());
        run_blocking(move || {
            store.scored_remove(&key, &conn_id.to_string())?;
            store.scored_prune_card(&key, cutoff)
        })
        .await
    }

    pub async fn group_size(&self, group: &str) -> anyhow::Result<usize> {
        let store = self.store.clone();
        let key = membership_key(group);
        let cutoff = self.cutoff(now_ms());
        run_blocking(move || store.scored_prune_card(&key, cutoff)).await
    }

    pub async fn opponent_online(&self, room_id: RoomId) -> anyhow::Result<bool> {
        Ok(pair_present(self.group_size(&chat_group(room_id)).await?))
    }
}
