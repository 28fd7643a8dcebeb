//! Group fan-out.
//!
//! Each instance keeps its own connections' senders. A send delivers to the
//! local members right away and publishes the event on the shared store's
//! relay channel; every other instance picks it up there and delivers it to
//! its own members of the group.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use rentchat_ephemeral::EphemeralStore;
use rentchat_types::events::ChatEvent;
use rentchat_types::models::{BufferedMessage, GlobalNotification, RentalNotificationView};

use crate::run_blocking;

/// Ephemeral-store channel group events travel on between instances.
pub const RELAY_CHANNEL: &str = "rentchat:groups";

/// Identifies one live connection within this process.
pub type ConnId = Uuid;

/// Everything that travels through a named group. Listeners decide what to
/// forward; notification listeners filter rental and chat events locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "event", rename_all = "snake_case")]
pub enum GroupEvent {
    Chat(ChatEvent),
    Global(GlobalNotification),
    Rental(RentalNotificationView),
    ChatUnread(BufferedMessage),
}

#[derive(Serialize, Deserialize)]
struct Relayed {
    origin: Uuid,
    group: String,
    event: GroupEvent,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// group name -> (conn_id -> sender)
    groups: RwLock<HashMap<String, HashMap<ConnId, mpsc::UnboundedSender<GroupEvent>>>>,
    /// This instance on the relay channel.
    origin: Uuid,
    relay: Option<Arc<dyn EphemeralStore>>,
}

impl Dispatcher {
    /// Fan-out within this process only.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Fan-out across every instance sharing `store`. Events from other
    /// instances arrive once [`Dispatcher::start_relay`] has run.
    pub fn relayed(store: Arc<dyn EphemeralStore>) -> Self {
        Self::build(Some(store))
    }

    fn build(relay: Option<Arc<dyn EphemeralStore>>) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                groups: RwLock::default(),
                origin: Uuid::new_v4(),
                relay,
            }),
        }
    }

    pub async fn group_add(&self, group: &str, conn_id: ConnId, tx: mpsc::UnboundedSender<GroupEvent>) {
        self.inner
            .groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(conn_id, tx);
    }

    pub async fn group_discard(&self, group: &str, conn_id: ConnId) {
        let mut groups = self.inner.groups.write().await;
        if let Some(members) = groups.get_mut(group) {
            members.remove(&conn_id);
            if members.is_empty() {
                groups.remove(group);
            }
        }
    }

    /// Deliver `event` to every member of `group` on every instance. Returns
    /// how many local connections accepted it.
    pub async fn group_send(&self, group: &str, event: GroupEvent) -> usize {
        let delivered = deliver_local(&self.inner, group, &event).await;
        if let Some(store) = self.inner.relay.clone() {
            let relayed = Relayed {
                origin: self.inner.origin,
                group: group.to_string(),
                event,
            };
            let published = run_blocking(move || {
                let payload = serde_json::to_string(&relayed)?;
                store.publish(RELAY_CHANNEL, &payload)
            })
            .await;
            if let Err(e) = published {
                warn!("Relaying event for group {} failed: {}", group, e);
            }
        }
        delivered
    }

    pub async fn local_members(&self, group: &str) -> usize {
        self.inner
            .groups
            .read()
            .await
            .get(group)
            .map_or(0, HashMap::len)
    }

    /// Subscribe to the relay channel and deliver events published by other
    /// instances to local members. Runs until the dispatcher is dropped.
    pub async fn start_relay(&self) -> anyhow::Result<()> {
        let Some(store) = self.inner.relay.clone() else {
            return Ok(());
        };
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        run_blocking(move || {
            store.subscribe(RELAY_CHANNEL, Box::new(move |payload| tx.send(payload).is_ok()))
        })
        .await?;

        let inner: Weak<DispatcherInner> = Arc::downgrade(&self.inner);
        let origin = self.inner.origin;
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let Some(inner) = inner.upgrade() else { break };
                let relayed: Relayed = match serde_json::from_str(&payload) {
                    Ok(relayed) => relayed,
                    Err(e) => {
                        warn!("Dropping malformed relayed event: {}", e);
                        continue;
                    }
                };
                if relayed.origin == origin {
                    continue;
                }
                let delivered = deliver_local(&inner, &relayed.group, &relayed.event).await;
                if delivered > 0 {
                    debug!("Relayed event for {} reached {} connections", relayed.group, delivered);
                }
            }
        });
        Ok(())
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver_local(inner: &DispatcherInner, group: &str, event: &GroupEvent) -> usize {
    let groups = inner.groups.read().await;
    let Some(members) = groups.get(group) else {
        return 0;
    };
    members
        .values()
        .filter(|tx| tx.send(event.clone()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> GroupEvent {
        GroupEvent::Chat(ChatEvent::alert(
            "bora",
            rentchat_types::events::OpponentState::Online,
        ))
    }

    #[tokio::test]
    async fn group_send_reaches_each_member_once() {
        let dispatcher = Dispatcher::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        dispatcher.group_add("chat_1", a, tx_a).await;
        dispatcher.group_add("chat_1", b, tx_b).await;

        assert_eq!(dispatcher.group_send("chat_1", alert()).await, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_a.try_recv().is_err());
        assert_eq!(dispatcher.group_send("chat_2", alert()).await, 0);
    }

    #[tokio::test]
    async fn discard_removes_member_and_empty_group() {
        let dispatcher = Dispatcher::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        dispatcher.group_add("chat_1", id, tx).await;
        dispatcher.group_discard("chat_1", id).await;

        assert_eq!(dispatcher.local_members("chat_1").await, 0);
        assert_eq!(dispatcher.group_send("chat_1", alert()).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_not_counted() {
        let dispatcher = Dispatcher::new();
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.group_add("g", Uuid::new_v4(), tx).await;
        drop(rx);
        assert_eq!(dispatcher.group_send("g", alert()).await, 0);
    }

    async fn relayed_pair() -> (Dispatcher, Dispatcher) {
        let store: Arc<dyn EphemeralStore> = Arc::new(rentchat_ephemeral::MemoryStore::new());
        let first = Dispatcher::relayed(store.clone());
        let second = Dispatcher::relayed(store);
        first.start_relay().await.unwrap();
        second.start_relay().await.unwrap();
        (first, second)
    }

    async fn recv_soon(rx: &mut mpsc::UnboundedReceiver<GroupEvent>) -> Option<GroupEvent> {
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn events_reach_members_on_other_instances() {
        let (first, second) = relayed_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        second.group_add("chat_1", Uuid::new_v4(), tx).await;

        // Nobody is local to the sender; the relay carries it.
        assert_eq!(first.group_send("chat_1", alert()).await, 0);
        assert!(matches!(recv_soon(&mut rx).await, Some(GroupEvent::Chat(_))));
    }

    #[tokio::test]
    async fn own_relayed_events_are_not_delivered_twice() {
        let (first, _second) = relayed_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        first.group_add("chat_1", Uuid::new_v4(), tx).await;

        assert_eq!(first.group_send("chat_1", alert()).await, 1);
        assert!(rx.try_recv().is_ok());
        assert!(recv_soon(&mut rx).await.is_none());
    }
}
