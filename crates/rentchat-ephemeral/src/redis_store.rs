use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use redis::Commands;
use tracing::{info, warn};

use crate::{CommitOutcome, EphemeralStore, ListWatch, ListWrite, Subscriber};

/// Idle watch connections kept for reuse.
const MAX_IDLE_WATCH_CONNS: usize = 8;

/// Pause before a lost subscription reconnects.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

type WatchPool = Arc<Mutex<Vec<redis::Connection>>>;

/// Redis-backed store shared by every service instance.
///
/// Plain commands go through one shared connection. `WATCH` state belongs to
/// the connection that issued it, so each watch checks out a connection of
/// its own from a small pool and hands it back once committed or unwatched.
/// Every subscription runs on a dedicated thread and connection.
pub struct RedisStore {
    client: redis::Client,
    conn: Mutex<redis::Connection>,
    watch_pool: WatchPool,
}

impl RedisStore {
    pub fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let mut conn = client.get_connection().context("redis connection failed")?;
        redis::cmd("PING")
            .query::<String>(&mut conn)
            .context("redis ping failed")?;
        info!("Connected to redis at {}", url);
        Ok(Self {
            client,
            conn: Mutex::new(conn),
            watch_pool: Arc::default(),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, redis::Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("redis connection lock poisoned: {}", e))
    }

    fn checkout(&self) -> Result<redis::Connection> {
        let idle = self
            .watch_pool
            .lock()
            .map_err(|e| anyhow::anyhow!("redis watch pool lock poisoned: {}", e))?
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => self
                .client
                .get_connection()
                .context("redis watch connection failed"),
        }
    }
}

fn release(pool: &Mutex<Vec<redis::Connection>>, conn: redis::Connection) {
    if let Ok(mut idle) = pool.lock() {
        if idle.len() < MAX_IDLE_WATCH_CONNS {
            idle.push(conn);
        }
    }
}

impl EphemeralStore for RedisStore {
    fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        Ok(self.conn()?.rpush(key, value)?)
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.conn()?.llen(key)?)
    }

    fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        Ok(self.conn()?.lrange(key, start, stop)?)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.conn()?.exists(key)?)
    }

    fn watch_list(&self, key: &str) -> Result<Box<dyn ListWatch>> {
        // A connection that fails here is dropped, not pooled.
        let mut conn = self.checkout()?;
        redis::cmd("WATCH").arg(key).query::<()>(&mut conn)?;
        let values: Vec<String> = conn.lrange(key, 0, -1)?;
        Ok(Box::new(RedisListWatch {
            conn: Some(conn),
            pool: self.watch_pool.clone(),
            key: key.to_string(),
            values,
        }))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.conn()?;
        let mut keys: Vec<String> = conn.scan_match::<_, String>(format!("{prefix}*"))?.collect();
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn scored_add(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let added: usize = self.conn()?.zadd(key, member, score)?;
        Ok(added > 0)
    }

    fn scored_remove(&self, key: &str, member: &str) -> Result<bool> {
        let removed: usize = self.conn()?.zrem(key, member)?;
        Ok(removed > 0)
    }

    fn scored_prune_card(&self, key: &str, min_score: i64) -> Result<usize> {
        let (card,): (usize,) = redis::pipe()
            .atomic()
            .cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg("-inf")
            .arg(format!("({min_score}"))
            .ignore()
            .zcard(key)
            .query(&mut *self.conn()?)?;
        Ok(card)
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let _receivers: i64 = self.conn()?.publish(channel, payload)?;
        Ok(())
    }

    fn subscribe(&self, channel: &str, subscriber: Subscriber) -> Result<()> {
        let conn = self
            .client
            .get_connection()
            .context("redis subscriber connection failed")?;
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel(1);
        let client = self.client.clone();
        let channel = channel.to_string();
        std::thread::Builder::new()
            .name("redis-subscriber".into())
            .spawn(move || run_subscriber(client, conn, channel, subscriber, ready_tx))
            .context("failed to start redis subscriber")?;
        ready_rx.recv().context("redis subscriber exited before subscribing")?
    }
}

/// Subscriber thread body. Reconnects after a lost connection; publishes
/// made while disconnected are missed.
fn run_subscriber(
    client: redis::Client,
    mut conn: redis::Connection,
    channel: String,
    subscriber: Subscriber,
    ready: SyncSender<Result<()>>,
) {
    let mut ready = Some(ready);
    loop {
        match listen(&mut conn, &channel, &subscriber, &mut ready) {
            Ok(()) => return,
            Err(e) => {
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(e.into()));
                    return;
                }
                warn!("Redis subscription to {} lost: {}", channel, e);
            }
        }
        loop {
            std::thread::sleep(RESUBSCRIBE_DELAY);
            match client.get_connection() {
                Ok(fresh) => {
                    conn = fresh;
                    info!("Resubscribing to {}", channel);
                    break;
                }
                Err(e) => warn!("Redis reconnect for {} failed: {}", channel, e),
            }
        }
    }
}

/// Returns `Ok` once the subscriber asks to stop.
fn listen(
    conn: &mut redis::Connection,
    channel: &str,
    subscriber: &Subscriber,
    ready: &mut Option<SyncSender<Result<()>>>,
) -> redis::RedisResult<()> {
    let mut pubsub = conn.as_pubsub();
    pubsub.subscribe(channel)?;
    if let Some(ready) = ready.take() {
        let _ = ready.send(Ok(()));
    }
    loop {
        let message = pubsub.get_message()?;
        match message.get_payload::<String>() {
            Ok(payload) => {
                if !(**subscriber)(payload) {
                    return Ok(());
                }
            }
            Err(e) => warn!("Dropping undecodable payload on {}: {}", channel, e),
        }
    }
}

struct RedisListWatch {
    /// `None` once committed.
    conn: Option<redis::Connection>,
    pool: WatchPool,
    key: String,
    values: Vec<String>,
}

impl ListWatch for RedisListWatch {
    fn values(&self) -> &[String] {
        &self.values
    }

    fn commit(mut self: Box<Self>, write: ListWrite) -> Result<CommitOutcome> {
        let mut conn = self.conn.take().context("watch already committed")?;
        let mut pipe = redis::pipe();
        pipe.atomic().del(&self.key).ignore();
        if let ListWrite::Replace(values) = &write {
            if !values.is_empty() {
                pipe.rpush(&self.key, values).ignore();
            }
        }
        // EXEC replies nil when a watched key changed. Either way the
        // connection no longer watches anything.
        let reply: Option<()> = pipe.query(&mut conn)?;
        release(&self.pool, conn);
        Ok(match reply {
            Some(()) => CommitOutcome::Committed,
            None => CommitOutcome::Conflict,
        })
    }
}

impl Drop for RedisListWatch {
    fn drop(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            if redis::cmd("UNWATCH").query::<()>(&mut conn).is_ok() {
                release(&self.pool, conn);
            }
        }
    }
}

/// These run against a live server and are skipped unless
/// `RENTCHAT_TEST_REDIS_URL` is set, e.g. `redis://127.0.0.1:6379`.
#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> Option<RedisStore> {
        let url = std::env::var("RENTCHAT_TEST_REDIS_URL").ok()?;
        Some(RedisStore::connect(&url).unwrap())
    }

    fn key(name: &str) -> String {
        format!("rentchat-test:{}:{}", std::process::id(), name)
    }

    fn cleanup(store: &RedisStore, keys: &[&str]) {
        let _: usize = store.conn().unwrap().del(keys).unwrap();
    }

    fn idle_watch_conns(store: &RedisStore) -> usize {
        store.watch_pool.lock().unwrap().len()
    }

    #[test]
    fn interleaved_push_aborts_commit() {
        let Some(store) = test_store() else { return };
        let k = key("conflict");
        cleanup(&store, &[&k]);
        for v in ["a", "b", "c"] {
            store.list_push(&k, v).unwrap();
        }

        let watch = store.watch_list(&k).unwrap();
        assert_eq!(watch.values(), ["a", "b", "c"]);
        store.list_push(&k, "late").unwrap();
        assert_eq!(watch.commit(ListWrite::Delete).unwrap(), CommitOutcome::Conflict);
        assert_eq!(store.list_len(&k).unwrap(), 4);

        let watch = store.watch_list(&k).unwrap();
        assert_eq!(watch.commit(ListWrite::Delete).unwrap(), CommitOutcome::Committed);
        assert!(!store.exists(&k).unwrap());
    }

    #[test]
    fn replace_keeps_order_and_empty_replace_removes() {
        let Some(store) = test_store() else { return };
        let k = key("replace");
        cleanup(&store, &[&k]);
        store.list_push(&k, "a").unwrap();
        store.list_push(&k, "b").unwrap();

        let rewritten = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let watch = store.watch_list(&k).unwrap();
        assert_eq!(
            watch.commit(ListWrite::Replace(rewritten)).unwrap(),
            CommitOutcome::Committed
        );
        assert_eq!(store.list_range(&k, 0, -1).unwrap(), ["x", "y", "z"]);

        let watch = store.watch_list(&k).unwrap();
        watch.commit(ListWrite::Replace(vec![])).unwrap();
        assert!(!store.exists(&k).unwrap());
    }

    #[test]
    fn dropped_watch_returns_a_clean_connection() {
        let Some(store) = test_store() else { return };
        let k = key("unwatch");
        cleanup(&store, &[&k]);
        store.list_push(&k, "a").unwrap();

        drop(store.watch_list(&k).unwrap());
        assert_eq!(idle_watch_conns(&store), 1);

        // The pooled connection must not still watch the key from before.
        store.list_push(&k, "b").unwrap();
        let watch = store.watch_list(&k).unwrap();
        assert_eq!(idle_watch_conns(&store), 0);
        assert_eq!(watch.commit(ListWrite::Delete).unwrap(), CommitOutcome::Committed);
        assert_eq!(idle_watch_conns(&store), 1);
    }

    #[test]
    fn keys_are_found_by_prefix() {
        let Some(store) = test_store() else { return };
        let prefix = key("scan:");
        let (one, two, other) = (format!("{prefix}1"), format!("{prefix}2"), key("elsewhere"));
        cleanup(&store, &[&one, &two, &other]);
        store.list_push(&two, "x").unwrap();
        store.list_push(&one, "x").unwrap();
        store.list_push(&other, "x").unwrap();

        assert_eq!(store.keys_with_prefix(&prefix).unwrap(), [one.clone(), two.clone()]);
        cleanup(&store, &[&one, &two, &other]);
    }

    #[test]
    fn stale_scored_members_are_pruned() {
        let Some(store) = test_store() else { return };
        let k = key("presence");
        cleanup(&store, &[&k]);
        assert!(store.scored_add(&k, "old", 100).unwrap());
        assert!(store.scored_add(&k, "live", 500).unwrap());
        assert!(!store.scored_add(&k, "live", 900).unwrap());

        assert_eq!(store.scored_prune_card(&k, 200).unwrap(), 1);
        assert!(!store.scored_remove(&k, "old").unwrap());
        assert!(store.scored_remove(&k, "live").unwrap());
        assert_eq!(store.scored_prune_card(&k, 0).unwrap(), 0);
    }

    #[test]
    fn published_payloads_reach_subscribers() {
        let Some(store) = test_store() else { return };
        let channel = key("events");
        let (tx, rx) = std::sync::mpsc::channel();
        store
            .subscribe(&channel, Box::new(move |payload| tx.send(payload).is_ok()))
            .unwrap();

        store.publish(&channel, "hello").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), "hello");
    }
}
