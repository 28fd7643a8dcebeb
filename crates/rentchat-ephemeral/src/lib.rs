//! Boundary to the shared, volatile key-value store.
//!
//! All service instances reach the same store. It holds the per-room pending
//! message lists, the connection-group memberships that presence is derived
//! from, and the publish/subscribe channel that relays group events between
//! instances. Mutating a list with read-modify-write goes through
//! [`EphemeralStore::watch_list`]: the returned [`ListWatch`] commits only if
//! nobody touched the key since it was watched.
//!
//! Calls are blocking; async callers dispatch them onto the blocking pool.

pub mod memory;
pub mod redis_store;

use anyhow::Result;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Write applied atomically by [`ListWatch::commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListWrite {
    /// Remove the key.
    Delete,
    /// Delete the key and push these values in order. An empty vector
    /// leaves the key absent.
    Replace(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The key changed after it was watched; nothing was written.
    Conflict,
}

/// A snapshot of a list taken under watch.
pub trait ListWatch: Send {
    /// The full list as it was when watched, oldest first.
    fn values(&self) -> &[String];

    fn commit(self: Box<Self>, write: ListWrite) -> Result<CommitOutcome>;
}

/// Receives every payload published on a subscribed channel, on a store
/// thread. Returning false ends the subscription.
pub type Subscriber = Box<dyn Fn(String) -> bool + Send + Sync>;

pub trait EphemeralStore: Send + Sync {
    /// Append to the tail of a list; returns the new length.
    fn list_push(&self, key: &str, value: &str) -> Result<usize>;

    fn list_len(&self, key: &str) -> Result<usize>;

    /// Inclusive range with Redis index semantics (negative counts from the
    /// tail).
    fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    fn exists(&self, key: &str) -> Result<bool>;

    /// Watch `key` and read the whole list.
    fn watch_list(&self, key: &str) -> Result<Box<dyn ListWatch>>;

    /// Keys starting with `prefix`.
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Add `member` to a scored set or move its score to `score`. Returns
    /// true when the member was not already present.
    fn scored_add(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// Returns true when the member was present.
    fn scored_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Drop members scored below `min_score`, then count the rest.
    fn scored_prune_card(&self, key: &str, min_score: i64) -> Result<usize>;

    /// Send `payload` to every current subscriber of `channel`, on any
    /// instance.
    fn publish(&self, channel: &str, payload: &str) -> Result<()>;

    /// Deliver every later publish on `channel` to `subscriber`. The
    /// subscription is live when this returns.
    fn subscribe(&self, channel: &str, subscriber: Subscriber) -> Result<()>;
}
