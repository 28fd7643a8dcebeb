use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;

use crate::{CommitOutcome, EphemeralStore, ListWatch, ListWrite, Subscriber};

/// In-process store. Watch semantics come from a per-key version counter
/// that every list mutation bumps; versions outlive deletes so a key that
/// is deleted and re-created still reads as modified.
///
/// Only shared between clones of the same value, so it coordinates a single
/// process. Publish is a loopback to the subscribers registered on those
/// clones.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    lists: HashMap<String, Vec<String>>,
    scored: HashMap<String, HashMap<String, i64>>,
    versions: HashMap<String, u64>,
    subscribers: HashMap<String, Vec<Arc<Subscriber>>>,
}

impl MemoryState {
    fn bump(&mut self, key: &str) {
        *self.versions.entry(key.to_string()).or_default() += 1;
    }

    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or_default()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        lock_state(&self.inner)
    }
}

fn lock_state(inner: &Mutex<MemoryState>) -> Result<MutexGuard<'_, MemoryState>> {
    inner
        .lock()
        .map_err(|e| anyhow::anyhow!("memory store lock poisoned: {}", e))
}

/// Resolve a Redis-style inclusive range against a list of `len` items.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len || stop < 0 {
        return None;
    }
    Some((start as usize, stop as usize))
}

impl EphemeralStore for MemoryStore {
    fn list_push(&self, key: &str, value: &str) -> Result<usize> {
        let mut state = self.lock()?;
        state.bump(key);
        let list = state.lists.entry(key.to_string()).or_default();
        list.push(value.to_string());
        Ok(list.len())
    }

    fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lock()?.lists.get(key).map_or(0, Vec::len))
    }

    fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let state = self.lock()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(vec![]);
        };
        Ok(match resolve_range(list.len(), start, stop) {
            Some((from, to)) => list[from..=to].to_vec(),
            None => vec![],
        })
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let state = self.lock()?;
        Ok(state.lists.contains_key(key) || state.scored.contains_key(key))
    }

    fn watch_list(&self, key: &str) -> Result<Box<dyn ListWatch>> {
        let state = self.lock()?;
        Ok(Box::new(MemoryListWatch {
            inner: self.inner.clone(),
            key: key.to_string(),
            version: state.version(key),
            values: state.lists.get(key).cloned().unwrap_or_default(),
        }))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.lock()?;
        let mut keys: Vec<String> = state
            .lists
            .keys()
            .chain(state.scored.keys())
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn scored_add(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut state = self.lock()?;
        Ok(state
            .scored
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score)
            .is_none())
    }

    fn scored_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut state = self.lock()?;
        let Some(set) = state.scored.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member).is_some();
        if set.is_empty() {
            state.scored.remove(key);
        }
        Ok(removed)
    }

    fn scored_prune_card(&self, key: &str, min_score: i64) -> Result<usize> {
        let mut state = self.lock()?;
        let Some(set) = state.scored.get_mut(key) else {
            return Ok(0);
        };
        set.retain(|_, score| *score >= min_score);
        let card = set.len();
        if card == 0 {
            state.scored.remove(key);
        }
        Ok(card)
    }

    fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        // Subscribers run outside the lock; they may call back into the store.
        let subscribers = self
            .lock()?
            .subscribers
            .get(channel)
            .cloned()
            .unwrap_or_default();
        let ended: Vec<Arc<Subscriber>> = subscribers
            .into_iter()
            .filter(|subscriber| !(**subscriber)(payload.to_string()))
            .collect();
        if !ended.is_empty() {
            let mut state = self.lock()?;
            if let Some(live) = state.subscribers.get_mut(channel) {
                live.retain(|s| !ended.iter().any(|e| Arc::ptr_eq(s, e)));
            }
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str, subscriber: Subscriber) -> Result<()> {
        self.lock()?
            .subscribers
            .entry(channel.to_string())
            .or_default()
            .push(Arc::new(subscriber));
        Ok(())
    }
}

struct MemoryListWatch {
    inner: Arc<Mutex<MemoryState>>,
    key: String,
    version: u64,
    values: Vec<String>,
}

impl ListWatch for MemoryListWatch {
    fn values(&self) -> &[String] {
        &self.values
    }

    fn commit(self: Box<Self>, write: ListWrite) -> Result<CommitOutcome> {
        let mut state = lock_state(&self.inner)?;
        if state.version(&self.key) != self.version {
            return Ok(CommitOutcome::Conflict);
        }
        state.bump(&self.key);
        match write {
            ListWrite::Delete => {
                state.lists.remove(&self.key);
            }
            ListWrite::Replace(values) if values.is_empty() => {
                state.lists.remove(&self.key);
            }
            ListWrite::Replace(values) => {
                state.lists.insert(self.key.clone(), values);
            }
        }
        Ok(CommitOutcome::Committed)
    }
}
