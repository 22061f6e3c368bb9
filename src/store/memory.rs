//! In-process coordination store
//!
//! Keeps etcd's observable semantics: every mutation bumps a global index and
//! is recorded in a bounded event history, TTL lapses surface as `expire`
//! events, and a watch blocks until a matching event exists. Used by tests
//! and single-node runs.

use super::{ChangeEvent, CoordinationStore, Listing, StoreNode};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Events retained for watchers that fall behind (etcd keeps 1000)
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug)]
struct Entry {
    value: String,
    modified_index: u64,
    expires_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    entries: BTreeMap<String, Entry>,
    index: u64,
    history: VecDeque<ChangeEvent>,
    history_limit: usize,
    /// Index of the newest event evicted from history
    cleared_through: u64,
}

impl Inner {
    fn record(&mut self, action: &str, key: &str, value: String) -> u64 {
        self.index += 1;
        self.history.push_back(ChangeEvent {
            action: action.to_string(),
            node: StoreNode {
                key: key.to_string(),
                value,
                modified_index: self.index,
            },
            index: self.index,
        });
        while self.history.len() > self.history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.cleared_through = evicted.index;
            }
        }
        self.index
    }

    /// Drop lapsed entries, oldest deadline first. Returns whether anything expired.
    fn sweep(&mut self, now: Instant) -> bool {
        let mut expired: Vec<(Instant, String)> = self
            .entries
            .iter()
            .filter_map(|(key, entry)| match entry.expires_at {
                Some(at) if at <= now => Some((at, key.clone())),
                _ => None,
            })
            .collect();
        if expired.is_empty() {
            return false;
        }
        expired.sort();

        for (_, key) in expired {
            self.entries.remove(&key);
            self.record("expire", &key, String::new());
        }
        true
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.entries.values().filter_map(|e| e.expires_at).min()
    }

    fn find_event(&self, prefix: &str, from_index: u64) -> Option<ChangeEvent> {
        self.history
            .iter()
            .find(|event| event.index >= from_index && is_under(prefix, &event.node.key))
            .cloned()
    }

    fn put(&mut self, action: &str, key: &str, value: &str, ttl: Option<Duration>) {
        let index = self.record(action, key, value.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                modified_index: index,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
    }
}

fn normalize(key: &str) -> String {
    format!("/{}", key.trim_matches('/'))
}

fn is_under(prefix: &str, key: &str) -> bool {
    key == prefix
        || key
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// In-memory store
pub struct MemoryStore {
    inner: Mutex<Inner>,
    changed: Notify,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                index: 0,
                history: VecDeque::new(),
                history_limit: history_limit.max(1),
                cleared_through: 0,
            }),
            changed: Notify::new(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.sweep(Instant::now()) {
            self.changed.notify_waiters();
        }
        inner
    }

    /// Current store index
    pub fn index(&self) -> u64 {
        self.inner().index
    }

    /// Value stored at `key`, if live
    pub fn get(&self, key: &str) -> Option<String> {
        self.inner()
            .entries
            .get(&normalize(key))
            .map(|entry| entry.value.clone())
    }

    /// Delete `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let key = normalize(key);
        let existed = {
            let mut inner = self.inner();
            match inner.entries.remove(&key) {
                Some(_) => {
                    inner.record("delete", &key, String::new());
                    true
                }
                None => false,
            }
        };
        if existed {
            self.changed.notify_waiters();
        }
        existed
    }

    /// Delete `key` and everything below it. Like a recursive directory
    /// delete in etcd, this records one `delete` event for `key` and none for
    /// the entries it took with it. Returns the number of entries removed.
    pub fn delete_recursive(&self, key: &str) -> usize {
        let key = normalize(key);
        let removed = {
            let mut inner = self.inner();
            let doomed: Vec<String> = inner
                .entries
                .keys()
                .filter(|k| is_under(&key, k))
                .cloned()
                .collect();
            for k in &doomed {
                inner.entries.remove(k);
            }
            if !doomed.is_empty() {
                inner.record("delete", &key, String::new());
            }
            doomed.len()
        };
        if removed > 0 {
            self.changed.notify_waiters();
        }
        removed
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Listing> {
        let prefix = normalize(prefix);
        let inner = self.inner();
        let nodes = inner
            .entries
            .iter()
            .filter(|(key, _)| is_under(&prefix, key) && key.as_str() != prefix)
            .map(|(key, entry)| StoreNode {
                key: key.clone(),
                value: entry.value.clone(),
                modified_index: entry.modified_index,
            })
            .collect();
        Ok(Listing {
            nodes,
            index: inner.index,
        })
    }

    async fn watch(&self, prefix: &str, from_index: u64) -> Result<ChangeEvent> {
        let prefix = normalize(prefix);
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_expiry = {
                let inner = self.inner();
                if inner.cleared_through > 0 && from_index <= inner.cleared_through {
                    return Err(Error::IndexCleared { index: from_index });
                }
                if let Some(event) = inner.find_event(&prefix, from_index) {
                    return Ok(event);
                }
                inner.next_expiry()
            };

            match next_expiry {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let key = normalize(key);
        {
            let mut inner = self.inner();
            if inner.entries.contains_key(&key) {
                return Ok(false);
            }
            inner.put("create", &key, value, ttl);
        }
        self.changed.notify_waiters();
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = normalize(key);
        self.inner().put("set", &key, value, ttl);
        self.changed.notify_waiters();
        Ok(())
    }
}
