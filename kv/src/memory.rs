//! In-process KV implementation
//!
//! Serves as the failover target when the remote store is unreachable and as
//! the store for tests. Semantics mirror the remote store: lazy TTL expiry,
//! sorted sets ordered by (score, member), broadcast-backed pub/sub. Nothing
//! survives a restart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::debug;

use crate::kv::{glob_match, Kv, Subscription, ZEntry};
use crate::KvError;

/// Capacity of each pub/sub channel before slow subscribers lag
const CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

#[derive(Default)]
struct MemoryInner {
    strings: HashMap<String, Entry>,
    zsets: HashMap<String, Vec<ZEntry>>,
}

impl MemoryInner {
    /// Drop the key if its TTL has lapsed; returns whether it still exists
    fn purge_expired(&mut self, key: &str) -> bool {
        if let Some(entry) = self.strings.get(key) {
            if entry.expired() {
                self.strings.remove(key);
                return false;
            }
            return true;
        }
        false
    }
}

/// In-memory [`Kv`] with the same contract as the remote store
pub struct MemoryKv {
    inner: Mutex<MemoryInner>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
            channels: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.inner.lock().await;
        if !inner.purge_expired(key) {
            return Ok(None);
        }
        Ok(inner.strings.get(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, KvError> {
        let mut inner = self.inner.lock().await;
        inner.purge_expired(key);

        let (current, expires_at) = match inner.strings.get(key) {
            Some(entry) => {
                let n: i64 = entry.value.parse().map_err(|_| KvError::NotAnInteger {
                    key: key.to_string(),
                })?;
                (n, entry.expires_at)
            }
            None => (0, None),
        };

        let next = current + 1;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        if !inner.purge_expired(key) {
            return Ok(false);
        }
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError> {
        let mut inner = self.inner.lock().await;
        if !inner.purge_expired(key) {
            return Ok(None);
        }
        let remaining = inner
            .strings
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()));
        Ok(remaining)
    }

    async fn del(&self, key: &str) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        let had_string = inner.strings.remove(key).is_some();
        let had_zset = inner.zsets.remove(key).is_some();
        Ok(had_string || had_zset)
    }

    async fn scan(&self, pattern: &str, _cursor: u64, _count: usize) -> Result<(u64, Vec<String>), KvError> {
        let mut inner = self.inner.lock().await;

        // Purge lapsed keys first so the scan never reports them
        let expired: Vec<String> = inner
            .strings
            .iter()
            .filter(|(_, e)| e.expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            inner.strings.remove(&key);
        }

        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();
        keys.sort();

        // The whole keyspace fits in one batch in-process
        Ok((0, keys))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError> {
        let mut inner = self.inner.lock().await;
        let set = inner.zsets.entry(key.to_string()).or_default();
        set.retain(|e| e.member != member);
        set.push(ZEntry::new(member, score));
        set.sort_by(|a, b| {
            a.score
                .partial_cmp(&b.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.member.cmp(&b.member))
        });
        Ok(())
    }

    async fn zpopmin(&self, key: &str) -> Result<Option<ZEntry>, KvError> {
        let mut inner = self.inner.lock().await;
        let popped = match inner.zsets.get_mut(key) {
            Some(set) if !set.is_empty() => Some(set.remove(0)),
            _ => None,
        };
        if inner.zsets.get(key).is_some_and(|s| s.is_empty()) {
            inner.zsets.remove(key);
        }
        Ok(popped)
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ZEntry>, KvError> {
        let inner = self.inner.lock().await;
        let Some(set) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };

        let len = set.len() as isize;
        let resolve = |i: isize| -> isize {
            if i < 0 {
                (len + i).max(0)
            } else {
                i.min(len)
            }
        };
        let from = resolve(start);
        let to = (resolve(stop) + 1).min(len);
        if from >= to {
            return Ok(Vec::new());
        }
        Ok(set[from as usize..to as usize].to_vec())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError> {
        let mut inner = self.inner.lock().await;
        let Some(set) = inner.zsets.get_mut(key) else {
            return Ok(false);
        };
        let before = set.len();
        set.retain(|e| e.member != member);
        let removed = set.len() != before;
        if set.is_empty() {
            inner.zsets.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<usize, KvError> {
        let inner = self.inner.lock().await;
        Ok(inner.zsets.get(key).map(|s| s.len()).unwrap_or(0))
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError> {
        let channels = self.channels.lock().await;
        if let Some(tx) = channels.get(channel) {
            // No subscribers is fine, fire-and-forget
            let _ = tx.send(message.to_string());
        }
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError> {
        let mut channels = self.channels.lock().await;
        let tx = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone();
        drop(channels);

        let mut broadcast_rx = tx.subscribe();
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                match broadcast_rx.recv().await {
                    Ok(msg) => {
                        if out_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "memory pub/sub subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(out_rx))
    }

    async fn ping(&self) -> Result<(), KvError> {
        Ok(())
    }
}
