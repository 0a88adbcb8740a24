//! The `Kv` contract shared by all store implementations

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::KvError;

/// A member of a sorted set together with its score
#[derive(Debug, Clone, PartialEq)]
pub struct ZEntry {
    pub member: String,
    pub score: f64,
}

impl ZEntry {
    pub fn new(member: impl Into<String>, score: f64) -> Self {
        Self {
            member: member.into(),
            score,
        }
    }
}

/// A pub/sub subscription handle
///
/// Messages arrive in publish order per channel. The stream ends when the
/// backing connection or channel goes away.
pub struct Subscription {
    rx: mpsc::Receiver<String>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Receive the next message, or None once the channel is closed
    pub async fn recv(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Operations the daemon requires from its key-value store
///
/// The surface matches what the job state store, the priority queues, and
/// the validation/rate-limit counters consume: plain strings with TTLs,
/// atomic counters, sorted sets, cursor scans, and fire-and-forget pub/sub.
#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// Set with a TTL; the key is evicted once the TTL lapses
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    /// Atomically increment an integer key, creating it at 0 first
    async fn incr(&self, key: &str) -> Result<i64, KvError>;

    /// Set a TTL on an existing key; false if the key does not exist
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Remaining TTL, or None when the key is missing or has no expiry
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, KvError>;

    async fn del(&self, key: &str) -> Result<bool, KvError>;

    /// Cursor-based key scan with a `*` glob pattern
    ///
    /// Returns the next cursor (0 when iteration is complete) and a batch of
    /// matching keys. Callers must loop until the cursor returns to 0.
    async fn scan(&self, pattern: &str, cursor: u64, count: usize) -> Result<(u64, Vec<String>), KvError>;

    /// Add a member to a sorted set, replacing its score if present
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<(), KvError>;

    /// Atomically pop the member with the lowest score
    async fn zpopmin(&self, key: &str) -> Result<Option<ZEntry>, KvError>;

    /// Members ordered by ascending score; negative indices count from the end
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<ZEntry>, KvError>;

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, KvError>;

    async fn zcard(&self, key: &str) -> Result<usize, KvError>;

    /// Fire-and-forget publish; no subscribers is not an error
    async fn publish(&self, channel: &str, message: &str) -> Result<(), KvError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, KvError>;

    /// Liveness probe
    async fn ping(&self) -> Result<(), KvError>;
}

/// Match a key against a scan pattern supporting `*` wildcards
///
/// Only the glob subset the daemon uses: literal text and `*` matching any
/// run of characters.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let mut rest = key;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }

    // Pattern ended with '*'
    true
}
